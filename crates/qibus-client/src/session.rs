//! Sessions: name resolution, connection pooling and directory tracking.
//!
//! A session connects to a service directory, keeps its service list fresh
//! by subscribing to the `serviceAdded`/`serviceRemoved` signals, and
//! hands out proxies by service name. Clients are pooled per endpoint URL
//! and evicted when their endpoint closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use qibus_net::{consumer, dial, machine_id, Endpoint};
use qibus_proto::{ByteReader, ByteWriter, ObjectReference, ServiceEvent, ServiceInfo};

use crate::auth;
use crate::client::{Client, ClientConfig};
use crate::errors::ClientError;
use crate::proxy::Proxy;

/// Service id of the directory itself.
pub const DIRECTORY_SERVICE_ID: u32 = 1;
/// Object id of the directory object.
pub const DIRECTORY_OBJECT_ID: u32 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session configuration: credentials plus client tuning.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// User name proposed during authentication; empty to omit.
    pub user: String,
    /// Token proposed during authentication; empty to omit.
    pub token: String,
    /// Configuration applied to every pooled client.
    pub client: ClientConfig,
}

/// A connection to a qi-messaging bus through its service directory.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    directory: Proxy,
    services: Mutex<Vec<ServiceInfo>>,
    pool: Mutex<HashMap<String, Client>>,
}

impl Session {
    /// Connect to the directory at `addr` with anonymous credentials.
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        Self::connect_with(addr, SessionConfig::default()).await
    }

    /// Connect to the directory at `addr`.
    pub async fn connect_with(addr: &str, config: SessionConfig) -> Result<Self, ClientError> {
        let client = connect_client(addr, &config).await?;
        let directory =
            Proxy::connect(client.clone(), DIRECTORY_SERVICE_ID, DIRECTORY_OBJECT_ID).await?;

        let inner = Arc::new(SessionInner {
            config,
            directory,
            services: Mutex::new(Vec::new()),
            pool: Mutex::new(HashMap::new()),
        });
        lock(&inner.pool).insert(addr.to_string(), client.clone());

        let session = Self { inner };
        session.evict_on_close(addr, client.endpoint());
        session.refresh_services().await?;
        session.watch_directory().await?;
        Ok(session)
    }

    /// The currently known services.
    pub fn services(&self) -> Vec<ServiceInfo> {
        lock(&self.inner.services).clone()
    }

    /// The directory proxy.
    pub fn directory(&self) -> &Proxy {
        &self.inner.directory
    }

    /// Resolve a service name and return a proxy to one of its objects.
    pub async fn proxy(&self, name: &str, object: u32) -> Result<Proxy, ClientError> {
        let info = self
            .find(|info| info.name == name)
            .ok_or_else(|| ClientError::ServiceNotFound(name.to_string()))?;
        let client = self.client_for(&info).await?;
        Proxy::connect(client, info.service_id, object).await
    }

    /// Turn an object reference into a proxy, reusing its embedded
    /// meta-object when present.
    pub async fn object(&self, reference: &ObjectReference) -> Result<Proxy, ClientError> {
        let info = self
            .find(|info| info.service_id == reference.service_id)
            .ok_or_else(|| ClientError::ServiceNotFound(reference.service_id.to_string()))?;
        let client = self.client_for(&info).await?;
        if reference.is_meta_object {
            Ok(Proxy::from_meta(
                client,
                qibus_proto::meta::full_meta(&reference.meta),
                reference.service_id,
                reference.object_id,
            ))
        } else {
            Proxy::connect(client, reference.service_id, reference.object_id).await
        }
    }

    fn find(&self, predicate: impl Fn(&ServiceInfo) -> bool) -> Option<ServiceInfo> {
        lock(&self.inner.services).iter().find(|info| predicate(info)).cloned()
    }

    /// Fetch the full service list from the directory.
    async fn refresh_services(&self) -> Result<(), ClientError> {
        let response = self.inner.directory.call("services", Bytes::new()).await?;
        let mut r = ByteReader::new(&response);
        let count = r.read_count(4)?;
        let mut services = Vec::with_capacity(count);
        for _ in 0..count {
            services.push(ServiceInfo::read(&mut r)?);
        }
        *lock(&self.inner.services) = services;
        Ok(())
    }

    /// Subscribe to directory change signals and keep the list fresh.
    async fn watch_directory(&self) -> Result<(), ClientError> {
        let mut added = self.inner.directory.subscribe("serviceAdded").await?;
        let mut removed = self.inner.directory.subscribe("serviceRemoved").await?;

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = added.next().await {
                match decode_service_event(&payload) {
                    Ok(event) => {
                        if let Err(err) = session.on_service_added(&event).await {
                            tracing::warn!("cannot track added service {}: {err}", event.name);
                        }
                    },
                    Err(err) => tracing::warn!("malformed serviceAdded event: {err}"),
                }
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = removed.next().await {
                match decode_service_event(&payload) {
                    Ok(event) => {
                        lock(&session.inner.services)
                            .retain(|info| info.service_id != event.service_id);
                    },
                    Err(err) => tracing::warn!("malformed serviceRemoved event: {err}"),
                }
            }
        });

        Ok(())
    }

    async fn on_service_added(&self, event: &ServiceEvent) -> Result<(), ClientError> {
        let mut w = ByteWriter::new();
        w.write_string(&event.name);
        let response = self.inner.directory.call("service", w.into_bytes()).await?;
        let mut r = ByteReader::new(&response);
        let info = ServiceInfo::read(&mut r)?;

        let mut services = lock(&self.inner.services);
        services.retain(|existing| existing.service_id != info.service_id);
        services.push(info);
        Ok(())
    }

    /// A pooled client for one of the service's endpoints, connecting and
    /// authenticating if none exists yet.
    async fn client_for(&self, info: &ServiceInfo) -> Result<Client, ClientError> {
        {
            let pool = lock(&self.inner.pool);
            for endpoint in &info.endpoints {
                if let Some(client) = pool.get(endpoint) {
                    return Ok(client.clone());
                }
            }
        }

        let mut last_err = None;
        for addr in order_endpoints(info) {
            match connect_client(&addr, &self.inner.config).await {
                Ok(client) => {
                    // Double-checked insert: a concurrent caller may have
                    // connected first; keep the existing client and drop
                    // ours.
                    let existing = {
                        let mut pool = lock(&self.inner.pool);
                        match pool.get(&addr) {
                            Some(existing) => Some(existing.clone()),
                            None => {
                                pool.insert(addr.clone(), client.clone());
                                None
                            },
                        }
                    };
                    if let Some(existing) = existing {
                        client.endpoint().close().await;
                        return Ok(existing);
                    }
                    self.evict_on_close(&addr, client.endpoint());
                    return Ok(client);
                },
                Err(err) => {
                    tracing::debug!("endpoint {addr} unreachable: {err}");
                    last_err = Some(err);
                },
            }
        }
        Err(last_err.unwrap_or_else(|| ClientError::NoReachableEndpoint(info.name.clone())))
    }

    /// Drop the pool entry when its endpoint dies.
    fn evict_on_close(&self, addr: &str, endpoint: &Endpoint) {
        let session = self.clone();
        let addr = addr.to_string();
        endpoint.add_handler(
            Box::new(|_| (false, true)),
            consumer(|_| async { Ok(()) }),
            Box::new(move |_| {
                lock(&session.inner.pool).remove(&addr);
            }),
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("services", &lock(&self.inner.services).len())
            .field("pool", &lock(&self.inner.pool).len())
            .finish()
    }
}

/// Dial, wrap and authenticate a client connection.
async fn connect_client(addr: &str, config: &SessionConfig) -> Result<Client, ClientError> {
    let stream = dial(addr).await?;
    let endpoint = Endpoint::new(stream);
    let client = Client::with_config(endpoint, config.client.clone());
    auth::authenticate(&client, &config.user, &config.token).await?;
    Ok(client)
}

fn decode_service_event(payload: &[u8]) -> Result<ServiceEvent, ClientError> {
    let mut r = ByteReader::new(payload);
    ServiceEvent::read(&mut r).map_err(Into::into)
}

/// Order a service's endpoints by preference: same-machine unix/pipe
/// first, then local tcp-family endpoints, then anything else.
fn order_endpoints(info: &ServiceInfo) -> Vec<String> {
    let same_machine = info.machine_id == machine_id();
    let mut scored: Vec<(u8, String)> = info
        .endpoints
        .iter()
        .map(|endpoint| (endpoint_score(endpoint, same_machine), endpoint.clone()))
        .collect();
    scored.sort_by_key(|(score, _)| *score);
    scored.into_iter().map(|(_, endpoint)| endpoint).collect()
}

fn endpoint_score(endpoint: &str, same_machine: bool) -> u8 {
    let local_socket = endpoint.starts_with("unix://") || endpoint.starts_with("pipe://");
    if local_socket {
        return if same_machine { 0 } else { 3 };
    }
    let host = endpoint.split("://").nth(1).map_or("", |rest| {
        rest.rsplit_once(':').map_or(rest, |(host, _)| host)
    });
    if matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]") {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(machine: &str, endpoints: &[&str]) -> ServiceInfo {
        ServiceInfo {
            name: "X".to_string(),
            service_id: 2,
            machine_id: machine.to_string(),
            process_id: 1,
            endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
            session_id: String::new(),
        }
    }

    #[test]
    fn same_machine_prefers_unix() {
        let info = info(machine_id(), &["tcp://10.0.0.9:9559", "unix:///tmp/qi.sock"]);
        let ordered = order_endpoints(&info);
        assert_eq!(ordered[0], "unix:///tmp/qi.sock");
    }

    #[test]
    fn remote_machine_avoids_unix() {
        let info = info("elsewhere", &["unix:///tmp/qi.sock", "tcp://10.0.0.9:9559"]);
        let ordered = order_endpoints(&info);
        assert_eq!(ordered[0], "tcp://10.0.0.9:9559");
    }

    #[test]
    fn loopback_tcp_beats_remote_tcp() {
        let info = info("elsewhere", &["tcp://10.0.0.9:9559", "tcp://127.0.0.1:9559"]);
        let ordered = order_endpoints(&info);
        assert_eq!(ordered[0], "tcp://127.0.0.1:9559");
    }
}
