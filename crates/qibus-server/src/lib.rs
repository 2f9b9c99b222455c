//! Server side of the qi-messaging protocol.
//!
//! A [`Server`] listens on a transport URL, authenticates every accepted
//! connection, and routes messages by `(service, object)` to registered
//! [`Actor`]s. [`BasicObject`] supplies the generic object interface
//! (introspection, signals, properties, statistics, tracing) so services
//! only provide their user actions. A server bound with
//! [`Server::bind_directory`] additionally hosts the service directory as
//! service 1 and announces registrations on its signals.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod channel;
pub mod directory;
mod errors;
pub mod object;
pub mod router;
pub mod signals;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use auth::{AuthOutcome, Authenticator, PermissiveAuthenticator, UserTokenAuthenticator};
pub use channel::{Channel, ReplySink};
pub use directory::{directory_meta, directory_object, ServiceDirectory};
pub use errors::{DirectoryError, ServerError};
pub use object::{
    ActionFuture, ActionHandler, Activation, Actor, BasicObject, ObjectBuilder, PropertyHook,
    Terminator,
};
pub use router::Router;
pub use signals::SignalHub;

use qibus_net::{consumer, machine_id, Endpoint, Listener, Stream};
use qibus_proto::capability::KEY_NEW_TOKEN;
use qibus_proto::meta::action;
use qibus_proto::{AuthState, CapabilityMap, Header, Kind, Message, ServiceInfo, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The directory hosted by this server, when bound with
/// [`Server::bind_directory`].
struct DirectoryHost {
    state: Arc<Mutex<ServiceDirectory>>,
    object: BasicObject,
}

struct ServerInner {
    url: String,
    router: Router,
    authenticator: Arc<dyn Authenticator>,
    directory: Option<DirectoryHost>,
    /// Id source for servers without a directory.
    next_private_id: AtomicU32,
}

/// A listening qi-messaging server.
pub struct Server {
    inner: Arc<ServerInner>,
    listener: Listener,
}

impl Server {
    /// Bind a router-only server (a private namespace: service ids come
    /// from a process-local counter and are not discoverable).
    pub async fn bind(
        addr: &str,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(addr).await?;
        let inner = Arc::new(ServerInner {
            url: listener.url().to_string(),
            router: Router::new(),
            authenticator,
            directory: None,
            next_private_id: AtomicU32::new(1),
        });
        Ok(Self { inner, listener })
    }

    /// Bind a server hosting the service directory as service 1.
    ///
    /// The directory registers itself first, so the first user service
    /// receives id 2.
    pub async fn bind_directory(
        addr: &str,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(addr).await?;
        let url = listener.url().to_string();

        let state = Arc::new(Mutex::new(ServiceDirectory::new()));
        let object = directory_object(state.clone());
        let id = {
            let mut directory = lock(&state);
            let id = directory.register_service(ServiceInfo {
                name: "ServiceDirectory".to_string(),
                service_id: 0,
                machine_id: machine_id().to_string(),
                process_id: std::process::id(),
                endpoints: vec![url.clone()],
                session_id: String::new(),
            })?;
            directory.service_ready(id)?;
            id
        };

        let inner = Arc::new(ServerInner {
            url,
            router: Router::new(),
            authenticator,
            directory: Some(DirectoryHost { state, object: object.clone() }),
            next_private_id: AtomicU32::new(1),
        });
        inner
            .router
            .add_service(id, "ServiceDirectory", Arc::new(object), Arc::new(|| {}))
            .await?;
        Ok(Self { inner, listener })
    }

    /// The bound URL, with the kernel-assigned port resolved.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Export an actor as a new service's main object.
    ///
    /// With a hosted directory the id comes from registration and the
    /// service is announced on `serviceAdded` once routing is in place.
    pub async fn add_service(
        &self,
        name: &str,
        actor: Arc<dyn Actor>,
    ) -> Result<u32, ServerError> {
        let inner = &self.inner;
        let id = match &inner.directory {
            Some(host) => lock(&host.state).register_service(ServiceInfo {
                name: name.to_string(),
                service_id: 0,
                machine_id: machine_id().to_string(),
                process_id: std::process::id(),
                endpoints: vec![inner.url.clone()],
                session_id: String::new(),
            })?,
            None => inner.next_private_id.fetch_add(1, Ordering::Relaxed),
        };

        let terminate: Terminator = {
            let weak = Arc::downgrade(inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(async move {
                        remove_service(&inner, id).await;
                    });
                }
            })
        };
        inner.router.add_service(id, name, actor, terminate).await?;

        if let Some(host) = &inner.directory {
            let info = lock(&host.state).service_ready(id)?;
            host.object
                .emit_signal(directory::uid::SERVICE_ADDED, service_event_payload(&info))
                .await?;
        }
        Ok(id)
    }

    /// Export an extra object under an existing service, returning its id.
    pub async fn add_object(
        &self,
        service_id: u32,
        actor: Arc<dyn Actor>,
    ) -> Result<u32, ServerError> {
        let terminate: Terminator = Arc::new(|| {});
        self.inner.router.add_object(service_id, actor, terminate).await
    }

    /// Unregister a service and terminate its objects.
    pub async fn remove_service(&self, id: u32) {
        remove_service(&self.inner, id).await;
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        tracing::info!("serving on {}", self.inner.url);
        loop {
            match self.listener.accept().await {
                Ok(stream) => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, inner);
                    });
                },
                Err(err) => {
                    tracing::error!("accept failed: {err}");
                    return Err(err.into());
                },
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("url", &self.inner.url)
            .field("directory", &self.inner.directory.is_some())
            .finish()
    }
}

async fn remove_service(inner: &Arc<ServerInner>, id: u32) {
    let Some((name, actors)) = inner.router.remove_service(id) else {
        return;
    };
    for actor in actors {
        actor.on_terminate().await;
    }
    if let Some(host) = &inner.directory {
        let removal = lock(&host.state).unregister_service(id);
        match removal {
            Ok((info, true)) => {
                if let Err(err) = host
                    .object
                    .emit_signal(directory::uid::SERVICE_REMOVED, service_event_payload(&info))
                    .await
                {
                    tracing::warn!("cannot announce removal of {name}: {err}");
                }
            },
            Ok((_, false)) => {},
            Err(err) => tracing::debug!("service {name} not in directory: {err}"),
        }
    }
}

fn service_event_payload(info: &ServiceInfo) -> bytes::Bytes {
    let mut w = qibus_proto::ByteWriter::new();
    qibus_proto::ServiceEvent { service_id: info.service_id, name: info.name.clone() }.write(&mut w);
    w.into_bytes()
}

/// Per-connection wiring: one endpoint, one auth gate, one routing
/// handler.
fn serve_connection(stream: Stream, inner: Arc<ServerInner>) {
    let peer = stream.peer().to_string();
    tracing::debug!("connection accepted from {peer}");

    let endpoint = Endpoint::new(stream);
    let channel = Channel::new(endpoint.clone());
    let authenticated = Arc::new(AtomicBool::new(false));

    endpoint.add_handler(
        Box::new(|hdr: &Header| {
            let wanted = matches!(
                hdr.kind(),
                Some(Kind::Call | Kind::Post | Kind::Cancel | Kind::Capability)
            );
            (wanted, true)
        }),
        consumer(move |msg| {
            let inner = inner.clone();
            let channel = channel.clone();
            let authenticated = authenticated.clone();
            async move {
                route_message(&inner, &channel, &authenticated, msg).await;
                Ok(())
            }
        }),
        Box::new(move |_| {
            tracing::debug!("connection closed: {peer}");
        }),
    );
}

async fn route_message(
    inner: &Arc<ServerInner>,
    channel: &Channel,
    authenticated: &Arc<AtomicBool>,
    msg: Message,
) {
    let header = msg.header;
    match header.kind() {
        // Legacy capability exchange: peers predating the authenticate
        // action propose their map in a raw frame. The credentials still
        // go through the authenticator, and only a grant is answered -
        // any capability frame back reads as acceptance on the peer side,
        // and the exchange has no way to carry a refusal or a token
        // renewal round.
        Some(Kind::Capability) => match CapabilityMap::from_payload(&msg.payload) {
            Ok(request) => {
                let outcome = inner.authenticator.authenticate(&request);
                if outcome.state == AuthState::Done {
                    authenticated.store(true, Ordering::Release);
                    let mut reply = CapabilityMap::preferred("", "");
                    reply.set_authenticated();
                    if let Err(err) = channel.send_capabilities(&reply).await {
                        tracing::debug!("cannot answer capability frame: {err}");
                    }
                } else {
                    tracing::info!("capability exchange refused by the authenticator");
                }
            },
            Err(err) => tracing::info!("malformed capability frame: {err}"),
        },
        Some(Kind::Call)
            if header.service() == 0
                && header.object() == 0
                && header.action() == action::AUTHENTICATE =>
        {
            handle_authenticate(inner, channel, authenticated, &msg).await;
        },
        // Introspection of the authentication service itself is allowed
        // before the handshake completes.
        Some(Kind::Call)
            if header.service() == 0
                && header.object() == 0
                && header.action() == action::META_OBJECT =>
        {
            let mut w = qibus_proto::ByteWriter::new();
            qibus_proto::meta::service0_meta().write(&mut w);
            if let Err(err) = channel.send_reply(&header, w.into_bytes()).await {
                tracing::debug!("cannot answer service 0 introspection: {err}");
            }
        },
        _ if !authenticated.load(Ordering::Acquire) => {
            tracing::info!("message before authentication: {header:?}");
            if header.kind() == Some(Kind::Call) {
                let detail = ServerError::NotAuthenticated.to_string();
                if let Err(err) = channel.send_error(&header, &detail).await {
                    tracing::debug!("cannot refuse unauthenticated call: {err}");
                }
            }
        },
        Some(Kind::Call | Kind::Post | Kind::Cancel) => {
            inner.router.dispatch(msg, channel).await;
        },
        _ => tracing::info!("server ignoring message: {header:?}"),
    }
}

async fn handle_authenticate(
    inner: &Arc<ServerInner>,
    channel: &Channel,
    authenticated: &Arc<AtomicBool>,
    msg: &Message,
) {
    match CapabilityMap::from_payload(&msg.payload) {
        Ok(request) => {
            let outcome = inner.authenticator.authenticate(&request);
            let mut reply = CapabilityMap::new();
            reply.set_state(outcome.state);
            if let Some(token) = outcome.new_token {
                reply.insert(KEY_NEW_TOKEN, Value::from_string(&token));
            }
            if outcome.state == AuthState::Done {
                authenticated.store(true, Ordering::Release);
            }
            if let Err(err) = channel.send_reply(&msg.header, reply.to_payload()).await {
                tracing::debug!("cannot answer authenticate: {err}");
            }
        },
        Err(err) => {
            let detail = format!("malformed capability map: {err}");
            if let Err(send_err) = channel.send_error(&msg.header, &detail).await {
                tracing::debug!("cannot refuse authenticate: {send_err}");
            }
        },
    }
}
