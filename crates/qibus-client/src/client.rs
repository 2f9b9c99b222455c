//! Request/response correlation and signal subscriptions over one
//! endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use qibus_net::{consumer, random_u64, Endpoint, HandlerId};
use qibus_proto::meta::action;
use qibus_proto::{ByteReader, ByteWriter, Header, Kind, Message, Value};
use tokio::sync::{mpsc, oneshot};

use crate::errors::ClientError;

/// Signal-channel depth between the event handler and the subscriber.
const EVENT_CHANNEL_DEPTH: usize = 32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to every call.
    pub call_timeout: Duration,
    /// How long the legacy capability exchange waits for the peer's
    /// capability frame.
    pub legacy_capability_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            legacy_capability_timeout: Duration::from_secs(1),
        }
    }
}

/// A client connection to a peer's objects.
///
/// Clones share the endpoint and the request-id counter.
#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
    next_id: Arc<AtomicU32>,
    config: ClientConfig,
}

impl Client {
    /// Wrap an endpoint with default configuration.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    /// Wrap an endpoint.
    pub fn with_config(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self { endpoint, next_id: Arc::new(AtomicU32::new(1)), config }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// This client's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Call `(service, object, action)` with an encoded payload and wait
    /// for the reply payload.
    ///
    /// A reply and an error with the same id cannot both occur; whichever
    /// arrives first completes the call. If the endpoint closes first the
    /// call fails with [`ClientError::Disconnected`]; if the deadline
    /// expires the pending handler is unregistered and the call fails with
    /// [`ClientError::Timeout`].
    pub async fn call(
        &self,
        service: u32,
        object: u32,
        action: u32,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let filter = move |hdr: &Header| {
            let kind_matches = matches!(
                hdr.kind(),
                Some(Kind::Reply | Kind::Error | Kind::Cancelled)
            );
            if kind_matches
                && hdr.id() == id
                && hdr.service() == service
                && hdr.object() == object
                && hdr.action() == action
            {
                (true, false)
            } else {
                (false, true)
            }
        };

        let consumer_slot = slot.clone();
        let on_reply = consumer(move |msg: Message| {
            let slot = consumer_slot.clone();
            async move {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(decode_reply(&msg));
                }
                Ok(())
            }
        });

        let closer_slot = slot;
        let closer = move |_err: Option<qibus_net::NetError>| {
            if let Some(tx) = lock(&closer_slot).take() {
                let _ = tx.send(Err(ClientError::Disconnected));
            }
        };

        let handler = self.endpoint.add_handler(Box::new(filter), on_reply, Box::new(closer));

        let msg = Message::new(Kind::Call, id, service, object, action, payload);
        if let Err(err) = self.endpoint.send(msg).await {
            let _ = self.endpoint.remove_handler(handler);
            return Err(err.into());
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                let _ = self.endpoint.remove_handler(handler);
                Err(ClientError::Timeout)
            },
        }
    }

    /// Fire-and-forget invocation; no reply is expected or awaited.
    pub async fn post(
        &self,
        service: u32,
        object: u32,
        action: u32,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = Message::new(Kind::Post, id, service, object, action, payload);
        self.endpoint.send(msg).await.map_err(Into::into)
    }

    /// Subscribe to a signal (or property-update) uid on a remote object.
    ///
    /// Sends `registerEvent` with a randomly chosen 64-bit subscriber
    /// handle, then routes matching event frames into the returned
    /// [`Subscription`]'s channel, preserving emission order.
    pub async fn subscribe(
        &self,
        service: u32,
        object: u32,
        signal: u32,
    ) -> Result<Subscription, ClientError> {
        let handler_ref = random_u64();
        self.call(
            service,
            object,
            action::REGISTER_EVENT,
            encode_event_registration(object, signal, handler_ref),
        )
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let filter = move |hdr: &Header| {
            let matched = hdr.kind() == Some(Kind::Event)
                && hdr.service() == service
                && hdr.object() == object
                && hdr.action() == signal;
            (matched, true)
        };
        let on_event = consumer(move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.payload).await;
                Ok(())
            }
        });
        let handler = self.endpoint.add_handler(Box::new(filter), on_event, Box::new(|_| {}));

        Ok(Subscription {
            client: self.clone(),
            service,
            object,
            signal,
            handler_ref,
            handler,
            events: rx,
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("peer", &self.endpoint.peer()).finish()
    }
}

/// A live signal subscription.
///
/// Events arrive on [`Subscription::next`] in emission order. Dropping the
/// subscription stops local delivery; [`Subscription::cancel`] also sends
/// `unregisterEvent` so the peer stops emitting.
pub struct Subscription {
    client: Client,
    service: u32,
    object: u32,
    signal: u32,
    handler_ref: u64,
    handler: HandlerId,
    events: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// The next event payload; `None` once the endpoint closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.events.recv().await
    }

    /// Unsubscribe: remove the local handler and tell the peer.
    pub async fn cancel(mut self) -> Result<(), ClientError> {
        let _ = self.client.endpoint.remove_handler(self.handler);
        self.events.close();
        self.client
            .call(
                self.service,
                self.object,
                action::UNREGISTER_EVENT,
                encode_event_registration(self.object, self.signal, self.handler_ref),
            )
            .await?;
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Best-effort local cleanup; cancel() already removed the handler.
        let _ = self.client.endpoint.remove_handler(self.handler);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("service", &self.service)
            .field("object", &self.object)
            .field("signal", &self.signal)
            .finish()
    }
}

/// The `(objectID, signalID, handler)` tuple of register/unregisterEvent.
fn encode_event_registration(object: u32, signal: u32, handler_ref: u64) -> Bytes {
    let mut w = ByteWriter::new();
    w.write_u32(object);
    w.write_u32(signal);
    w.write_u64(handler_ref);
    w.into_bytes()
}

/// Turn a correlated response frame into the call result.
fn decode_reply(msg: &Message) -> Result<Bytes, ClientError> {
    match msg.header.kind() {
        Some(Kind::Reply) => Ok(msg.payload.clone()),
        Some(Kind::Cancelled) => Err(ClientError::Cancelled),
        Some(Kind::Error) => {
            let mut reader = ByteReader::new(&msg.payload);
            let detail = Value::read(&mut reader)
                .ok()
                .and_then(|v| v.to_str().ok())
                .unwrap_or_else(|| "<malformed error payload>".to_string());
            Err(ClientError::Remote(detail))
        },
        _ => Err(ClientError::Remote(format!(
            "unexpected reply kind {}",
            msg.header.kind_raw()
        ))),
    }
}
