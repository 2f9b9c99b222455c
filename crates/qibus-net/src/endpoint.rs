//! The message multiplexer: one stream, one reader task, many handlers.
//!
//! An [`Endpoint`] owns a [`Stream`]. A single background reader parses one
//! framed message at a time and offers it to every registered handler's
//! filter; matching messages are pushed into the handler's bounded inbox
//! and consumed on the handler's own task. Writers call [`Endpoint::send`]
//! directly; a write lock keeps frames from interleaving on the wire.
//!
//! Backpressure is deliberate: a full handler inbox stalls the dispatch
//! loop, which stalls the wire read. Memory stays bounded at the cost of
//! head-of-line blocking across handlers.
//!
//! # Handler contract
//!
//! - `filter(header) -> (matched, keep)` runs on the reader task. It must
//!   be short, non-blocking, and must not touch the handler table; in-place
//!   removal is what the `keep` return value is for.
//! - `consumer(message)` runs on the handler's task and may block.
//! - `closer(error)` runs exactly once, after the handler stops for any
//!   reason. It carries the stream error when the endpoint died.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use qibus_proto::message::DEFAULT_MAX_PAYLOAD;
use qibus_proto::{Header, Kind, Message, Value};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::errors::NetError;
use crate::stream::{Hold, ReadHalf, Stream, WriteHalf};

/// Per-handler inbox depth.
const QUEUE_DEPTH: usize = 10;

/// Identifier of a registered handler.
pub type HandlerId = u64;

/// Decides whether a message belongs to a handler and whether the handler
/// stays registered afterwards.
pub type Filter = Box<dyn Fn(&Header) -> (bool, bool) + Send + Sync>;

/// Future returned by a consumer invocation.
pub type ConsumerFuture = Pin<Box<dyn Future<Output = Result<(), NetError>> + Send>>;

/// Processes messages selected by the filter, on the handler's own task.
pub type Consumer = Box<dyn FnMut(Message) -> ConsumerFuture + Send>;

/// Invoked exactly once when the handler stops; receives the stream error
/// when the endpoint closed abnormally.
pub type Closer = Box<dyn FnOnce(Option<NetError>) + Send>;

/// Adapt an async closure into a boxed [`Consumer`].
pub fn consumer<F, Fut>(mut f: F) -> Consumer
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), NetError>> + Send + 'static,
{
    Box::new(move |msg| Box::pin(f(msg)))
}

/// Tuning knobs for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upper bound on accepted payload sizes, checked before allocation.
    pub max_payload: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { max_payload: DEFAULT_MAX_PAYLOAD }
    }
}

/// A message-level view of one stream. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    peer: String,
    writer: tokio::sync::Mutex<WriteHalf>,
    table: Mutex<Table>,
    next_id: AtomicU64,
    reader_abort: Mutex<Option<AbortHandle>>,
    /// Keeps transport guts (e.g. a QUIC connection) alive.
    _hold: Hold,
}

#[derive(Default)]
struct Table {
    entries: HashMap<HandlerId, Entry>,
    closed: bool,
    close_reason: Option<NetError>,
}

struct Entry {
    filter: Filter,
    queue: mpsc::Sender<Message>,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<NetError>>>,
}

/// Outcome of offering one message to the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Delivered,
    NoHandler,
    NoMatch,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Endpoint {
    /// Wrap a stream with default configuration and start the reader.
    pub fn new(stream: Stream) -> Self {
        Self::with_config(stream, EndpointConfig::default())
    }

    /// Wrap a stream and start the reader.
    pub fn with_config(stream: Stream, config: EndpointConfig) -> Self {
        let (reader, writer, peer, hold) = stream.into_parts();
        let inner = Arc::new(Inner {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            table: Mutex::new(Table::default()),
            next_id: AtomicU64::new(1),
            reader_abort: Mutex::new(None),
            _hold: hold,
        });
        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(read_loop(weak, reader, config.max_payload));
        *lock(&inner.reader_abort) = Some(handle.abort_handle());
        Self { inner }
    }

    /// Peer identification for logs.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// True once the endpoint closed (locally or by stream error).
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.table).closed
    }

    /// Push a message onto the wire.
    ///
    /// Serialized against concurrent senders; frames never interleave.
    pub async fn send(&self, msg: Message) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        msg.write(&mut *writer).await.map_err(NetError::from)
    }

    /// Register a handler, spawning its worker task.
    ///
    /// Do not add or remove handlers from inside a filter; use the filter's
    /// `keep` return value instead.
    pub fn add_handler(&self, filter: Filter, consumer: Consumer, closer: Closer) -> HandlerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, inbox) = mpsc::channel(QUEUE_DEPTH);
        let cancel = Arc::new(Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let fault = Arc::new(Mutex::new(None));

        tokio::spawn(handler_loop(
            inbox,
            cancel.clone(),
            cancelled.clone(),
            fault.clone(),
            consumer,
            closer,
        ));

        let entry = Entry { filter, queue, cancel, cancelled, fault };
        let mut table = lock(&self.inner.table);
        if table.closed {
            // Late registration on a dead endpoint: stop the handler right
            // away, propagating the original close reason.
            *lock(&entry.fault) = table.close_reason.clone();
            drop(entry);
            return id;
        }
        table.entries.insert(id, entry);
        id
    }

    /// Remove a handler, dropping any queued messages.
    pub fn remove_handler(&self, id: HandlerId) -> Result<(), NetError> {
        let entry = lock(&self.inner.table)
            .entries
            .remove(&id)
            .ok_or(NetError::HandlerNotFound(id))?;
        entry.cancelled.store(true, Ordering::Release);
        entry.cancel.notify_one();
        Ok(())
    }

    /// Receive the next message matching nothing in particular.
    ///
    /// Registers a one-shot catch-all handler; the channel closes after one
    /// message or when the endpoint does.
    pub fn receive_any(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        self.add_handler(
            Box::new(|_| (true, false)),
            consumer(move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg).await;
                    Ok(())
                }
            }),
            Box::new(|_| {}),
        );
        rx
    }

    /// Close the endpoint: stop the reader, stop every handler (draining
    /// their queues), shut the stream down.
    pub async fn close(&self) {
        self.inner.close_with(None).await;
        if let Some(handle) = lock(&self.inner.reader_abort).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.inner.peer)
            .field("closed", &lock(&self.inner.table).closed)
            .finish()
    }
}

impl Inner {
    /// Offer a message to every handler; collect matching queues under the
    /// lock, push outside it.
    async fn dispatch(&self, msg: Message) -> DispatchOutcome {
        let (outcome, queues) = {
            let mut table = lock(&self.table);
            if table.entries.is_empty() {
                return DispatchOutcome::NoHandler;
            }
            let mut queues = Vec::new();
            let mut dropped = Vec::new();
            for (id, entry) in &table.entries {
                let (matched, keep) = (entry.filter)(&msg.header);
                if matched {
                    queues.push(entry.queue.clone());
                }
                if !keep {
                    dropped.push(*id);
                }
            }
            for id in dropped {
                // Dropping the entry closes its queue; the worker drains
                // what it already has and exits.
                table.entries.remove(&id);
            }
            let outcome = if queues.is_empty() {
                DispatchOutcome::NoMatch
            } else {
                DispatchOutcome::Delivered
            };
            (outcome, queues)
        };

        for queue in queues {
            // A full inbox blocks here, stalling the wire read on purpose.
            let _ = queue.send(msg.clone()).await;
        }
        outcome
    }

    /// Stop every handler and shut the stream down. Idempotent; the first
    /// caller's error wins.
    async fn close_with(&self, err: Option<NetError>) {
        let entries = {
            let mut table = lock(&self.table);
            if table.closed {
                return;
            }
            table.closed = true;
            table.close_reason = err.clone();
            std::mem::take(&mut table.entries)
        };
        for entry in entries.into_values() {
            *lock(&entry.fault) = err.clone();
            // Dropping the entry closes the queue: drain-then-exit.
            drop(entry);
        }
        let mut writer = self.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
    }
}

/// The handler worker: pop from the inbox, run the consumer, fire the
/// closer exactly once on the way out.
async fn handler_loop(
    mut inbox: mpsc::Receiver<Message>,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<NetError>>>,
    mut consumer: Consumer,
    closer: Closer,
) {
    loop {
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(msg) => {
                    if let Err(err) = consumer(msg).await {
                        tracing::warn!("failed to consume message: {err}");
                    }
                },
                None => break,
            },
            _ = cancel.notified() => {
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
            },
        }
    }
    closer(lock(&fault).take());
}

/// The single reader: parse one message at a time, dispatch, die on the
/// first stream error.
async fn read_loop(inner: Weak<Inner>, mut reader: ReadHalf, max_payload: u32) {
    loop {
        let result = Message::read(&mut reader, max_payload).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match result {
            Ok(msg) => match inner.dispatch(msg.clone()).await {
                DispatchOutcome::Delivered => {},
                outcome @ (DispatchOutcome::NoHandler | DispatchOutcome::NoMatch) => {
                    log_unmatched(&inner.peer, outcome, &msg);
                },
            },
            Err(err) => {
                tracing::debug!(peer = %inner.peer, "stream closed: {err}");
                inner.close_with(Some(NetError::from(err))).await;
                return;
            },
        }
    }
}

fn log_unmatched(peer: &str, outcome: DispatchOutcome, msg: &Message) {
    let reason = match outcome {
        DispatchOutcome::NoHandler => "no handler registered",
        _ => "no handler match",
    };
    if msg.header.kind() == Some(Kind::Error) {
        // Surface the decoded error string instead of raw bytes.
        let mut reader = qibus_proto::ByteReader::new(&msg.payload);
        let detail = Value::read(&mut reader)
            .ok()
            .and_then(|v| v.to_str().ok())
            .unwrap_or_else(|| "<malformed error payload>".to_string());
        tracing::info!(peer, header = ?msg.header, "message dropped ({reason}): error: {detail}");
    } else {
        tracing::info!(peer, header = ?msg.header, "message dropped ({reason})");
    }
}
