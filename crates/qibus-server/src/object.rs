//! The generic object runtime.
//!
//! Every exported object is an [`Actor`]. [`BasicObject`] implements the
//! reserved action range (uids 0x00-0x63: event registration,
//! meta-object introspection, properties, statistics, tracing) and
//! dispatches user actions (uids from 0x64) through a table of closures
//! built at construction time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use qibus_proto::meta::{action, EventTrace, Timeval};
use qibus_proto::{ByteReader, ByteWriter, Kind, Message, MetaObject, MethodStatistics, Value};

use crate::channel::{Channel, ReplySink};
use crate::errors::ServerError;
use crate::signals::SignalHub;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Future returned by an action handler.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Bytes, String>> + Send>>;

/// One user action: encoded parameters in, encoded reply out.
///
/// A returned `Err` is sent to the caller as an error frame carrying the
/// string.
pub type ActionHandler = Box<dyn Fn(Bytes) -> ActionFuture + Send + Sync>;

/// Called before a property value is persisted; an `Err` aborts the
/// update and the stored value stays unchanged.
pub type PropertyHook = Box<dyn Fn(&str, &[u8]) -> Result<(), String> + Send + Sync>;

/// Unregisters the object from its service when invoked.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

/// Runtime identity handed to an actor when its service goes live.
#[derive(Clone)]
pub struct Activation {
    /// Service id the object is exported under.
    pub service_id: u32,
    /// Object id within the service.
    pub object_id: u32,
    /// Unregisters the object.
    pub terminate: Terminator,
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("service_id", &self.service_id)
            .field("object_id", &self.object_id)
            .finish()
    }
}

/// Server-side implementation of an object: receives messages from a
/// connection and produces replies or events.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Called once, before any message is delivered.
    async fn activate(&self, activation: Activation) -> Result<(), ServerError>;

    /// Process one message; replies go through `from`.
    async fn receive(&self, msg: Message, from: &Channel) -> Result<(), ServerError>;

    /// Called when the object is unregistered.
    async fn on_terminate(&self);
}

/// Builder for a [`BasicObject`].
pub struct ObjectBuilder {
    meta: MetaObject,
    handlers: HashMap<u32, ActionHandler>,
    properties: Vec<(String, Value)>,
    on_property_change: Option<PropertyHook>,
    hub: Option<SignalHub>,
}

impl ObjectBuilder {
    /// Start from the object's user meta (uids from 0x64); the generic
    /// interface is merged in automatically.
    pub fn new(meta: MetaObject) -> Self {
        Self { meta, handlers: HashMap::new(), properties: Vec::new(), on_property_change: None, hub: None }
    }

    /// Attach the handler for a user action uid.
    pub fn method<F, Fut>(mut self, uid: u32, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, String>> + Send + 'static,
    {
        self.handlers.insert(uid, Box::new(move |payload| Box::pin(handler(payload))));
        self
    }

    /// Seed a property store entry.
    pub fn property(mut self, name: &str, initial: Value) -> Self {
        self.properties.push((name.to_string(), initial));
        self
    }

    /// Install the property validation hook.
    pub fn on_property_change(mut self, hook: PropertyHook) -> Self {
        self.on_property_change = Some(hook);
        self
    }

    /// Share an externally created signal hub (so handlers built before
    /// the object can emit through it).
    pub fn signals(mut self, hub: SignalHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Finish construction.
    pub fn build(self) -> BasicObject {
        let meta = qibus_proto::meta::full_meta(&self.meta);
        let mut stats = HashMap::new();
        for uid in meta.methods.keys() {
            stats.insert(*uid, MethodStatistics::default());
        }
        let mut properties = HashMap::new();
        for (name, value) in self.properties {
            properties.insert(name, value);
        }
        BasicObject {
            core: Arc::new(ObjectCore {
                meta,
                handlers: self.handlers,
                properties: RwLock::new(properties),
                on_property_change: self.on_property_change,
                hub: self.hub.unwrap_or_default(),
                stats: Mutex::new(stats),
                stats_enabled: AtomicBool::new(false),
                trace_enabled: AtomicBool::new(false),
                next_trace: AtomicU32::new(0),
                service_id: AtomicU32::new(0),
                object_id: AtomicU32::new(0),
                terminate: Mutex::new(None),
            }),
        }
    }
}

/// A ready-to-export object. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BasicObject {
    core: Arc<ObjectCore>,
}

struct ObjectCore {
    meta: MetaObject,
    handlers: HashMap<u32, ActionHandler>,
    properties: RwLock<HashMap<String, Value>>,
    on_property_change: Option<PropertyHook>,
    hub: SignalHub,
    stats: Mutex<HashMap<u32, MethodStatistics>>,
    stats_enabled: AtomicBool,
    trace_enabled: AtomicBool,
    next_trace: AtomicU32,
    service_id: AtomicU32,
    object_id: AtomicU32,
    terminate: Mutex<Option<Terminator>>,
}

impl BasicObject {
    /// The full meta-object (generic interface included).
    pub fn meta(&self) -> &MetaObject {
        &self.core.meta
    }

    /// The shared signal hub.
    pub fn signals(&self) -> &SignalHub {
        &self.core.hub
    }

    /// Emit a signal to its subscribers.
    pub async fn emit_signal(&self, signal: u32, payload: Bytes) -> Result<(), ServerError> {
        if !self.core.meta.signals.contains_key(&signal)
            && !self.core.meta.properties.contains_key(&signal)
        {
            return Err(ServerError::UnknownSignal(signal));
        }
        self.core.hub.emit(signal, payload).await;
        Ok(())
    }

    /// Persist a property value and notify subscribers.
    ///
    /// Server-initiated counterpart of `setProperty`; the validation hook
    /// is not consulted.
    pub async fn update_property(&self, name: &str, value: Value) -> Result<(), ServerError> {
        let uid = self
            .core
            .meta
            .property_uid(name)
            .ok_or_else(|| ServerError::UnknownProperty(name.to_string()))?;
        let payload = value.bytes().clone();
        {
            let mut store = write_store(&self.core.properties);
            store.insert(name.to_string(), value);
        }
        self.core.hub.emit(uid, payload).await;
        Ok(())
    }

    async fn handle_call(&self, msg: &Message, from: &Channel) -> Result<(), ServerError> {
        let call_action = msg.header.action();
        self.core.trace_message(&msg.header, &msg.payload).await;
        let sink = self.core.wrap_sink(from.clone(), call_action);
        match self.dispatch(msg, from).await {
            Ok(payload) => sink.send_reply(&msg.header, payload).await,
            Err(detail) => sink.send_error(&msg.header, &detail).await,
        }
    }

    /// Run one call to completion, reserved range first.
    async fn dispatch(&self, msg: &Message, from: &Channel) -> Result<Bytes, String> {
        let core = &self.core;
        let payload = &msg.payload;
        match msg.header.action() {
            action::REGISTER_EVENT => self.register_event(msg, from).await,
            action::UNREGISTER_EVENT => self.unregister_event(payload),
            action::META_OBJECT => {
                let mut r = ByteReader::new(payload);
                let object_id = r.read_u32().map_err(|e| e.to_string())?;
                core.check_object_id(object_id)?;
                let mut w = ByteWriter::new();
                core.meta.write(&mut w);
                Ok(w.into_bytes())
            },
            action::TERMINATE => {
                let mut r = ByteReader::new(payload);
                let object_id = r.read_u32().map_err(|e| e.to_string())?;
                core.check_object_id(object_id)?;
                let terminator = lock(&core.terminate).clone();
                if let Some(terminate) = terminator {
                    terminate();
                }
                Ok(Bytes::new())
            },
            action::PROPERTY => {
                let mut r = ByteReader::new(payload);
                let name = Value::read(&mut r)
                    .map_err(|e| e.to_string())?
                    .to_str()
                    .map_err(|_| "property name must be a string value".to_string())?;
                let store = read_store(&core.properties);
                let value = store
                    .get(&name)
                    .ok_or_else(|| format!("property unknown: {name}"))?;
                let mut w = ByteWriter::new();
                value.write(&mut w);
                Ok(w.into_bytes())
            },
            action::SET_PROPERTY => self.set_property(payload).await,
            action::PROPERTIES => {
                let store = read_store(&core.properties);
                let mut w = ByteWriter::new();
                w.write_u32(store.len() as u32);
                for name in store.keys() {
                    w.write_string(name);
                }
                Ok(w.into_bytes())
            },
            action::REGISTER_EVENT_WITH_SIGNATURE => Err("not supported".to_string()),
            action::IS_STATS_ENABLED => {
                Ok(bool_payload(core.stats_enabled.load(Ordering::Acquire)))
            },
            action::ENABLE_STATS => {
                let enabled = read_bool(payload)?;
                core.stats_enabled.store(enabled, Ordering::Release);
                Ok(Bytes::new())
            },
            action::STATS => {
                let stats = lock(&core.stats);
                let mut w = ByteWriter::new();
                w.write_u32(stats.len() as u32);
                for (uid, entry) in stats.iter() {
                    w.write_u32(*uid);
                    entry.write(&mut w);
                }
                Ok(w.into_bytes())
            },
            action::CLEAR_STATS => {
                let mut stats = lock(&core.stats);
                stats.clear();
                for uid in core.meta.methods.keys() {
                    stats.insert(*uid, MethodStatistics::default());
                }
                Ok(Bytes::new())
            },
            action::IS_TRACE_ENABLED => {
                Ok(bool_payload(core.trace_enabled.load(Ordering::Acquire)))
            },
            action::ENABLE_TRACE => {
                let enabled = read_bool(payload)?;
                core.trace_enabled.store(enabled, Ordering::Release);
                Ok(Bytes::new())
            },
            uid => match core.handlers.get(&uid) {
                Some(handler) => handler(payload.clone()).await,
                None => Err(format!("unknown action: {uid}")),
            },
        }
    }

    /// `registerEvent(objectID, signalID, handler) -> handler`.
    async fn register_event(&self, msg: &Message, from: &Channel) -> Result<Bytes, String> {
        let mut r = ByteReader::new(&msg.payload);
        let object_id = r.read_u32().map_err(|e| format!("cannot read object uid: {e}"))?;
        let signal = r.read_u32().map_err(|e| format!("cannot read signal uid: {e}"))?;
        let handler_ref = r.read_u64().map_err(|e| format!("cannot read handler: {e}"))?;
        self.core.check_object_id(object_id)?;

        if signal == action::TRACE_OBJECT {
            // Subscribing to traceObject implies turning tracing on.
            self.core.trace_enabled.store(true, Ordering::Release);
        } else if !self.core.meta.signals.contains_key(&signal)
            && !self.core.meta.properties.contains_key(&signal)
        {
            return Err(format!("unknown signal: {signal}"));
        }

        self.core.hub.add(
            signal,
            handler_ref,
            from.clone(),
            msg.header.service(),
            msg.header.object(),
        );

        let mut w = ByteWriter::new();
        w.write_u64(handler_ref);
        Ok(w.into_bytes())
    }

    /// `unregisterEvent(objectID, signalID, handler)`.
    fn unregister_event(&self, payload: &Bytes) -> Result<Bytes, String> {
        let mut r = ByteReader::new(payload);
        let _object_id = r.read_u32().map_err(|e| format!("cannot read object uid: {e}"))?;
        let signal = r.read_u32().map_err(|e| format!("cannot read signal uid: {e}"))?;
        let handler_ref = r.read_u64().map_err(|e| format!("cannot read handler: {e}"))?;
        if !self.core.hub.remove(signal, handler_ref) {
            return Err(format!("unknown subscription: signal {signal}"));
        }
        Ok(Bytes::new())
    }

    /// `setProperty(name, value)`: resolve, validate, persist, notify.
    async fn set_property(&self, payload: &Bytes) -> Result<Bytes, String> {
        let core = &self.core;
        let mut r = ByteReader::new(payload);
        let name_value = Value::read(&mut r).map_err(|e| e.to_string())?;
        let new_value = Value::read(&mut r).map_err(|e| e.to_string())?;

        let name = if let Ok(name) = name_value.to_str() {
            name
        } else if let Ok(uid) = name_value.to_u32() {
            core.meta
                .properties
                .get(&uid)
                .map(|p| p.name.clone())
                .ok_or_else(|| format!("incorrect property id value, got {uid}"))?
        } else {
            return Err("incorrect property name type".to_string());
        };

        let uid = core
            .meta
            .property_uid(&name)
            .ok_or_else(|| format!("property unknown: {name}"))?;

        // The implementor vets the raw encoded value before anything is
        // stored or published.
        if let Some(hook) = &core.on_property_change {
            hook(&name, new_value.bytes())?;
        }

        let update = new_value.bytes().clone();
        {
            let mut store = write_store(&core.properties);
            store.insert(name, new_value);
        }
        core.hub.emit(uid, update).await;
        Ok(Bytes::new())
    }
}

#[async_trait]
impl Actor for BasicObject {
    async fn activate(&self, activation: Activation) -> Result<(), ServerError> {
        self.core.service_id.store(activation.service_id, Ordering::Release);
        self.core.object_id.store(activation.object_id, Ordering::Release);
        *lock(&self.core.terminate) = Some(activation.terminate);
        Ok(())
    }

    async fn receive(&self, msg: Message, from: &Channel) -> Result<(), ServerError> {
        match msg.header.kind() {
            Some(Kind::Call) => self.handle_call(&msg, from).await,
            Some(Kind::Post) => {
                self.core.trace_message(&msg.header, &msg.payload).await;
                if let Err(detail) = self.dispatch(&msg, from).await {
                    tracing::debug!("post to action {} failed: {detail}", msg.header.action());
                }
                Ok(())
            },
            Some(Kind::Cancel) => from.send_cancelled(&msg.header).await,
            _ => {
                tracing::info!("object ignoring message: {:?}", msg.header);
                Ok(())
            },
        }
    }

    async fn on_terminate(&self) {
        self.core.hub.clear();
    }
}

impl std::fmt::Debug for BasicObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicObject")
            .field("description", &self.core.meta.description)
            .field("service_id", &self.core.service_id.load(Ordering::Acquire))
            .field("object_id", &self.core.object_id.load(Ordering::Acquire))
            .finish()
    }
}

impl ObjectCore {
    /// Object-id check shared by `metaObject` and `terminate`.
    ///
    /// `0` means "don't check". Ids with the high bit set mark
    /// client-allocated objects, which do not know their public id; the
    /// check is skipped for them as well.
    fn check_object_id(&self, got: u32) -> Result<(), String> {
        let own = self.object_id.load(Ordering::Acquire);
        if got != 0 && own < (1 << 31) && got != own {
            return Err(ServerError::WrongObjectId { expected: own, got }.to_string());
        }
        Ok(())
    }

    /// Layer statistics and trace recording over the raw channel for one
    /// call.
    fn wrap_sink(self: &Arc<Self>, channel: Channel, call_action: u32) -> Box<dyn ReplySink> {
        let mut sink: Box<dyn ReplySink> = Box::new(channel);
        if self.stats_enabled.load(Ordering::Acquire) {
            sink = Box::new(StatsSink {
                inner: sink,
                core: self.clone(),
                action: call_action,
                start: Instant::now(),
            });
        }
        if self.trace_enabled.load(Ordering::Acquire) {
            sink = Box::new(TraceSink { inner: sink, core: self.clone() });
        }
        sink
    }

    /// Record one message on the trace signal, if tracing is on.
    ///
    /// The trace signal itself is suppressed to avoid loops.
    async fn trace_message(&self, header: &qibus_proto::Header, payload: &Bytes) {
        if !self.trace_enabled.load(Ordering::Acquire) || header.action() == action::TRACE_OBJECT {
            return;
        }
        let kind = header.kind().unwrap_or(Kind::Call);
        let signature = self.meta.action_signature(kind, header.action());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let trace = EventTrace {
            id: self.next_trace.fetch_add(1, Ordering::Relaxed),
            kind: i32::from(header.kind_raw()),
            slot: header.action(),
            arguments: Value::opaque(signature, payload.clone()),
            timestamp: Timeval {
                sec: now.as_secs() as i64,
                usec: i64::from(now.subsec_micros()),
            },
        };
        let mut w = ByteWriter::new();
        trace.write(&mut w);
        self.hub.emit(action::TRACE_OBJECT, w.into_bytes()).await;
    }

    fn record_statistics(&self, call_action: u32, start: Instant) {
        let mut stats = lock(&self.stats);
        if let Some(entry) = stats.get_mut(&call_action) {
            entry.record(start.elapsed());
        }
    }
}

/// Statistics-recording wrapper: updates the per-action aggregate when
/// the reply or error goes out.
struct StatsSink {
    inner: Box<dyn ReplySink>,
    core: Arc<ObjectCore>,
    action: u32,
    start: Instant,
}

#[async_trait]
impl ReplySink for StatsSink {
    async fn send_reply(&self, call: &qibus_proto::Header, payload: Bytes) -> Result<(), ServerError> {
        let result = self.inner.send_reply(call, payload).await;
        self.core.record_statistics(self.action, self.start);
        result
    }

    async fn send_error(&self, call: &qibus_proto::Header, detail: &str) -> Result<(), ServerError> {
        let result = self.inner.send_error(call, detail).await;
        self.core.record_statistics(self.action, self.start);
        result
    }
}

/// Trace wrapper: records outgoing replies on the trace signal.
struct TraceSink {
    inner: Box<dyn ReplySink>,
    core: Arc<ObjectCore>,
}

#[async_trait]
impl ReplySink for TraceSink {
    async fn send_reply(&self, call: &qibus_proto::Header, payload: Bytes) -> Result<(), ServerError> {
        let mut header = *call;
        header.set_kind(Kind::Reply);
        self.core.trace_message(&header, &payload).await;
        self.inner.send_reply(call, payload).await
    }

    async fn send_error(&self, call: &qibus_proto::Header, detail: &str) -> Result<(), ServerError> {
        let mut header = *call;
        header.set_kind(Kind::Error);
        self.core.trace_message(&header, &Bytes::new()).await;
        self.inner.send_error(call, detail).await
    }
}

fn read_store(
    store: &RwLock<HashMap<String, Value>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_store(
    store: &RwLock<HashMap<String, Value>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

fn bool_payload(value: bool) -> Bytes {
    let mut w = ByteWriter::new();
    w.write_bool(value);
    w.into_bytes()
}

fn read_bool(payload: &Bytes) -> Result<bool, String> {
    let mut r = ByteReader::new(payload);
    r.read_bool().map_err(|e| e.to_string())
}
