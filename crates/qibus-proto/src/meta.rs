//! Meta-objects: machine-readable descriptions of an object's methods,
//! signals and properties.
//!
//! Every object answers the `metaObject` action with one of these. Action
//! uids below [`action::MIN_USER_ACTION`] are reserved for the generic
//! object interface present on every object ("full meta"); user-defined
//! actions start at `0x64`.

use std::collections::HashMap;
use std::time::Duration;

use crate::basic::{ByteReader, ByteWriter};
use crate::errors::Result;
use crate::value::Value;

/// Reserved action uids.
pub mod action {
    /// `registerEvent(objectID, signalID, handler) -> handler` (uid 0x00).
    pub const REGISTER_EVENT: u32 = 0x00;
    /// `unregisterEvent(objectID, signalID, handler)` (uid 0x01).
    pub const UNREGISTER_EVENT: u32 = 0x01;
    /// `metaObject(objectID) -> MetaObject` (uid 0x02).
    pub const META_OBJECT: u32 = 0x02;
    /// `terminate(objectID)` (uid 0x03).
    pub const TERMINATE: u32 = 0x03;
    /// `property(name) -> value` (uid 0x05).
    pub const PROPERTY: u32 = 0x05;
    /// `setProperty(name, value)` (uid 0x06).
    pub const SET_PROPERTY: u32 = 0x06;
    /// `properties() -> [name]` (uid 0x07).
    pub const PROPERTIES: u32 = 0x07;
    /// `registerEventWithSignature` (uid 0x08); answered with an error.
    pub const REGISTER_EVENT_WITH_SIGNATURE: u32 = 0x08;
    /// `isStatsEnabled() -> bool` (uid 0x50).
    pub const IS_STATS_ENABLED: u32 = 0x50;
    /// `enableStats(bool)` (uid 0x51).
    pub const ENABLE_STATS: u32 = 0x51;
    /// `stats() -> {uid: MethodStatistics}` (uid 0x52).
    pub const STATS: u32 = 0x52;
    /// `clearStats()` (uid 0x53).
    pub const CLEAR_STATS: u32 = 0x53;
    /// `isTraceEnabled() -> bool` (uid 0x54).
    pub const IS_TRACE_ENABLED: u32 = 0x54;
    /// `enableTrace(bool)` (uid 0x55).
    pub const ENABLE_TRACE: u32 = 0x55;
    /// The `traceObject` signal (uid 0x56). Registering for it implicitly
    /// enables tracing; it is itself never traced.
    pub const TRACE_OBJECT: u32 = 0x56;
    /// `authenticate(CapabilityMap) -> CapabilityMap` on (service 0,
    /// object 0).
    pub const AUTHENTICATE: u32 = 8;
    /// First uid available to user-defined methods, signals and
    /// properties.
    pub const MIN_USER_ACTION: u32 = 0x64;
}

/// The canonical meta-object signature string.
pub const META_OBJECT_SIGNATURE: &str = "({I(Issss[(ss)<MetaMethodParameter,name,description>]s)\
<MetaMethod,uid,returnSignature,name,parametersSignature,description,parameters,returnDescription>}\
{I(Iss)<MetaSignal,uid,name,signature>}{I(Iss)<MetaProperty,uid,name,signature>}s)\
<MetaObject,methods,signals,properties,description>";

/// One named parameter of a meta method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaMethodParameter {
    /// Parameter name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
}

/// Description of a callable method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaMethod {
    /// Action uid.
    pub uid: u32,
    /// Signature of the return value.
    pub return_signature: String,
    /// Method name.
    pub name: String,
    /// Signature of the parameter tuple.
    pub parameters_signature: String,
    /// Human-readable description.
    pub description: String,
    /// Named parameters.
    pub parameters: Vec<MetaMethodParameter>,
    /// Human-readable description of the return value.
    pub return_description: String,
}

impl MetaMethod {
    /// Shorthand for a method with only the wire-relevant fields set.
    pub fn new(uid: u32, name: &str, parameters_signature: &str, return_signature: &str) -> Self {
        Self {
            uid,
            return_signature: return_signature.to_string(),
            name: name.to_string(),
            parameters_signature: parameters_signature.to_string(),
            ..Self::default()
        }
    }
}

/// Description of a signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSignal {
    /// Action uid; events carry it in the header's action field.
    pub uid: u32,
    /// Signal name.
    pub name: String,
    /// Signature of the event payload.
    pub signature: String,
}

impl MetaSignal {
    /// Shorthand constructor.
    pub fn new(uid: u32, name: &str, signature: &str) -> Self {
        Self { uid, name: name.to_string(), signature: signature.to_string() }
    }
}

/// Description of a property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaProperty {
    /// Action uid; update events carry it in the header's action field.
    pub uid: u32,
    /// Property name.
    pub name: String,
    /// Signature of the property value.
    pub signature: String,
}

impl MetaProperty {
    /// Shorthand constructor.
    pub fn new(uid: u32, name: &str, signature: &str) -> Self {
        Self { uid, name: name.to_string(), signature: signature.to_string() }
    }
}

/// Machine-readable description of an object.
///
/// The three uid maps partition the action uid space: a given uid names
/// either a method, a signal or a property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaObject {
    /// Human-readable object description.
    pub description: String,
    /// Methods by action uid.
    pub methods: HashMap<u32, MetaMethod>,
    /// Signals by action uid.
    pub signals: HashMap<u32, MetaSignal>,
    /// Properties by action uid.
    pub properties: HashMap<u32, MetaProperty>,
}

impl MetaObject {
    /// Look up a method uid by name.
    pub fn method_uid(&self, name: &str) -> Option<u32> {
        self.methods.values().find(|m| m.name == name).map(|m| m.uid)
    }

    /// Look up a signal uid by name. Property-update signals are reachable
    /// through their property uid.
    pub fn signal_uid(&self, name: &str) -> Option<u32> {
        self.signals
            .values()
            .find(|s| s.name == name)
            .map(|s| s.uid)
            .or_else(|| self.property_uid(name))
    }

    /// Look up a property uid by name.
    pub fn property_uid(&self, name: &str) -> Option<u32> {
        self.properties.values().find(|p| p.name == name).map(|p| p.uid)
    }

    /// The payload signature associated with a message, used by tracing.
    ///
    /// Calls and posts use the parameter signature, replies the return
    /// signature, events the signal or property signature. Unknown actions
    /// yield `"X"`.
    pub fn action_signature(&self, kind: crate::message::Kind, action: u32) -> String {
        use crate::message::Kind;
        match kind {
            Kind::Call | Kind::Post | Kind::Reply => match self.methods.get(&action) {
                Some(m) if kind == Kind::Reply => m.return_signature.clone(),
                Some(m) => m.parameters_signature.clone(),
                None => "X".to_string(),
            },
            Kind::Event => self
                .signals
                .get(&action)
                .map(|s| s.signature.clone())
                .or_else(|| self.properties.get(&action).map(|p| p.signature.clone()))
                .unwrap_or_else(|| "X".to_string()),
            _ => "X".to_string(),
        }
    }

    /// Encode in wire order: methods, signals, properties, description.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.methods.len() as u32);
        for (uid, method) in &self.methods {
            w.write_u32(*uid);
            w.write_u32(method.uid);
            w.write_string(&method.return_signature);
            w.write_string(&method.name);
            w.write_string(&method.parameters_signature);
            w.write_string(&method.description);
            w.write_u32(method.parameters.len() as u32);
            for parameter in &method.parameters {
                w.write_string(&parameter.name);
                w.write_string(&parameter.description);
            }
            w.write_string(&method.return_description);
        }
        w.write_u32(self.signals.len() as u32);
        for (uid, signal) in &self.signals {
            w.write_u32(*uid);
            w.write_u32(signal.uid);
            w.write_string(&signal.name);
            w.write_string(&signal.signature);
        }
        w.write_u32(self.properties.len() as u32);
        for (uid, property) in &self.properties {
            w.write_u32(*uid);
            w.write_u32(property.uid);
            w.write_string(&property.name);
            w.write_string(&property.signature);
        }
        w.write_string(&self.description);
    }

    /// Decode from wire order.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut methods = HashMap::new();
        let method_count = r.read_count(4)?;
        for _ in 0..method_count {
            let key = r.read_u32()?;
            let uid = r.read_u32()?;
            let return_signature = r.read_string()?;
            let name = r.read_string()?;
            let parameters_signature = r.read_string()?;
            let description = r.read_string()?;
            let parameter_count = r.read_count(8)?;
            let mut parameters = Vec::with_capacity(parameter_count);
            for _ in 0..parameter_count {
                parameters.push(MetaMethodParameter {
                    name: r.read_string()?,
                    description: r.read_string()?,
                });
            }
            let return_description = r.read_string()?;
            methods.insert(
                key,
                MetaMethod {
                    uid,
                    return_signature,
                    name,
                    parameters_signature,
                    description,
                    parameters,
                    return_description,
                },
            );
        }

        let mut signals = HashMap::new();
        let signal_count = r.read_count(4)?;
        for _ in 0..signal_count {
            let key = r.read_u32()?;
            let uid = r.read_u32()?;
            let name = r.read_string()?;
            let signature = r.read_string()?;
            signals.insert(key, MetaSignal { uid, name, signature });
        }

        let mut properties = HashMap::new();
        let property_count = r.read_count(4)?;
        for _ in 0..property_count {
            let key = r.read_u32()?;
            let uid = r.read_u32()?;
            let name = r.read_string()?;
            let signature = r.read_string()?;
            properties.insert(key, MetaProperty { uid, name, signature });
        }

        let description = r.read_string()?;
        Ok(Self { description, methods, signals, properties })
    }
}

/// The generic object interface implemented by every object.
///
/// These are the reserved uids below 0x64 plus the `traceObject` signal;
/// [`full_meta`] merges them into a user meta-object.
pub fn object_meta() -> MetaObject {
    let mut meta = MetaObject { description: "Object".to_string(), ..MetaObject::default() };
    let methods = [
        MetaMethod::new(action::REGISTER_EVENT, "registerEvent", "(IIL)", "L"),
        MetaMethod::new(action::UNREGISTER_EVENT, "unregisterEvent", "(IIL)", "v"),
        MetaMethod::new(action::META_OBJECT, "metaObject", "(I)", META_OBJECT_SIGNATURE),
        MetaMethod::new(action::TERMINATE, "terminate", "(I)", "v"),
        MetaMethod::new(action::PROPERTY, "property", "(m)", "m"),
        MetaMethod::new(action::SET_PROPERTY, "setProperty", "(mm)", "v"),
        MetaMethod::new(action::PROPERTIES, "properties", "()", "[s]"),
        MetaMethod::new(
            action::REGISTER_EVENT_WITH_SIGNATURE,
            "registerEventWithSignature",
            "(IILs)",
            "L",
        ),
        MetaMethod::new(action::IS_STATS_ENABLED, "isStatsEnabled", "()", "b"),
        MetaMethod::new(action::ENABLE_STATS, "enableStats", "(b)", "v"),
        MetaMethod::new(action::STATS, "stats", "()", STATS_SIGNATURE),
        MetaMethod::new(action::CLEAR_STATS, "clearStats", "()", "v"),
        MetaMethod::new(action::IS_TRACE_ENABLED, "isTraceEnabled", "()", "b"),
        MetaMethod::new(action::ENABLE_TRACE, "enableTrace", "(b)", "v"),
    ];
    for method in methods {
        meta.methods.insert(method.uid, method);
    }
    meta.signals.insert(
        action::TRACE_OBJECT,
        MetaSignal::new(action::TRACE_OBJECT, "traceObject", EVENT_TRACE_SIGNATURE),
    );
    meta
}

/// Merge the generic object interface into a user meta-object.
///
/// User entries win on uid collision, which cannot happen for well-formed
/// metas (user uids start at 0x64).
pub fn full_meta(user: &MetaObject) -> MetaObject {
    let mut meta = object_meta();
    meta.description = user.description.clone();
    meta.methods.extend(user.methods.iter().map(|(k, v)| (*k, v.clone())));
    meta.signals.extend(user.signals.iter().map(|(k, v)| (*k, v.clone())));
    meta.properties.extend(user.properties.iter().map(|(k, v)| (*k, v.clone())));
    meta
}

/// The meta-object of the authentication service (service 0, object 0).
pub fn service0_meta() -> MetaObject {
    let mut meta = MetaObject { description: "Server".to_string(), ..MetaObject::default() };
    meta.methods
        .insert(action::AUTHENTICATE, MetaMethod::new(action::AUTHENTICATE, "authenticate", "({sm})", "{sm}"));
    meta
}

/// Signature of the `stats()` return value.
pub const STATS_SIGNATURE: &str =
    "{I(I(fff)<MinMaxSum,minValue,maxValue,cumulatedValue>)<MethodStatistics,count,wall>}";

/// Wall-clock aggregate of one method's call durations, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MinMaxSum {
    /// Shortest observed duration.
    pub min: f32,
    /// Longest observed duration.
    pub max: f32,
    /// Sum of all observed durations.
    pub cumulated: f32,
}

/// Per-action call statistics, recorded while stats are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MethodStatistics {
    /// Number of completed calls.
    pub count: u32,
    /// Wall-clock aggregate.
    pub wall: MinMaxSum,
}

impl MethodStatistics {
    /// Fold one call duration into the aggregate.
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        let seconds = elapsed.as_secs_f32();
        if self.wall.min == 0.0 || seconds < self.wall.min {
            self.wall.min = seconds;
        }
        if seconds > self.wall.max {
            self.wall.max = seconds;
        }
        self.wall.cumulated += seconds;
    }

    /// Encode as `(I(fff))`.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.count);
        w.write_f32(self.wall.min);
        w.write_f32(self.wall.max);
        w.write_f32(self.wall.cumulated);
    }

    /// Decode from `(I(fff))`.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            count: r.read_u32()?,
            wall: MinMaxSum {
                min: r.read_f32()?,
                max: r.read_f32()?,
                cumulated: r.read_f32()?,
            },
        })
    }
}

/// Signature of a `traceObject` event payload.
pub const EVENT_TRACE_SIGNATURE: &str =
    "(IiIm(ll)<Timeval,tv_sec,tv_usec>)<EventTrace,id,kind,slotId,arguments,timestamp>";

/// Seconds/microseconds timestamp carried by trace events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    /// Seconds component.
    pub sec: i64,
    /// Microseconds component.
    pub usec: i64,
}

/// One traced message, emitted on the `traceObject` signal.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTrace {
    /// Monotonic trace id within the object.
    pub id: u32,
    /// Message type of the traced message.
    pub kind: i32,
    /// Action uid of the traced message.
    pub slot: u32,
    /// Payload of the traced message, tagged with its signature.
    pub arguments: Value,
    /// When the message was observed.
    pub timestamp: Timeval,
}

impl EventTrace {
    /// Encode in field order.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.id);
        w.write_i32(self.kind);
        w.write_u32(self.slot);
        self.arguments.write(w);
        w.write_i64(self.timestamp.sec);
        w.write_i64(self.timestamp.usec);
    }

    /// Decode in field order.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.read_u32()?,
            kind: r.read_i32()?,
            slot: r.read_u32()?,
            arguments: Value::read(r)?,
            timestamp: Timeval { sec: r.read_i64()?, usec: r.read_i64()? },
        })
    }
}
