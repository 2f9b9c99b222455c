//! Wire codec for the qi-messaging protocol.
//!
//! qi-messaging is a binary, object-oriented RPC protocol: processes expose
//! hierarchies of objects (methods, signals, properties) and call them over
//! framed byte streams. This crate owns everything that touches bytes:
//!
//! - [`basic`]: little-endian primitive and string encoding
//! - [`signature`]: the recursive type grammar (`i`, `[s]`, `{sm}`, ...)
//! - [`value`]: dynamically typed `(signature, bytes)` values
//! - [`message`]: the 28-byte framed message header
//! - [`meta`]: machine-readable object descriptions and reserved action uids
//! - [`reference`]: on-the-wire remote object handles
//! - [`service`]: service directory records
//! - [`capability`]: the authentication/feature-negotiation map
//!
//! No I/O policy lives here; transports and dispatch are built on top in
//! `qibus-net`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod basic;
pub mod capability;
mod errors;
pub mod message;
pub mod meta;
pub mod reference;
pub mod service;
pub mod signature;
pub mod value;

pub use basic::{ByteReader, ByteWriter};
pub use capability::{AuthState, CapabilityMap};
pub use errors::{ProtocolError, Result};
pub use message::{Header, Kind, Message, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC, VERSION};
pub use meta::{MetaMethod, MetaObject, MetaProperty, MetaSignal, MethodStatistics};
pub use reference::ObjectReference;
pub use service::{ServiceEvent, ServiceInfo};
pub use signature::Type;
pub use value::Value;
