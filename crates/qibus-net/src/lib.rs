//! Transports and message dispatch for the qi-messaging protocol.
//!
//! A [`Stream`] is one bidirectional, fully-ordered byte channel; dialers
//! and listeners exist for `tcp://`, `tcps://` (TLS), `quic://`,
//! `unix:///` and `pipe:///` URLs. An [`Endpoint`] wraps one stream: a
//! single reader task parses framed messages and fans them out to
//! registered handlers, while writes are serialized on the caller side.
//!
//! Handlers follow the filter/consumer/closer contract: the filter runs on
//! the reader task and must stay short and non-blocking; the consumer runs
//! on the handler's own task with a bounded inbox; the closer fires exactly
//! once when the handler stops.

// Not forbid: the pipe transport needs one audited unsafe block to claim
// ownership of descriptors received over a Unix socket.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod endpoint;
mod errors;
pub mod listen;
pub mod machine;
pub mod stream;
mod tls;
mod url;

pub use endpoint::{consumer, Closer, Consumer, Endpoint, EndpointConfig, Filter, HandlerId};
pub use errors::NetError;
pub use listen::Listener;
pub use machine::{machine_id, random_u64};
pub use stream::{dial, pipe, Stream};
