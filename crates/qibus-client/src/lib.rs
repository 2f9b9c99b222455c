//! Client side of the qi-messaging protocol.
//!
//! A [`Client`] wraps one endpoint: it correlates calls with replies by
//! request id and turns signal subscriptions into channels. [`auth`] drives
//! the capability handshake that must complete before a server routes
//! anything else. A [`Proxy`] resolves method and signal names through a
//! fetched meta-object, and a [`Session`] ties it together: directory
//! tracking, a connection pool, and name-based proxy construction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod client;
mod errors;
pub mod proxy;
pub mod session;

pub use client::{Client, ClientConfig, Subscription};
pub use errors::ClientError;
pub use proxy::{fetch_meta_object, Proxy};
pub use session::{Session, SessionConfig};
