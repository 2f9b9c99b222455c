//! Signal subscription bookkeeping.
//!
//! Subscriptions are keyed by `(signal uid, subscriber handler id)`; the
//! handler id is the 64-bit value the subscriber chose in its
//! `registerEvent` call. Emission sends one event frame per subscriber on
//! the channel that registered it; subscribers whose connection died are
//! dropped on the next emission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::channel::Channel;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One registered subscriber.
#[derive(Clone)]
struct Subscriber {
    channel: Channel,
    service: u32,
    object: u32,
}

/// Shared signal-subscription table of one object.
///
/// Cloned into action handlers that need to emit events (the object
/// itself, or service implementations like the directory).
#[derive(Clone, Default)]
pub struct SignalHub {
    subscribers: Arc<Mutex<HashMap<(u32, u64), Subscriber>>>,
}

impl SignalHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a signal uid.
    ///
    /// `service`/`object` come from the registration message and are
    /// echoed in every event frame sent to this subscriber.
    pub(crate) fn add(
        &self,
        signal: u32,
        handler_ref: u64,
        channel: Channel,
        service: u32,
        object: u32,
    ) {
        lock(&self.subscribers)
            .insert((signal, handler_ref), Subscriber { channel, service, object });
    }

    /// Drop one subscription; true if it existed.
    pub(crate) fn remove(&self, signal: u32, handler_ref: u64) -> bool {
        lock(&self.subscribers).remove(&(signal, handler_ref)).is_some()
    }

    /// Drop every subscription (object termination).
    pub(crate) fn clear(&self) {
        lock(&self.subscribers).clear();
    }

    /// Number of live subscriptions for one signal uid.
    pub fn subscriber_count(&self, signal: u32) -> usize {
        lock(&self.subscribers).keys().filter(|(uid, _)| *uid == signal).count()
    }

    /// Emit one event frame per subscriber of `signal`.
    ///
    /// Subscribers whose channel is gone are removed instead of reported.
    pub async fn emit(&self, signal: u32, payload: Bytes) {
        let targets: Vec<((u32, u64), Subscriber)> = lock(&self.subscribers)
            .iter()
            .filter(|((uid, _), _)| *uid == signal)
            .map(|(key, subscriber)| (*key, subscriber.clone()))
            .collect();

        for (key, subscriber) in targets {
            let sent = subscriber
                .channel
                .send_event(subscriber.service, subscriber.object, signal, payload.clone())
                .await;
            if let Err(err) = sent {
                tracing::debug!("dropping dead subscriber of signal {signal}: {err}");
                lock(&self.subscribers).remove(&key);
            }
        }
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("subscriptions", &lock(&self.subscribers).len())
            .finish()
    }
}
