//! Routing of inbound messages to registered actors.
//!
//! The router maps `(service id, object id)` to actors; the actor's own
//! switch on the action uid completes dispatch. A dispatch miss answers
//! calls with an error frame and never tears down the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qibus_proto::{Kind, Message};

use crate::channel::{Channel, ReplySink};
use crate::errors::ServerError;
use crate::object::{Activation, Actor, Terminator};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Objects of one exported service.
struct ServiceEntry {
    name: String,
    objects: HashMap<u32, Arc<dyn Actor>>,
    next_object_id: u32,
}

/// The `(service, object)` to actor table.
#[derive(Default)]
pub struct Router {
    services: Mutex<HashMap<u32, ServiceEntry>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `actor` as the main object (id 1) of service `id`.
    pub async fn add_service(
        &self,
        id: u32,
        name: &str,
        actor: Arc<dyn Actor>,
        terminate: Terminator,
    ) -> Result<(), ServerError> {
        actor
            .activate(Activation { service_id: id, object_id: 1, terminate })
            .await?;
        let mut services = lock(&self.services);
        services.insert(
            id,
            ServiceEntry {
                name: name.to_string(),
                objects: HashMap::from([(1, actor)]),
                next_object_id: 2,
            },
        );
        Ok(())
    }

    /// Export an additional object under an existing service, returning
    /// its object id.
    pub async fn add_object(
        &self,
        service_id: u32,
        actor: Arc<dyn Actor>,
        terminate: Terminator,
    ) -> Result<u32, ServerError> {
        let object_id = {
            let mut services = lock(&self.services);
            let entry = services
                .get_mut(&service_id)
                .ok_or(ServerError::UnknownService(service_id))?;
            let object_id = entry.next_object_id;
            entry.next_object_id += 1;
            entry.objects.insert(object_id, actor.clone());
            object_id
        };
        actor
            .activate(Activation { service_id, object_id, terminate })
            .await?;
        Ok(object_id)
    }

    /// Drop a whole service, returning its actors for termination.
    pub fn remove_service(&self, id: u32) -> Option<(String, Vec<Arc<dyn Actor>>)> {
        let entry = lock(&self.services).remove(&id)?;
        Some((entry.name, entry.objects.into_values().collect()))
    }

    /// Resolve the actor for a message destination.
    pub fn find(&self, service: u32, object: u32) -> Result<Arc<dyn Actor>, ServerError> {
        let services = lock(&self.services);
        let entry = services.get(&service).ok_or(ServerError::UnknownService(service))?;
        entry
            .objects
            .get(&object)
            .cloned()
            .ok_or(ServerError::UnknownObject(object))
    }

    /// Name of a registered service, if any.
    pub fn service_name(&self, id: u32) -> Option<String> {
        lock(&self.services).get(&id).map(|entry| entry.name.clone())
    }

    /// Route one message to its actor.
    ///
    /// Calls to unknown destinations are answered with an error frame;
    /// other kinds are dropped with a log line.
    pub async fn dispatch(&self, msg: Message, from: &Channel) {
        let actor = match self.find(msg.header.service(), msg.header.object()) {
            Ok(actor) => actor,
            Err(err) => {
                tracing::info!("dispatch miss: {err} ({:?})", msg.header);
                if msg.header.kind() == Some(Kind::Call) {
                    if let Err(send_err) = from.send_error(&msg.header, &err.to_string()).await {
                        tracing::debug!("cannot answer dispatch miss: {send_err}");
                    }
                }
                return;
            },
        };
        if let Err(err) = actor.receive(msg, from).await {
            tracing::warn!("actor failed to process message: {err}");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("services", &lock(&self.services).len()).finish()
    }
}
