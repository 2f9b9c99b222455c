//! The service directory: a two-phase registry of live services.
//!
//! Registration is staged: `register_service` validates and parks the
//! record, `service_ready` moves it to the live set and announces it on
//! the `serviceAdded` signal. `unregister_service` removes from either
//! set, announcing `serviceRemoved` only for live services.
//!
//! [`ServiceDirectory`] is the pure state machine behind a single mutex;
//! [`directory_object`] wires it into a [`BasicObject`] exported as
//! service 1.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use qibus_net::machine_id;
use qibus_proto::service::ServiceEvent;
use qibus_proto::{ByteReader, ByteWriter, MetaMethod, MetaObject, MetaSignal, ServiceInfo};

use crate::errors::DirectoryError;
use crate::object::{BasicObject, ObjectBuilder};
use crate::signals::SignalHub;

/// Directory action uids (user range of the directory meta-object).
pub mod uid {
    /// `service(name) -> ServiceInfo`.
    pub const SERVICE: u32 = 100;
    /// `services() -> [ServiceInfo]`.
    pub const SERVICES: u32 = 101;
    /// `registerService(info) -> id`.
    pub const REGISTER_SERVICE: u32 = 102;
    /// `unregisterService(id)`.
    pub const UNREGISTER_SERVICE: u32 = 103;
    /// `serviceReady(id)`.
    pub const SERVICE_READY: u32 = 104;
    /// `updateServiceInfo(info)`.
    pub const UPDATE_SERVICE_INFO: u32 = 105;
    /// `serviceAdded(id, name)` signal.
    pub const SERVICE_ADDED: u32 = 106;
    /// `serviceRemoved(id, name)` signal.
    pub const SERVICE_REMOVED: u32 = 107;
    /// `machineId() -> string`.
    pub const MACHINE_ID: u32 = 108;
}

/// Two-phase in-memory service registry.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    staging: HashMap<u32, ServiceInfo>,
    services: HashMap<u32, ServiceInfo>,
    last_uuid: u32,
}

impl ServiceDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live service by name.
    pub fn service(&self, name: &str) -> Result<ServiceInfo, DirectoryError> {
        self.services
            .values()
            .find(|info| info.name == name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// All live services, in unspecified order.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.values().cloned().collect()
    }

    /// Validate and stage a service record, assigning a fresh id.
    ///
    /// The name must be unique across both the staging and live sets.
    pub fn register_service(&mut self, mut info: ServiceInfo) -> Result<u32, DirectoryError> {
        check_service_info(&info)?;
        let name_taken = self
            .staging
            .values()
            .chain(self.services.values())
            .any(|existing| existing.name == info.name);
        if name_taken {
            return Err(DirectoryError::DuplicateName(info.name));
        }
        self.last_uuid += 1;
        info.service_id = self.last_uuid;
        self.staging.insert(self.last_uuid, info);
        Ok(self.last_uuid)
    }

    /// Promote a staged service to the live set.
    ///
    /// Returns the promoted record for the `serviceAdded` announcement.
    pub fn service_ready(&mut self, id: u32) -> Result<ServiceInfo, DirectoryError> {
        let info = self.staging.remove(&id).ok_or(DirectoryError::NotStaging(id))?;
        self.services.insert(id, info.clone());
        Ok(info)
    }

    /// Remove a service from whichever set holds it.
    ///
    /// Returns the record and whether it was live (only live removals are
    /// announced).
    pub fn unregister_service(&mut self, id: u32) -> Result<(ServiceInfo, bool), DirectoryError> {
        if let Some(info) = self.services.remove(&id) {
            return Ok((info, true));
        }
        if let Some(info) = self.staging.remove(&id) {
            return Ok((info, false));
        }
        Err(DirectoryError::IdNotFound(id))
    }

    /// Replace a live service's record; the name is immutable.
    pub fn update_service_info(&mut self, info: ServiceInfo) -> Result<(), DirectoryError> {
        check_service_info(&info)?;
        let existing = self
            .services
            .get(&info.service_id)
            .ok_or(DirectoryError::IdNotFound(info.service_id))?;
        if existing.name != info.name {
            return Err(DirectoryError::NameMismatch {
                expected: existing.name.clone(),
                got: info.name,
            });
        }
        self.services.insert(info.service_id, info);
        Ok(())
    }
}

/// Registration-time validation of a service record.
fn check_service_info(info: &ServiceInfo) -> Result<(), DirectoryError> {
    if info.name.is_empty() {
        return Err(DirectoryError::InvalidInfo("empty name not allowed".to_string()));
    }
    if info.machine_id.is_empty() {
        return Err(DirectoryError::InvalidInfo("empty machine id not allowed".to_string()));
    }
    if info.process_id == 0 {
        return Err(DirectoryError::InvalidInfo("process id zero not allowed".to_string()));
    }
    if info.endpoints.is_empty() {
        return Err(DirectoryError::InvalidInfo("missing endpoint".to_string()));
    }
    if info.endpoints.iter().any(String::is_empty) {
        return Err(DirectoryError::InvalidInfo("empty endpoint not allowed".to_string()));
    }
    Ok(())
}

/// The directory's meta-object.
pub fn directory_meta() -> MetaObject {
    let mut meta =
        MetaObject { description: "ServiceDirectory".to_string(), ..MetaObject::default() };
    let service_info_signature = "(sIsI[s]s)<ServiceInfo,name,serviceId,machineId,processId,endpoints,sessionId>";
    let methods = [
        MetaMethod::new(uid::SERVICE, "service", "(s)", service_info_signature),
        MetaMethod::new(uid::SERVICES, "services", "()", &format!("[{service_info_signature}]")),
        MetaMethod::new(uid::REGISTER_SERVICE, "registerService", &format!("({service_info_signature})"), "I"),
        MetaMethod::new(uid::UNREGISTER_SERVICE, "unregisterService", "(I)", "v"),
        MetaMethod::new(uid::SERVICE_READY, "serviceReady", "(I)", "v"),
        MetaMethod::new(uid::UPDATE_SERVICE_INFO, "updateServiceInfo", &format!("({service_info_signature})"), "v"),
        MetaMethod::new(uid::MACHINE_ID, "machineId", "()", "s"),
    ];
    for method in methods {
        meta.methods.insert(method.uid, method);
    }
    meta.signals
        .insert(uid::SERVICE_ADDED, MetaSignal::new(uid::SERVICE_ADDED, "serviceAdded", "(Is)"));
    meta.signals.insert(
        uid::SERVICE_REMOVED,
        MetaSignal::new(uid::SERVICE_REMOVED, "serviceRemoved", "(Is)"),
    );
    meta
}

fn lock(state: &Mutex<ServiceDirectory>) -> MutexGuard<'_, ServiceDirectory> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn event_payload(info: &ServiceInfo) -> Bytes {
    let mut w = ByteWriter::new();
    ServiceEvent { service_id: info.service_id, name: info.name.clone() }.write(&mut w);
    w.into_bytes()
}

/// Wire a shared [`ServiceDirectory`] into an exportable object.
///
/// Name uniqueness under concurrent registration is decided by the single
/// state mutex: one caller wins, the other observes `DuplicateName`.
pub fn directory_object(state: Arc<Mutex<ServiceDirectory>>) -> BasicObject {
    let hub = SignalHub::new();

    let service_state = state.clone();
    let services_state = state.clone();
    let register_state = state.clone();
    let unregister_state = state.clone();
    let ready_state = state.clone();
    let update_state = state;
    let ready_hub = hub.clone();
    let unregister_hub = hub.clone();

    ObjectBuilder::new(directory_meta())
        .signals(hub)
        .method(uid::SERVICE, move |payload: Bytes| {
            let state = service_state.clone();
            async move {
                let mut r = ByteReader::new(&payload);
                let name = r.read_string().map_err(|e| e.to_string())?;
                let info = lock(&state).service(&name).map_err(|e| e.to_string())?;
                let mut w = ByteWriter::new();
                info.write(&mut w);
                Ok(w.into_bytes())
            }
        })
        .method(uid::SERVICES, move |_payload: Bytes| {
            let state = services_state.clone();
            async move {
                let services = lock(&state).services();
                let mut w = ByteWriter::new();
                w.write_u32(services.len() as u32);
                for info in &services {
                    info.write(&mut w);
                }
                Ok(w.into_bytes())
            }
        })
        .method(uid::REGISTER_SERVICE, move |payload: Bytes| {
            let state = register_state.clone();
            async move {
                let mut r = ByteReader::new(&payload);
                let info = ServiceInfo::read(&mut r).map_err(|e| e.to_string())?;
                let id = lock(&state).register_service(info).map_err(|e| e.to_string())?;
                let mut w = ByteWriter::new();
                w.write_u32(id);
                Ok(w.into_bytes())
            }
        })
        .method(uid::UNREGISTER_SERVICE, move |payload: Bytes| {
            let state = unregister_state.clone();
            let hub = unregister_hub.clone();
            async move {
                let mut r = ByteReader::new(&payload);
                let id = r.read_u32().map_err(|e| e.to_string())?;
                let (info, was_live) =
                    lock(&state).unregister_service(id).map_err(|e| e.to_string())?;
                if was_live {
                    hub.emit(uid::SERVICE_REMOVED, event_payload(&info)).await;
                }
                Ok(Bytes::new())
            }
        })
        .method(uid::SERVICE_READY, move |payload: Bytes| {
            let state = ready_state.clone();
            let hub = ready_hub.clone();
            async move {
                let mut r = ByteReader::new(&payload);
                let id = r.read_u32().map_err(|e| e.to_string())?;
                let info = lock(&state).service_ready(id).map_err(|e| e.to_string())?;
                hub.emit(uid::SERVICE_ADDED, event_payload(&info)).await;
                Ok(Bytes::new())
            }
        })
        .method(uid::UPDATE_SERVICE_INFO, move |payload: Bytes| {
            let state = update_state.clone();
            async move {
                let mut r = ByteReader::new(&payload);
                let info = ServiceInfo::read(&mut r).map_err(|e| e.to_string())?;
                lock(&state).update_service_info(info).map_err(|e| e.to_string())?;
                Ok(Bytes::new())
            }
        })
        .method(uid::MACHINE_ID, move |_payload: Bytes| async move {
            let mut w = ByteWriter::new();
            w.write_string(machine_id());
            Ok(w.into_bytes())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            service_id: 0,
            machine_id: "m".to_string(),
            process_id: 1,
            endpoints: vec!["tcp://x:1".to_string()],
            session_id: String::new(),
        }
    }

    #[test]
    fn staged_service_is_invisible_until_ready() {
        let mut directory = ServiceDirectory::new();
        let id = directory.register_service(info("Foo")).unwrap();
        assert_eq!(id, 1);

        assert!(directory.services().is_empty());
        assert_eq!(directory.service("Foo"), Err(DirectoryError::NotFound("Foo".to_string())));

        directory.service_ready(id).unwrap();
        assert_eq!(directory.service("Foo").unwrap().service_id, id);
        assert_eq!(directory.services().len(), 1);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut directory = ServiceDirectory::new();
        assert_eq!(directory.register_service(info("A")).unwrap(), 1);
        assert_eq!(directory.register_service(info("B")).unwrap(), 2);
        directory.unregister_service(1).unwrap();
        // Freed ids are never reused.
        assert_eq!(directory.register_service(info("C")).unwrap(), 3);
    }

    #[test]
    fn duplicate_names_rejected_in_both_sets() {
        let mut directory = ServiceDirectory::new();
        let id = directory.register_service(info("Foo")).unwrap();
        assert_eq!(
            directory.register_service(info("Foo")),
            Err(DirectoryError::DuplicateName("Foo".to_string()))
        );
        directory.service_ready(id).unwrap();
        assert_eq!(
            directory.register_service(info("Foo")),
            Err(DirectoryError::DuplicateName("Foo".to_string()))
        );
    }

    #[test]
    fn invalid_records_rejected() {
        let mut directory = ServiceDirectory::new();

        let mut bad = info("Foo");
        bad.name = String::new();
        assert!(matches!(
            directory.register_service(bad),
            Err(DirectoryError::InvalidInfo(_))
        ));

        let mut bad = info("Foo");
        bad.machine_id = String::new();
        assert!(matches!(
            directory.register_service(bad),
            Err(DirectoryError::InvalidInfo(_))
        ));

        let mut bad = info("Foo");
        bad.process_id = 0;
        assert!(matches!(
            directory.register_service(bad),
            Err(DirectoryError::InvalidInfo(_))
        ));

        let mut bad = info("Foo");
        bad.endpoints.clear();
        assert!(matches!(
            directory.register_service(bad),
            Err(DirectoryError::InvalidInfo(_))
        ));

        let mut bad = info("Foo");
        bad.endpoints.push(String::new());
        assert!(matches!(
            directory.register_service(bad),
            Err(DirectoryError::InvalidInfo(_))
        ));
    }

    #[test]
    fn ready_requires_staging() {
        let mut directory = ServiceDirectory::new();
        assert_eq!(directory.service_ready(7), Err(DirectoryError::NotStaging(7)));

        let id = directory.register_service(info("Foo")).unwrap();
        directory.service_ready(id).unwrap();
        assert_eq!(directory.service_ready(id), Err(DirectoryError::NotStaging(id)));
    }

    #[test]
    fn unregister_reports_liveness() {
        let mut directory = ServiceDirectory::new();
        let staged = directory.register_service(info("Staged")).unwrap();
        let live = directory.register_service(info("Live")).unwrap();
        directory.service_ready(live).unwrap();

        assert!(!directory.unregister_service(staged).unwrap().1);
        assert!(directory.unregister_service(live).unwrap().1);
        assert_eq!(directory.unregister_service(live), Err(DirectoryError::IdNotFound(live)));
    }

    #[test]
    fn update_keeps_name_immutable() {
        let mut directory = ServiceDirectory::new();
        let id = directory.register_service(info("Foo")).unwrap();
        directory.service_ready(id).unwrap();

        let mut update = info("Foo");
        update.service_id = id;
        update.endpoints = vec!["tcp://y:2".to_string()];
        directory.update_service_info(update).unwrap();
        assert_eq!(directory.service("Foo").unwrap().endpoints, vec!["tcp://y:2".to_string()]);

        let mut renamed = info("Bar");
        renamed.service_id = id;
        assert!(matches!(
            directory.update_service_info(renamed),
            Err(DirectoryError::NameMismatch { .. })
        ));
    }

    #[test]
    fn concurrent_registration_yields_one_winner() {
        let state = Arc::new(Mutex::new(ServiceDirectory::new()));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let state = state.clone();
            handles.push(std::thread::spawn(move || {
                lock(&state).register_service(info("Foo"))
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(DirectoryError::DuplicateName(_))))
            .count();
        assert_eq!((wins, duplicates), (1, 1));
    }

    #[test]
    fn directory_meta_signatures_parse() {
        let meta = directory_meta();
        for method in meta.methods.values() {
            assert!(qibus_proto::Type::parse(&method.parameters_signature).is_ok());
            assert!(qibus_proto::Type::parse(&method.return_signature).is_ok());
        }
        for signal in meta.signals.values() {
            assert!(qibus_proto::Type::parse(&signal.signature).is_ok());
        }
    }
}
