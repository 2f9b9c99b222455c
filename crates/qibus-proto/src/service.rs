//! Service directory records.

use crate::basic::{ByteReader, ByteWriter};
use crate::errors::Result;

/// One registered service as the directory advertises it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Unique service name.
    pub name: String,
    /// Directory-assigned service id.
    pub service_id: u32,
    /// Stable id of the host machine.
    pub machine_id: String,
    /// Process id of the hosting process.
    pub process_id: u32,
    /// Reachable endpoint URLs, e.g. `tcp://host:port`.
    pub endpoints: Vec<String>,
    /// Session id of the hosting session.
    pub session_id: String,
}

impl ServiceInfo {
    /// Encode in field order.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_string(&self.name);
        w.write_u32(self.service_id);
        w.write_string(&self.machine_id);
        w.write_u32(self.process_id);
        w.write_u32(self.endpoints.len() as u32);
        for endpoint in &self.endpoints {
            w.write_string(endpoint);
        }
        w.write_string(&self.session_id);
    }

    /// Decode in field order.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let name = r.read_string()?;
        let service_id = r.read_u32()?;
        let machine_id = r.read_string()?;
        let process_id = r.read_u32()?;
        let count = r.read_count(4)?;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            endpoints.push(r.read_string()?);
        }
        let session_id = r.read_string()?;
        Ok(Self { name, service_id, machine_id, process_id, endpoints, session_id })
    }
}

/// Payload of the directory's `serviceAdded` and `serviceRemoved` signals:
/// `(I s)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    /// Id of the added or removed service.
    pub service_id: u32,
    /// Name of the added or removed service.
    pub name: String,
}

impl ServiceEvent {
    /// Encode as `(I s)`.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.service_id);
        w.write_string(&self.name);
    }

    /// Decode from `(I s)`.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self { service_id: r.read_u32()?, name: r.read_string()? })
    }
}
