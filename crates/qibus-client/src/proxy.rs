//! Proxies: name-based access to a remote object.
//!
//! A proxy is a thin wrapper over [`Client::call`]: it fetches the remote
//! meta-object once and resolves method, signal and property names to
//! action uids. Statically generated proxies live outside this crate; this
//! is the dynamic core they would be built on.

use bytes::Bytes;
use qibus_proto::meta::action;
use qibus_proto::{ByteReader, ByteWriter, MetaObject, Value};

use crate::client::{Client, Subscription};
use crate::errors::ClientError;

/// Query the meta-object of a remote object.
pub async fn fetch_meta_object(
    client: &Client,
    service: u32,
    object: u32,
) -> Result<MetaObject, ClientError> {
    let mut w = ByteWriter::new();
    w.write_u32(object);
    let response = client.call(service, object, action::META_OBJECT, w.into_bytes()).await?;
    let mut r = ByteReader::new(&response);
    MetaObject::read(&mut r).map_err(Into::into)
}

/// A connected remote object.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: Client,
    meta: MetaObject,
    service: u32,
    object: u32,
}

impl Proxy {
    /// Fetch the remote meta-object and build a proxy.
    pub async fn connect(client: Client, service: u32, object: u32) -> Result<Self, ClientError> {
        let meta = fetch_meta_object(&client, service, object).await?;
        Ok(Self { client, meta, service, object })
    }

    /// Build a proxy from an already-known meta-object (e.g. from an
    /// object reference).
    pub fn from_meta(client: Client, meta: MetaObject, service: u32, object: u32) -> Self {
        Self { client, meta, service, object }
    }

    /// The service id this proxy talks to.
    pub fn service_id(&self) -> u32 {
        self.service
    }

    /// The object id within the service.
    pub fn object_id(&self) -> u32 {
        self.object
    }

    /// The remote meta-object.
    pub fn meta(&self) -> &MetaObject {
        &self.meta
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a method name.
    pub fn method_uid(&self, name: &str) -> Result<u32, ClientError> {
        self.meta.method_uid(name).ok_or_else(|| ClientError::UnknownMethod(name.to_string()))
    }

    /// Resolve a signal (or property) name.
    pub fn signal_uid(&self, name: &str) -> Result<u32, ClientError> {
        self.meta.signal_uid(name).ok_or_else(|| ClientError::UnknownSignal(name.to_string()))
    }

    /// Call a method by name.
    pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, ClientError> {
        let uid = self.method_uid(method)?;
        self.call_uid(uid, payload).await
    }

    /// Call a method by action uid.
    pub async fn call_uid(&self, uid: u32, payload: Bytes) -> Result<Bytes, ClientError> {
        self.client.call(self.service, self.object, uid, payload).await
    }

    /// Subscribe to a signal by name.
    pub async fn subscribe(&self, signal: &str) -> Result<Subscription, ClientError> {
        let uid = self.signal_uid(signal)?;
        self.subscribe_uid(uid).await
    }

    /// Subscribe to a signal by action uid.
    pub async fn subscribe_uid(&self, uid: u32) -> Result<Subscription, ClientError> {
        self.client.subscribe(self.service, self.object, uid).await
    }

    /// Read a property by name.
    pub async fn property(&self, name: &str) -> Result<Value, ClientError> {
        let mut w = ByteWriter::new();
        Value::from_string(name).write(&mut w);
        let response = self.call_uid(action::PROPERTY, w.into_bytes()).await?;
        let mut r = ByteReader::new(&response);
        Value::read(&mut r).map_err(Into::into)
    }

    /// Write a property by name.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<(), ClientError> {
        let mut w = ByteWriter::new();
        Value::from_string(name).write(&mut w);
        value.write(&mut w);
        self.call_uid(action::SET_PROPERTY, w.into_bytes()).await?;
        Ok(())
    }

    /// Names of the object's stored properties.
    pub async fn properties(&self) -> Result<Vec<String>, ClientError> {
        let response = self.call_uid(action::PROPERTIES, Bytes::new()).await?;
        let mut r = ByteReader::new(&response);
        let count = r.read_count(4)?;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.read_string()?);
        }
        Ok(names)
    }
}
