//! Per-connection reply channels.
//!
//! A [`Channel`] is the handle an actor uses to answer the connection a
//! message came from: replies and errors echo the call's header, events
//! carry the signal uid. Statistics and tracing are layered on as
//! [`ReplySink`] wrappers by the object runtime.

use async_trait::async_trait;
use bytes::Bytes;
use qibus_net::Endpoint;
use qibus_proto::{ByteWriter, Header, Kind, Message, Value};

use crate::errors::ServerError;

/// The reply surface handed to actors.
///
/// Object code talks to a `dyn ReplySink` so the runtime can interpose
/// statistics or trace recording per call.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Answer a call with a successful reply payload.
    async fn send_reply(&self, call: &Header, payload: Bytes) -> Result<(), ServerError>;

    /// Answer a call with an error; the payload is the string value of
    /// `detail`.
    async fn send_error(&self, call: &Header, detail: &str) -> Result<(), ServerError>;
}

/// Send half of one accepted connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Channel {
    endpoint: Endpoint,
}

impl Channel {
    /// Wrap a connection endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Acknowledge that a call was cancelled.
    pub async fn send_cancelled(&self, call: &Header) -> Result<(), ServerError> {
        let mut header = *call;
        header.set_kind(Kind::Cancelled);
        self.endpoint.send(Message::from_parts(header, Bytes::new())).await.map_err(Into::into)
    }

    /// Push an event frame for a signal or property update.
    pub async fn send_event(
        &self,
        service: u32,
        object: u32,
        signal: u32,
        payload: Bytes,
    ) -> Result<(), ServerError> {
        let msg = Message::new(Kind::Event, 0, service, object, signal, payload);
        self.endpoint.send(msg).await.map_err(Into::into)
    }

    /// Push a raw capability frame (legacy authentication).
    pub async fn send_capabilities(
        &self,
        map: &qibus_proto::CapabilityMap,
    ) -> Result<(), ServerError> {
        let msg = Message::new(Kind::Capability, 2, 0, 0, 0, map.to_payload());
        self.endpoint.send(msg).await.map_err(Into::into)
    }
}

#[async_trait]
impl ReplySink for Channel {
    async fn send_reply(&self, call: &Header, payload: Bytes) -> Result<(), ServerError> {
        let mut header = *call;
        header.set_kind(Kind::Reply);
        self.endpoint.send(Message::from_parts(header, payload)).await.map_err(Into::into)
    }

    async fn send_error(&self, call: &Header, detail: &str) -> Result<(), ServerError> {
        let mut header = *call;
        header.set_kind(Kind::Error);
        let mut w = ByteWriter::new();
        Value::from_string(detail).write(&mut w);
        self.endpoint.send(Message::from_parts(header, w.into_bytes())).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qibus_net::pipe;

    #[tokio::test]
    async fn replies_echo_the_call_header() {
        let (server_stream, client_stream) = pipe();
        let channel = Channel::new(Endpoint::new(server_stream));
        let peer = Endpoint::new(client_stream);
        let mut inbound = peer.receive_any();

        let call = Header::new(Kind::Call, 9, 1, 2, 0x64);
        channel.send_reply(&call, Bytes::from_static(b"ok")).await.unwrap();

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.header.kind(), Some(Kind::Reply));
        assert_eq!(msg.header.id(), 9);
        assert_eq!(msg.header.service(), 1);
        assert_eq!(msg.header.object(), 2);
        assert_eq!(msg.header.action(), 0x64);
        assert_eq!(msg.payload, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn errors_carry_a_string_value() {
        let (server_stream, client_stream) = pipe();
        let channel = Channel::new(Endpoint::new(server_stream));
        let peer = Endpoint::new(client_stream);
        let mut inbound = peer.receive_any();

        let call = Header::new(Kind::Call, 1, 1, 1, 0x64);
        channel.send_error(&call, "boom").await.unwrap();

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.header.kind(), Some(Kind::Error));
        let mut r = qibus_proto::ByteReader::new(&msg.payload);
        let value = Value::read(&mut r).unwrap();
        assert_eq!(value.to_str().unwrap(), "boom");
    }
}
