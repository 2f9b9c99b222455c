//! Framed messages: the 28-byte header plus an opaque payload.
//!
//! The header is parsed zero-copy from untrusted bytes: every field is a
//! little-endian byte array, so any 28-byte pattern is a structurally valid
//! cast and validation (magic, version, size cap) happens explicitly
//! afterwards. Payload interpretation belongs to the caller; this module
//! never looks inside it.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Protocol magic number, `0x42 0xDE 0xAD 0x42` on the wire (little-endian).
pub const MAGIC: u32 = 0x42DE_AD42;

/// Supported protocol version.
pub const VERSION: u16 = 0;

/// Size of the serialized header in bytes.
pub const HEADER_SIZE: usize = 28;

/// Default payload size cap applied by readers.
///
/// The framing itself has no limit; this is the configurable upper bound
/// enforced before any allocation.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Message type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Method invocation expecting a reply.
    Call = 1,
    /// Successful response to a call.
    Reply = 2,
    /// Failed response to a call; payload is a string value.
    Error = 3,
    /// Fire-and-forget invocation.
    Post = 4,
    /// Signal or property-update notification.
    Event = 5,
    /// Capability-map exchange (legacy authentication).
    Capability = 6,
    /// Request to cancel a pending call.
    Cancel = 7,
    /// Acknowledgement that a call was cancelled.
    Cancelled = 8,
}

impl Kind {
    /// Decode a header type byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Call),
            2 => Some(Self::Reply),
            3 => Some(Self::Error),
            4 => Some(Self::Post),
            5 => Some(Self::Event),
            6 => Some(Self::Capability),
            7 => Some(Self::Cancel),
            8 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The wire representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Call => "call",
            Self::Reply => "reply",
            Self::Error => "error",
            Self::Post => "post",
            Self::Event => "event",
            Self::Capability => "capability",
            Self::Cancel => "cancel",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Fixed 28-byte message header (little-endian).
///
/// Fields are stored as raw byte arrays so the struct has no alignment
/// requirements and can be cast directly from network bytes. All accessors
/// decode on the fly.
///
/// Layout: magic `u32`, id `u32`, size `u32`, version `u16`, type `u8`,
/// flags `u8`, service `u32`, object `u32`, action `u32`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    magic: [u8; 4],
    id: [u8; 4],
    size: [u8; 4],
    version: [u8; 2],
    kind: u8,
    flags: u8,
    service: [u8; 4],
    object: [u8; 4],
    action: [u8; 4],
}

impl Header {
    /// Create a header for the given message type and destination.
    ///
    /// `size` starts at zero; [`Message`] constructors keep it in sync with
    /// the payload.
    pub fn new(kind: Kind, id: u32, service: u32, object: u32, action: u32) -> Self {
        Self {
            magic: MAGIC.to_le_bytes(),
            id: id.to_le_bytes(),
            size: [0; 4],
            version: VERSION.to_le_bytes(),
            kind: kind.to_u8(),
            flags: 0,
            service: service.to_le_bytes(),
            object: object.to_le_bytes(),
            action: action.to_le_bytes(),
        }
    }

    /// Parse and validate a header from exactly [`HEADER_SIZE`] bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = Self::read_from_bytes(buf)
            .map_err(|_| ProtocolError::ShortRead { expected: HEADER_SIZE, got: buf.len() })?;
        header.validate()?;
        Ok(header)
    }

    /// Reject headers with a wrong magic number or version.
    pub fn validate(&self) -> Result<()> {
        if self.magic() != MAGIC {
            return Err(ProtocolError::BadMagic { found: self.magic() });
        }
        if self.version() != VERSION {
            return Err(ProtocolError::BadVersion { found: self.version() });
        }
        Ok(())
    }

    /// Magic number field.
    pub fn magic(&self) -> u32 {
        u32::from_le_bytes(self.magic)
    }

    /// Request correlation id. Replies and errors echo the call's id.
    pub fn id(&self) -> u32 {
        u32::from_le_bytes(self.id)
    }

    /// Payload byte count.
    pub fn size(&self) -> u32 {
        u32::from_le_bytes(self.size)
    }

    /// Protocol version field.
    pub fn version(&self) -> u16 {
        u16::from_le_bytes(self.version)
    }

    /// Raw message type byte.
    pub fn kind_raw(&self) -> u8 {
        self.kind
    }

    /// Decoded message type, if known.
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_u8(self.kind)
    }

    /// Flags byte.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Destination service id.
    pub fn service(&self) -> u32 {
        u32::from_le_bytes(self.service)
    }

    /// Destination object id within the service.
    pub fn object(&self) -> u32 {
        u32::from_le_bytes(self.object)
    }

    /// Action uid: method, signal or property id. Events carry the signal
    /// uid here.
    pub fn action(&self) -> u32 {
        u32::from_le_bytes(self.action)
    }

    /// Set the correlation id.
    pub fn set_id(&mut self, id: u32) {
        self.id = id.to_le_bytes();
    }

    /// Set the message type.
    pub fn set_kind(&mut self, kind: Kind) {
        self.kind = kind.to_u8();
    }

    /// Set the flags byte.
    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub(crate) fn set_size(&mut self, size: u32) {
        self.size = size.to_le_bytes();
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("kind", &self.kind_raw())
            .field("flags", &self.flags())
            .field("service", &self.service())
            .field("object", &self.object())
            .field("action", &self.action())
            .finish()
    }
}

/// A complete framed message: header plus opaque payload.
///
/// The header's `size` field always matches `payload.len()`; constructors
/// enforce it and [`Message::read`] verifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame header.
    pub header: Header,
    /// Payload bytes, encoded per the destination action's signature.
    pub payload: Bytes,
}

impl Message {
    /// Create a message, keeping the header size field consistent.
    pub fn new(kind: Kind, id: u32, service: u32, object: u32, action: u32, payload: Bytes) -> Self {
        Self::from_parts(Header::new(kind, id, service, object, action), payload)
    }

    /// Assemble a message from an existing header, fixing up the size field.
    pub fn from_parts(mut header: Header, payload: Bytes) -> Self {
        header.set_size(payload.len() as u32);
        Self { header, payload }
    }

    /// Serialize into a contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(self.header.as_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Parse a message from a contiguous buffer.
    ///
    /// Fails with [`ProtocolError::ShortRead`] when fewer than
    /// [`HEADER_SIZE`] bytes are present or the payload is truncated.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortRead { expected: HEADER_SIZE, got: buf.len() });
        }
        let header = Header::parse(&buf[..HEADER_SIZE])?;
        let size = header.size() as usize;
        let rest = &buf[HEADER_SIZE..];
        if rest.len() < size {
            return Err(ProtocolError::ShortRead { expected: size, got: rest.len() });
        }
        Ok(Self { header, payload: Bytes::copy_from_slice(&rest[..size]) })
    }

    /// Read one message from an async byte stream.
    ///
    /// Blocks until the 28 header bytes are consumed, validates them, then
    /// blocks until `size` payload bytes are consumed. `max_payload` is
    /// checked before the payload buffer is allocated.
    pub async fn read<R>(reader: &mut R, max_payload: u32) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; HEADER_SIZE];
        reader.read_exact(&mut head).await?;
        let header = Header::parse(&head)?;
        let size = header.size();
        if size > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: size as usize,
                max: max_payload as usize,
            });
        }
        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Self { header, payload: Bytes::from(payload) })
    }

    /// Write the message to an async byte stream.
    ///
    /// A short write surfaces as the underlying I/O error.
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.header.as_bytes()).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(Kind::Call, 4, 1, 2, 3, Bytes::from_static(&[0xAB, 0xCD]))
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let msg = sample();
        let bytes = msg.to_bytes();
        // magic, little-endian 0x42DEAD42
        assert_eq!(&bytes[0..4], &[0x42, 0xAD, 0xDE, 0x42]);
        // id
        assert_eq!(&bytes[4..8], &[4, 0, 0, 0]);
        // size
        assert_eq!(&bytes[8..12], &[2, 0, 0, 0]);
        // version
        assert_eq!(&bytes[12..14], &[0, 0]);
        // type, flags
        assert_eq!(bytes[14], 1);
        assert_eq!(bytes[15], 0);
        // service, object, action
        assert_eq!(&bytes[16..20], &[1, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[2, 0, 0, 0]);
        assert_eq!(&bytes[24..28], &[3, 0, 0, 0]);
        // payload
        assert_eq!(&bytes[28..], &[0xAB, 0xCD]);
    }

    #[test]
    fn authenticate_call_header_parses() {
        // Header of the first authenticate call a client sends.
        let mut header = Header::new(Kind::Call, 3, 0, 0, 8);
        header.set_size(110);
        let parsed = Header::parse(header.as_bytes()).unwrap();
        assert_eq!(parsed.id(), 3);
        assert_eq!(parsed.size(), 110);
        assert_eq!(parsed.kind(), Some(Kind::Call));
        assert_eq!(parsed.service(), 0);
        assert_eq!(parsed.object(), 0);
        assert_eq!(parsed.action(), 8);
    }

    #[test]
    fn message_round_trip() {
        let msg = sample();
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn truncated_header_rejected_at_every_length() {
        let bytes = sample().to_bytes();
        for k in 0..HEADER_SIZE {
            let err = Message::from_bytes(&bytes[..k]).unwrap_err();
            assert!(matches!(err, ProtocolError::ShortRead { .. }), "k={k}: {err}");
        }
        // The full header alone parses (payload missing is a separate error).
        assert!(Header::parse(&bytes[..HEADER_SIZE]).is_ok());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample().to_bytes().to_vec();
        bytes[0] = 0x43;
        assert!(matches!(Message::from_bytes(&bytes), Err(ProtocolError::BadMagic { .. })));
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = sample().to_bytes().to_vec();
        bytes[12] = 7;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(ProtocolError::BadVersion { found: 7 })
        ));
    }

    #[tokio::test]
    async fn async_round_trip() {
        let msg = sample();
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = Message::read(&mut cursor, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(parsed, msg);
    }

    #[tokio::test]
    async fn payload_cap_enforced_before_read() {
        let big = Message::new(Kind::Call, 1, 1, 1, 1, Bytes::from(vec![0u8; 64]));
        let mut buf = Vec::new();
        big.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = Message::read(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { size: 64, max: 16 }));
    }

    #[test]
    fn kind_round_trips() {
        for raw in 1..=8u8 {
            let kind = Kind::from_u8(raw).unwrap();
            assert_eq!(kind.to_u8(), raw);
        }
        assert_eq!(Kind::from_u8(0), None);
        assert_eq!(Kind::from_u8(9), None);
    }
}
