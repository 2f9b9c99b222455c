//! Protocol error types.
//!
//! Every failure mode of the codec maps to one variant. Variants carry
//! strings rather than source errors so the type stays `Clone` - a single
//! decode failure can fan out to several waiting handlers.

use thiserror::Error;

/// Convenience alias used across the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the expected number of bytes was read.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes required by the decoder.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// A sink accepted fewer bytes than required.
    #[error("short write: expected {expected} bytes, got {got}")]
    ShortWrite {
        /// Bytes the encoder had to write.
        expected: usize,
        /// Bytes actually written.
        got: usize,
    },

    /// Frame did not start with the protocol magic number.
    #[error("bad frame: invalid magic {found:#010x}")]
    BadMagic {
        /// The value found where the magic was expected.
        found: u32,
    },

    /// Frame carried an unsupported protocol version.
    #[error("bad frame: unsupported version {found}")]
    BadVersion {
        /// The version found in the header.
        found: u16,
    },

    /// Frame header carried an unknown message type.
    #[error("bad frame: unknown message type {found}")]
    BadKind {
        /// The type byte found in the header.
        found: u8,
    },

    /// A length field exceeds the configured or remaining limit.
    ///
    /// Reported before any allocation takes place.
    #[error("payload too large: {size} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Announced size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// The signature grammar could not be parsed.
    #[error("bad signature at offset {pos} in {signature:?}")]
    BadSignature {
        /// Byte offset of the first offending character.
        pos: usize,
        /// The complete signature under parse.
        signature: String,
    },

    /// The payload bytes did not match the expected signature.
    #[error("decode mismatch: expected {expected:?}, found {found:?}")]
    DecodeMismatch {
        /// Signature the caller asked for.
        expected: String,
        /// Signature actually present.
        found: String,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Underlying I/O failure while framing.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
