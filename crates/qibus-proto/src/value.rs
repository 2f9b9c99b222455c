//! Dynamically typed values.
//!
//! A [`Value`] is a `(signature, bytes)` pair: the signature string names
//! the type, the bytes are the encoded payload. On the wire a value is the
//! length-prefixed signature followed directly by the payload - there is no
//! payload length, so reading one back requires walking the encoded form
//! according to its signature.
//!
//! Typed projections (`to_bool`, `to_u32`, ...) validate the signature
//! before decoding and fail with `DecodeMismatch` otherwise.

use bytes::Bytes;

use crate::basic::{ByteReader, ByteWriter};
use crate::errors::{ProtocolError, Result};
use crate::reference;
use crate::signature::Type;

/// A tagged value: signature plus encoded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    signature: String,
    bytes: Bytes,
}

impl Value {
    /// Wrap already-encoded bytes under an arbitrary signature.
    pub fn opaque(signature: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { signature: signature.into(), bytes: bytes.into() }
    }

    /// The void value (`v`, zero payload bytes).
    pub fn void() -> Self {
        Self::opaque("v", Bytes::new())
    }

    /// A boolean value (`b`).
    pub fn from_bool(v: bool) -> Self {
        Self::opaque("b", vec![u8::from(v)])
    }

    /// A signed 32-bit value (`i`).
    pub fn from_i32(v: i32) -> Self {
        Self::opaque("i", v.to_le_bytes().to_vec())
    }

    /// An unsigned 32-bit value (`I`).
    pub fn from_u32(v: u32) -> Self {
        Self::opaque("I", v.to_le_bytes().to_vec())
    }

    /// A signed 64-bit value (`l`).
    pub fn from_i64(v: i64) -> Self {
        Self::opaque("l", v.to_le_bytes().to_vec())
    }

    /// An unsigned 64-bit value (`L`).
    pub fn from_u64(v: u64) -> Self {
        Self::opaque("L", v.to_le_bytes().to_vec())
    }

    /// A 32-bit float value (`f`).
    pub fn from_f32(v: f32) -> Self {
        Self::opaque("f", v.to_bits().to_le_bytes().to_vec())
    }

    /// A 64-bit float value (`d`).
    pub fn from_f64(v: f64) -> Self {
        Self::opaque("d", v.to_bits().to_le_bytes().to_vec())
    }

    /// A string value (`s`).
    pub fn from_string(v: &str) -> Self {
        let mut w = ByteWriter::new();
        w.write_string(v);
        Self::opaque("s", w.into_bytes())
    }

    /// The signature string of the contained type.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The encoded payload bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    fn expect_signature(&self, expected: &str) -> Result<ByteReader<'_>> {
        if self.signature != expected {
            return Err(ProtocolError::DecodeMismatch {
                expected: expected.to_string(),
                found: self.signature.clone(),
            });
        }
        Ok(ByteReader::new(&self.bytes))
    }

    /// Project to `bool`; the signature must be `b`.
    pub fn to_bool(&self) -> Result<bool> {
        self.expect_signature("b")?.read_bool()
    }

    /// Project to `i32`; the signature must be `i`.
    pub fn to_i32(&self) -> Result<i32> {
        self.expect_signature("i")?.read_i32()
    }

    /// Project to `u32`; the signature must be `I`.
    pub fn to_u32(&self) -> Result<u32> {
        self.expect_signature("I")?.read_u32()
    }

    /// Project to `i64`; the signature must be `l`.
    pub fn to_i64(&self) -> Result<i64> {
        self.expect_signature("l")?.read_i64()
    }

    /// Project to `u64`; the signature must be `L`.
    pub fn to_u64(&self) -> Result<u64> {
        self.expect_signature("L")?.read_u64()
    }

    /// Project to `f32`; the signature must be `f`.
    pub fn to_f32(&self) -> Result<f32> {
        self.expect_signature("f")?.read_f32()
    }

    /// Project to `f64`; the signature must be `d`.
    pub fn to_f64(&self) -> Result<f64> {
        self.expect_signature("d")?.read_f64()
    }

    /// Project to `String`; the signature must be `s`.
    pub fn to_str(&self) -> Result<String> {
        self.expect_signature("s")?.read_string()
    }

    /// Write signature then payload.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_string(&self.signature);
        w.write_raw(&self.bytes);
    }

    /// Read a value: signature string, then as many bytes as the signature
    /// describes.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let signature = r.read_string()?;
        let ty = Type::parse(&signature)?;
        let start = r.position();
        skip_encoded(&ty, r)?;
        let bytes = Bytes::copy_from_slice(&r.buffer()[start..r.position()]);
        Ok(Self { signature, bytes })
    }
}

/// Advance a reader past one encoded value of type `ty`.
fn skip_encoded(ty: &Type, r: &mut ByteReader<'_>) -> Result<()> {
    match ty {
        Type::Void | Type::Unknown => Ok(()),
        Type::Bool | Type::Int8 | Type::UInt8 => r.read_raw(1).map(|_| ()),
        Type::Int16 | Type::UInt16 => r.read_raw(2).map(|_| ()),
        Type::Int32 | Type::UInt32 | Type::Float32 => r.read_raw(4).map(|_| ()),
        Type::Int64 | Type::UInt64 | Type::Float64 => r.read_raw(8).map(|_| ()),
        Type::String => {
            let len = r.read_u32()? as usize;
            r.read_raw(len).map(|_| ())
        },
        Type::Value => Value::read(r).map(|_| ()),
        Type::Object => skip_encoded(reference::wire_type(), r),
        Type::List(element) => {
            let count = r.read_count(1)?;
            for _ in 0..count {
                skip_encoded(element, r)?;
            }
            Ok(())
        },
        Type::Map(key, value) => {
            let count = r.read_count(1)?;
            for _ in 0..count {
                skip_encoded(key, r)?;
                skip_encoded(value, r)?;
            }
            Ok(())
        },
        Type::Tuple(members) => {
            for member in members {
                skip_encoded(member, r)?;
            }
            Ok(())
        },
        Type::Struct { fields, .. } => {
            for (_, field) in fields {
                skip_encoded(field, r)?;
            }
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: &Value) -> Value {
        let mut w = ByteWriter::new();
        v.write(&mut w);
        let buf = w.into_vec();
        let mut r = ByteReader::new(&buf);
        let back = Value::read(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        back
    }

    #[test]
    fn scalar_values_round_trip() {
        for v in [
            Value::from_bool(true),
            Value::from_i32(-42),
            Value::from_u32(0xDEAD),
            Value::from_i64(i64::MIN),
            Value::from_u64(u64::MAX),
            Value::from_f32(2.5),
            Value::from_f64(-0.125),
            Value::from_string("hello"),
            Value::void(),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn projections_validate_signature() {
        let v = Value::from_u32(3);
        assert_eq!(v.to_u32().unwrap(), 3);
        assert!(matches!(v.to_i32(), Err(ProtocolError::DecodeMismatch { .. })));
        assert!(matches!(v.to_str(), Err(ProtocolError::DecodeMismatch { .. })));

        let s = Value::from_string("done");
        assert_eq!(s.to_str().unwrap(), "done");
        assert!(s.to_bool().is_err());
    }

    #[test]
    fn nested_value_round_trips() {
        // A value containing a value.
        let inner = Value::from_string("inner");
        let mut w = ByteWriter::new();
        inner.write(&mut w);
        let outer = Value::opaque("m", w.into_bytes());
        assert_eq!(round_trip(&outer), outer);
    }

    #[test]
    fn list_value_round_trips() {
        let mut w = ByteWriter::new();
        w.write_u32(2);
        w.write_string("a");
        w.write_string("bc");
        let v = Value::opaque("[s]", w.into_bytes());
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn truncated_value_payload_rejected() {
        let mut w = ByteWriter::new();
        w.write_string("I");
        w.write_u16(7); // only two of the four bytes an `I` needs
        let buf = w.into_vec();
        let mut r = ByteReader::new(&buf);
        assert!(matches!(Value::read(&mut r), Err(ProtocolError::ShortRead { .. })));
    }

    #[test]
    fn bad_signature_in_value_rejected() {
        let mut w = ByteWriter::new();
        w.write_string("[q]");
        let buf = w.into_vec();
        let mut r = ByteReader::new(&buf);
        assert!(matches!(Value::read(&mut r), Err(ProtocolError::BadSignature { .. })));
    }
}
