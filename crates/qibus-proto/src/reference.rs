//! Object references: live remote object handles on the wire.

use std::sync::OnceLock;

use crate::basic::{ByteReader, ByteWriter};
use crate::errors::Result;
use crate::meta::{self, MetaObject};
use crate::signature::Type;

/// On-the-wire representation of a remote object handle.
///
/// Passing one of these transfers the ability to call the object at
/// `(service_id, object_id)`; the embedded meta-object spares the receiver
/// a `metaObject` round trip. Object ids with the high bit set mark
/// client-allocated objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectReference {
    /// True when the embedded meta-object is meaningful.
    pub is_meta_object: bool,
    /// Description of the referenced object.
    pub meta: MetaObject,
    /// Id of the object that handed out this reference.
    pub parent_id: u32,
    /// Service hosting the object.
    pub service_id: u32,
    /// Object id within the service.
    pub object_id: u32,
}

/// Signature of an encoded object reference.
pub fn signature() -> String {
    format!(
        "(b{}III)<ObjectReference,metaObject,meta,parentID,serviceID,objectID>",
        meta::META_OBJECT_SIGNATURE
    )
}

/// Parsed form of [`signature`], used by the value codec to walk over
/// encoded `o` fields.
pub(crate) fn wire_type() -> &'static Type {
    static TYPE: OnceLock<Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        // The signature is a compile-time constant composition; parsing it
        // cannot fail (covered by tests).
        Type::parse(&signature()).unwrap_or(Type::Unknown)
    })
}

impl ObjectReference {
    /// Encode in field order.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_bool(self.is_meta_object);
        self.meta.write(w);
        w.write_u32(self.parent_id);
        w.write_u32(self.service_id);
        w.write_u32(self.object_id);
    }

    /// Decode in field order.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            is_meta_object: r.read_bool()?,
            meta: MetaObject::read(r)?,
            parent_id: r.read_u32()?,
            service_id: r.read_u32()?,
            object_id: r.read_u32()?,
        })
    }
}
