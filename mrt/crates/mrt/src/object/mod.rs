//! Object Module - Managed object model
//!
//! Header layout, class/field/method metadata, GC type information and the
//! class registry.

pub mod gctib;
pub mod header;
pub mod metadata;
pub mod registry;

pub use gctib::{GcTib, GcTibLayout, ARRAY_OF_OBJECT, ARRAY_OF_PRIMITIVE, EMPTY_OBJECT};
pub use header::{class_of, get_header, ref_slot, ObjectHeader};
pub use header::{ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, HEADER_SIZE, OBJECT_ALIGNMENT};
pub use metadata::{
    ClassBuilder, ClassFlags, ClassInitState, ClassKind, ClassMetadata, ClassMetadataRO,
    DispatchTable, FamilyClass, FieldFlags, FieldKind, FieldMetadataRO, MethodMetadataRO,
    ReferenceKind, SelfRelativeRef, SizeInfo,
};
pub use registry::{ClassRegistry, OBJECT_CLASS};

/// Object address; 0 is null
pub type ObjRef = usize;

/// The null reference
pub const NULL: ObjRef = 0;

/// Offset of the referent field in reference objects
pub const REFERENT_OFFSET: usize = HEADER_SIZE;
