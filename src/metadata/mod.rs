/// Federation metadata document model
///
/// The engine only looks at the fields needed to identify, index and
/// validate a descriptor; everything else rides along untouched.

pub mod descriptor;
pub mod document;

pub use descriptor::{
    DocumentSignature, Endpoint, EntityDescriptor, Extensions, RoleDescriptor, RoleType,
};
pub use document::{EntitiesDescriptor, MetadataDocument};
