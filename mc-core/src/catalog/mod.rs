//! Profile catalog: definitions, compilation and the resolved registry

mod compiler;
mod policy;
mod profile;
mod registry;
mod transform;

pub use compiler::{compile, validate_profile, CollisionReason, CollisionRecord, CompileOptions};
pub use policy::SpecificityPolicy;
pub use profile::{
    BindingRule, BindingSource, Catalog, DatapointDecl, PowerSpec, Profile, ScaledSource, ZoneSpec,
};
pub use registry::{IdentityKey, ProfileRegistry};
pub use transform::{SourceValue, Transform};
