//! Compiled, read-only profile registry

use std::collections::HashMap;
use std::sync::Arc;

use super::compiler::CollisionRecord;
use super::profile::Profile;

/// Normalized (vendor, model) identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    vendor: String,
    model: String,
}

impl IdentityKey {
    /// Identities match case-sensitively after trimming whitespace
    pub fn new(vendor: &str, model: &str) -> Self {
        Self {
            vendor: vendor.trim().to_string(),
            model: model.trim().to_string(),
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Immutable lookup table from identity to winning profile.
///
/// Built once by the compiler and shared read-only (behind `Arc`) by every
/// device session.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<Profile>>,
    by_identity: HashMap<IdentityKey, Arc<Profile>>,
    collisions: Vec<CollisionRecord>,
}

impl ProfileRegistry {
    pub(crate) fn new(
        profiles: Vec<Arc<Profile>>,
        by_identity: HashMap<IdentityKey, Arc<Profile>>,
        collisions: Vec<CollisionRecord>,
    ) -> Self {
        Self {
            profiles,
            by_identity,
            collisions,
        }
    }

    /// Registry with no profiles; every device resolves to nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn resolve(&self, vendor_id: &str, model_id: &str) -> Option<Arc<Profile>> {
        self.by_identity
            .get(&IdentityKey::new(vendor_id, model_id))
            .cloned()
    }

    pub fn collisions(&self) -> &[CollisionRecord] {
        &self.collisions
    }

    /// Profiles in declaration order
    pub fn profiles(&self) -> &[Arc<Profile>] {
        &self.profiles
    }

    pub fn profile(&self, id: &str) -> Option<&Arc<Profile>> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.by_identity.len()
    }
}
