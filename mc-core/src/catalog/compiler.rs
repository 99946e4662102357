//! Catalog compilation
//!
//! Validates every profile, settles identity collisions with the
//! specificity policy and produces the immutable registry. Any validation
//! failure aborts the whole compile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use mc_error::{MeshcapError, Result};
use serde::Serialize;
use tracing::{debug, info};

use super::policy::SpecificityPolicy;
use super::profile::{BindingSource, Catalog, Profile};
use super::registry::{IdentityKey, ProfileRegistry};
use crate::codec::DataType;
use crate::constants::power::{CAPABILITY_LOW, CAPABILITY_PERCENT};
use crate::enrollment::ZoneCategory;

/// Compile options
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub policy: SpecificityPolicy,
    /// Treat equal-rank collisions as fatal instead of picking the earlier profile
    pub strict_ties: bool,
}

/// How a collision was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CollisionReason {
    /// Winner's category outranks every other candidate
    Specificity { winner_rank: u32, runner_up_rank: u32 },
    /// Equal top rank; the earliest declared profile wins
    DeclarationOrder { rank: u32 },
}

/// One identity claimed by several profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollisionRecord {
    pub vendor_id: String,
    pub model_id: String,
    /// Candidate profile ids in declaration order
    pub candidates: Vec<String>,
    pub winner: String,
    pub reason: CollisionReason,
}

/// Authoritative writer of a capability within one profile
#[derive(Debug, Clone, PartialEq)]
enum CapabilityOwner {
    Binding(BindingSource),
    PowerCascade,
    AlarmZone { endpoint: u8, category: ZoneCategory },
}

impl fmt::Display for CapabilityOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityOwner::Binding(source) => write!(f, "binding on {}", source),
            CapabilityOwner::PowerCascade => f.write_str("power cascade"),
            CapabilityOwner::AlarmZone { endpoint, category } => {
                write!(f, "{} zone on endpoint {}", category.as_str(), endpoint)
            }
        }
    }
}

/// Compile a catalog into a registry
pub fn compile(catalog: &Catalog, options: &CompileOptions) -> Result<ProfileRegistry> {
    let mut seen_ids = HashSet::new();
    for profile in &catalog.profiles {
        if !seen_ids.insert(profile.id.as_str()) {
            return Err(MeshcapError::DuplicateProfile(profile.id.clone()));
        }
        validate_profile(profile)?;
    }

    // Candidates per identity, kept in declaration order
    let mut claims: BTreeMap<IdentityKey, Vec<usize>> = BTreeMap::new();
    for (index, profile) in catalog.profiles.iter().enumerate() {
        for (vendor, model) in profile.identities() {
            let candidates = claims.entry(IdentityKey::new(&vendor, &model)).or_default();
            if !candidates.contains(&index) {
                candidates.push(index);
            }
        }
    }

    let profiles: Vec<Arc<Profile>> = catalog.profiles.iter().cloned().map(Arc::new).collect();
    let mut by_identity = HashMap::with_capacity(claims.len());
    let mut collisions = Vec::new();

    for (key, candidates) in claims {
        let winner = if candidates.len() == 1 {
            candidates[0]
        } else {
            let (winner, record) = settle(&key, &candidates, &catalog.profiles, options)?;
            debug!(
                vendor = %record.vendor_id,
                model = %record.model_id,
                winner = %record.winner,
                candidates = ?record.candidates,
                "Resolved identity collision"
            );
            collisions.push(record);
            winner
        };
        by_identity.insert(key, Arc::clone(&profiles[winner]));
    }

    info!(
        profiles = profiles.len(),
        identities = by_identity.len(),
        collisions = collisions.len(),
        "Compiled profile catalog"
    );

    Ok(ProfileRegistry::new(profiles, by_identity, collisions))
}

fn settle(
    key: &IdentityKey,
    candidates: &[usize],
    profiles: &[Profile],
    options: &CompileOptions,
) -> Result<(usize, CollisionRecord)> {
    let ranked: Vec<(usize, u32)> = candidates
        .iter()
        .map(|&i| (i, options.policy.rank(&profiles[i].category)))
        .collect();

    let top = ranked.iter().map(|(_, r)| *r).max().unwrap_or(0);
    let leaders: Vec<usize> = ranked.iter().filter(|(_, r)| *r == top).map(|(i, _)| *i).collect();
    let candidate_ids: Vec<String> = candidates.iter().map(|&i| profiles[i].id.clone()).collect();

    if leaders.len() > 1 && options.strict_ties {
        return Err(MeshcapError::AmbiguousCollision {
            vendor_id: key.vendor().to_string(),
            model_id: key.model().to_string(),
            candidates: leaders.iter().map(|&i| profiles[i].id.clone()).collect(),
        });
    }

    // Candidates are in declaration order, so the first leader is the earliest
    let winner = leaders[0];
    let reason = if leaders.len() > 1 {
        CollisionReason::DeclarationOrder { rank: top }
    } else {
        let runner_up_rank = ranked
            .iter()
            .filter(|(i, _)| *i != winner)
            .map(|(_, r)| *r)
            .max()
            .unwrap_or(0);
        CollisionReason::Specificity {
            winner_rank: top,
            runner_up_rank,
        }
    };

    Ok((
        winner,
        CollisionRecord {
            vendor_id: key.vendor().to_string(),
            model_id: key.model().to_string(),
            candidates: candidate_ids,
            winner: profiles[winner].id.clone(),
            reason,
        },
    ))
}

/// Per-profile checks that must hold before a profile can be registered
pub fn validate_profile(profile: &Profile) -> Result<()> {
    let invalid = |reason: String| MeshcapError::catalog(format!("profile {}: {}", profile.id, reason));

    if profile.id.trim().is_empty() {
        return Err(MeshcapError::catalog("profile with empty id"));
    }
    if profile.vendor_ids.iter().all(|v| v.trim().is_empty()) {
        return Err(invalid("no vendor ids".to_string()));
    }
    if profile.model_ids.iter().all(|m| m.trim().is_empty()) {
        return Err(invalid("no model ids".to_string()));
    }

    let mut declared: HashMap<u8, DataType> = HashMap::new();
    for decl in &profile.datapoints {
        if let Some(previous) = declared.insert(decl.dp_id, decl.data_type) {
            if previous != decl.data_type {
                return Err(invalid(format!(
                    "datapoint {} declared as both {} and {}",
                    decl.dp_id, previous, decl.data_type
                )));
            }
        }
        if let Some(width) = decl.bitmap_width {
            if decl.data_type != DataType::Bitmap || !matches!(width, 1 | 2 | 4) {
                return Err(invalid(format!("datapoint {} has invalid bitmap width {}", decl.dp_id, width)));
            }
        }
    }

    for binding in &profile.bindings {
        binding
            .transform
            .validate()
            .map_err(|reason| invalid(format!("binding for {}: {}", binding.capability, reason)))?;

        if let BindingSource::Datapoint { dp_id } = binding.source {
            if let Some(data_type) = declared.get(&dp_id) {
                if !binding.transform.accepts(*data_type) {
                    return Err(invalid(format!(
                        "{} transform cannot read datapoint {} of type {}",
                        binding.transform.name(),
                        dp_id,
                        data_type
                    )));
                }
            }
        }
    }

    if let Some(power) = &profile.power {
        for scaled in [power.percent, power.voltage, power.current].iter().flatten() {
            if scaled.divisor == 0.0 || !scaled.divisor.is_finite() {
                return Err(invalid(format!("power source {} has divisor {}", scaled.source, scaled.divisor)));
            }
        }
    }

    validate_binding_table(profile)
}

/// Every capability must have exactly one authoritative writer
fn validate_binding_table(profile: &Profile) -> Result<()> {
    let mut owners: Vec<(String, CapabilityOwner)> = Vec::new();

    for binding in &profile.bindings {
        owners.push((binding.capability.clone(), CapabilityOwner::Binding(binding.source)));
    }
    if profile.power.is_some() {
        owners.push((CAPABILITY_PERCENT.to_string(), CapabilityOwner::PowerCascade));
        owners.push((CAPABILITY_LOW.to_string(), CapabilityOwner::PowerCascade));
    }
    for zone in &profile.zones {
        owners.push((
            zone.capability.clone(),
            CapabilityOwner::AlarmZone {
                endpoint: zone.endpoint,
                category: zone.category,
            },
        ));
    }

    let mut first_owner: HashMap<&str, &CapabilityOwner> = HashMap::new();
    for (capability, owner) in &owners {
        if let Some(first) = first_owner.get(capability.as_str()) {
            return Err(MeshcapError::BindingConflict {
                profile: profile.id.clone(),
                capability: capability.clone(),
                first: first.to_string(),
                second: owner.to_string(),
            });
        }
        first_owner.insert(capability.as_str(), owner);
    }

    Ok(())
}
