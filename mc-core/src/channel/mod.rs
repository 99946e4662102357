//! Non-standard channel discovery and observation
//!
//! The classifier tags every manufacturer-specific cluster a device exposes,
//! wires listeners for the event names its firmware may use, and turns
//! incoming events into observations. It never creates or binds a capability
//! on its own; binding is the profile's job.

mod classifier;
mod listeners;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use classifier::{Channel, ChannelCategory, ChannelClassifier, ChannelMode, Observation};
pub use listeners::{Handler, ListenerEntry, ListenerRegistry};

/// Address of a channel: one cluster on one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub endpoint: u8,
    pub cluster: u16,
}

impl ChannelKey {
    pub fn new(endpoint: u8, cluster: u16) -> Self {
        Self { endpoint, cluster }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}/0x{:04x}", self.endpoint, self.cluster)
    }
}
