//! Specificity policy used to settle identity collisions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Rank per profile category. Higher rank wins a collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificityPolicy {
    #[serde(default)]
    pub ranks: BTreeMap<String, u32>,
    #[serde(default = "default_rank")]
    pub default_rank: u32,
}

fn default_rank() -> u32 {
    20
}

impl SpecificityPolicy {
    pub fn rank(&self, category: &str) -> u32 {
        self.ranks.get(category).copied().unwrap_or(self.default_rank)
    }

    pub fn with_rank(mut self, category: impl Into<String>, rank: u32) -> Self {
        self.ranks.insert(category.into(), rank);
        self
    }
}

impl Default for SpecificityPolicy {
    fn default() -> Self {
        let table: &[(&[&str], u32)] = &[
            (&["smoke_detector", "gas_detector", "water_leak_sensor", "sos_button"], 95),
            (&["climate_sensor", "multi_sensor", "soil_sensor"], 90),
            (&["thermostat"], 85),
            (&["motion_sensor", "contact_sensor", "presence_sensor"], 80),
            (&["cover"], 70),
            (&["dimmer", "light"], 60),
            (&["plug"], 50),
            (&["switch", "relay"], 30),
            (&["generic"], 10),
        ];

        let mut ranks = BTreeMap::new();
        for (categories, rank) in table {
            for category in *categories {
                ranks.insert(category.to_string(), *rank);
            }
        }

        Self {
            ranks,
            default_rank: default_rank(),
        }
    }
}
