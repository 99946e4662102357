//! Alarm zone categories and alarm sub-state

use serde::{Deserialize, Serialize};

/// Category of an alarm zone, derived from the zone type the device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneCategory {
    Motion,
    Contact,
    Fire,
    Water,
    Gas,
    Emergency,
    Vibration,
    Generic,
}

impl ZoneCategory {
    pub const ALL: [ZoneCategory; 8] = [
        ZoneCategory::Motion,
        ZoneCategory::Contact,
        ZoneCategory::Fire,
        ZoneCategory::Water,
        ZoneCategory::Gas,
        ZoneCategory::Emergency,
        ZoneCategory::Vibration,
        ZoneCategory::Generic,
    ];

    pub fn from_zone_type(zone_type: u16) -> Self {
        match zone_type {
            0x000D => ZoneCategory::Motion,
            0x0015 => ZoneCategory::Contact,
            0x0028 => ZoneCategory::Fire,
            0x002A => ZoneCategory::Water,
            0x002B => ZoneCategory::Gas,
            0x002C => ZoneCategory::Emergency,
            0x002D => ZoneCategory::Vibration,
            _ => ZoneCategory::Generic,
        }
    }

    /// Zone type written during direct configuration
    pub fn zone_type(&self) -> u16 {
        match self {
            ZoneCategory::Motion => 0x000D,
            ZoneCategory::Contact => 0x0015,
            ZoneCategory::Fire => 0x0028,
            ZoneCategory::Water => 0x002A,
            ZoneCategory::Gas => 0x002B,
            ZoneCategory::Emergency => 0x002C,
            ZoneCategory::Vibration => 0x002D,
            ZoneCategory::Generic => 0xFFFF,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneCategory::Motion => "motion",
            ZoneCategory::Contact => "contact",
            ZoneCategory::Fire => "fire",
            ZoneCategory::Water => "water",
            ZoneCategory::Gas => "gas",
            ZoneCategory::Emergency => "emergency",
            ZoneCategory::Vibration => "vibration",
            ZoneCategory::Generic => "generic",
        }
    }
}

/// Alarm sub-state of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Clear,
    Active,
}

impl AlarmState {
    /// Alarm1 (bit 0) or alarm2 (bit 1) set means active
    pub fn from_zone_status(status: u16) -> Self {
        if status & 0b11 != 0 {
            AlarmState::Active
        } else {
            AlarmState::Clear
        }
    }

    pub fn is_active(&self) -> bool {
        *self == AlarmState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_type_mapping() {
        assert_eq!(ZoneCategory::from_zone_type(0x000D), ZoneCategory::Motion);
        assert_eq!(ZoneCategory::from_zone_type(0x0015), ZoneCategory::Contact);
        assert_eq!(ZoneCategory::from_zone_type(0x1234), ZoneCategory::Generic);
        for category in ZoneCategory::ALL.iter().filter(|c| **c != ZoneCategory::Generic) {
            assert_eq!(ZoneCategory::from_zone_type(category.zone_type()), *category);
        }
    }

    #[test]
    fn test_alarm_bits() {
        assert_eq!(AlarmState::from_zone_status(0x0001), AlarmState::Active);
        assert_eq!(AlarmState::from_zone_status(0x0002), AlarmState::Active);
        assert_eq!(AlarmState::from_zone_status(0x0004), AlarmState::Clear);
        assert_eq!(AlarmState::from_zone_status(0), AlarmState::Clear);
    }
}
