//! Channel classification, listener wiring and deferred probing

use std::collections::{BTreeMap, BTreeSet};

use mc_protocol::{EndpointDescriptor, EventPayload, OutboundCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::listeners::{Handler, ListenerRegistry};
use super::ChannelKey;
use crate::constants::{channels, events};
use crate::settings::DiscoverySettings;
use crate::timers::{Millis, TimerSet};

// ============================================================================
// Categories and modes
// ============================================================================

/// Category of a non-standard channel, fixed when the channel is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelCategory {
    VendorDp,
    AltVendor,
    GenericMfr,
}

impl ChannelCategory {
    /// Classify a cluster id. Ranges are checked in declaration order so the
    /// reserved vendor id never falls through to the generic range.
    pub fn classify(cluster: u16) -> Option<Self> {
        let table: [(&[std::ops::RangeInclusive<u16>], ChannelCategory); 3] = [
            (channels::VENDOR_DP, ChannelCategory::VendorDp),
            (channels::ALT_VENDOR, ChannelCategory::AltVendor),
            (channels::GENERIC_MFR, ChannelCategory::GenericMfr),
        ];
        table
            .iter()
            .find(|(ranges, _)| ranges.iter().any(|r| r.contains(&cluster)))
            .map(|(_, cat)| *cat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelCategory::VendorDp => "vendor-dp",
            ChannelCategory::AltVendor => "alt-vendor",
            ChannelCategory::GenericMfr => "generic-mfr",
        }
    }

    /// Event names to listen for on a channel of this category
    fn event_names(&self, endpoint: u8) -> Vec<&'static str> {
        match self {
            ChannelCategory::VendorDp => {
                let mut names = vec![events::VENDOR_DP_PRIMARY];
                if endpoint != channels::PRIMARY_ENDPOINT {
                    names.extend_from_slice(events::VENDOR_DP_ALTERNATES);
                }
                names
            }
            ChannelCategory::AltVendor | ChannelCategory::GenericMfr => vec![events::ATTRIBUTE_PRIMARY],
        }
    }

    fn handler(&self) -> Handler {
        match self {
            ChannelCategory::VendorDp => Handler::VendorDatapoint,
            _ => Handler::AttributeObserved,
        }
    }
}

/// Liveness of a channel. Independent of its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Discovered, probe not yet sent
    AwaitingProbe,
    /// Probe sent, waiting for an answer
    Probing,
    /// Answered a probe or reported on its own
    Active,
    /// Did not answer; still listened to
    Passive,
}

/// One classified channel
#[derive(Debug, Clone)]
pub struct Channel {
    key: ChannelKey,
    category: ChannelCategory,
    local_name: Option<String>,
    mode: ChannelMode,
    discovered_at: Millis,
}

impl Channel {
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn category(&self) -> ChannelCategory {
        self.category
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn discovered_at(&self) -> Millis {
        self.discovered_at
    }
}

/// Signal produced for an event received on a classified channel
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    AttributeObserved {
        channel: ChannelKey,
        category: ChannelCategory,
        event: String,
        payload: EventPayload,
        timestamp: Millis,
    },
    VendorDatapoint {
        channel: ChannelKey,
        bytes: Vec<u8>,
        timestamp: Millis,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ProbeTimer {
    Probe(ChannelKey),
    Window(ChannelKey),
}

// ============================================================================
// Classifier
// ============================================================================

/// Per-device channel table
#[derive(Debug)]
pub struct ChannelClassifier {
    channels: BTreeMap<ChannelKey, Channel>,
    scanned: BTreeSet<u8>,
    listeners: ListenerRegistry,
    timers: TimerSet<ProbeTimer>,
    probe_delay_ms: u64,
    probe_window_ms: u64,
}

impl ChannelClassifier {
    pub fn new(settings: &DiscoverySettings) -> Self {
        Self {
            channels: BTreeMap::new(),
            scanned: BTreeSet::new(),
            listeners: ListenerRegistry::new(),
            timers: TimerSet::new(),
            probe_delay_ms: settings.probe_delay_ms,
            probe_window_ms: settings.probe_window_ms,
        }
    }

    /// Scan the endpoint enumeration and classify every non-standard cluster.
    ///
    /// Returns the keys of channels created by this call. Channels already
    /// known are left untouched, so repeated scans are idempotent.
    pub fn discover(&mut self, endpoints: &[EndpointDescriptor], now: Millis) -> Vec<ChannelKey> {
        let mut created = Vec::new();

        for endpoint in endpoints {
            self.scanned.insert(endpoint.id);

            for cluster in &endpoint.clusters {
                let Some(category) = ChannelCategory::classify(cluster.id) else {
                    continue;
                };
                let key = ChannelKey::new(endpoint.id, cluster.id);
                if self.channels.contains_key(&key) {
                    continue;
                }

                let handler = category.handler();
                for (priority, name) in category.event_names(endpoint.id).into_iter().enumerate() {
                    self.listeners.register(key, name, handler, priority as u8);
                }

                self.channels.insert(
                    key,
                    Channel {
                        key,
                        category,
                        local_name: cluster.name.clone(),
                        mode: ChannelMode::AwaitingProbe,
                        discovered_at: now,
                    },
                );
                self.timers
                    .schedule(ProbeTimer::Probe(key), now.saturating_add(self.probe_delay_ms));

                debug!(channel = %key, category = category.as_str(), "Classified channel");
                created.push(key);
            }
        }

        created
    }

    /// Route an event received on `key` under the local name `event`.
    ///
    /// Events with no registered listener are dropped. A vendor datapoint
    /// event carrying a frame yields both an attribute observation and a
    /// datapoint observation.
    pub fn observe(&mut self, key: ChannelKey, event: &str, payload: &EventPayload, now: Millis) -> Vec<Observation> {
        let Some(entry) = self.listeners.lookup(key, event) else {
            trace!(channel = %key, event, "No listener for event");
            return Vec::new();
        };
        let handler = entry.handler;

        let Some(channel) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        if channel.mode != ChannelMode::Active {
            if channel.mode == ChannelMode::Passive {
                debug!(channel = %key, "Passive channel reported, now active");
            }
            channel.mode = ChannelMode::Active;
            self.timers.cancel(&ProbeTimer::Probe(key));
            self.timers.cancel(&ProbeTimer::Window(key));
        }

        let mut out = vec![Observation::AttributeObserved {
            channel: key,
            category: channel.category,
            event: event.to_string(),
            payload: payload.clone(),
            timestamp: now,
        }];

        if handler == Handler::VendorDatapoint {
            if let EventPayload::Frame { bytes } = payload {
                out.push(Observation::VendorDatapoint {
                    channel: key,
                    bytes: bytes.clone(),
                    timestamp: now,
                });
            }
        }

        out
    }

    /// Record the outcome of a probe read
    pub fn probe_result(&mut self, key: ChannelKey, ok: bool) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        self.timers.cancel(&ProbeTimer::Probe(key));
        self.timers.cancel(&ProbeTimer::Window(key));

        if channel.mode == ChannelMode::Active {
            return;
        }
        channel.mode = if ok { ChannelMode::Active } else { ChannelMode::Passive };
        debug!(channel = %key, mode = ?channel.mode, "Probe answered");
    }

    /// Fire due probe timers. Returns the probe reads to send.
    pub fn on_tick(&mut self, now: Millis) -> Vec<OutboundCommand> {
        let mut commands = Vec::new();

        for timer in self.timers.take_expired(now) {
            match timer {
                ProbeTimer::Probe(key) => {
                    if let Some(channel) = self.channels.get_mut(&key) {
                        channel.mode = ChannelMode::Probing;
                        self.timers
                            .schedule(ProbeTimer::Window(key), now.saturating_add(self.probe_window_ms));
                        commands.push(OutboundCommand::ReadAttributes {
                            endpoint: key.endpoint,
                            cluster: key.cluster,
                            attributes: channels::PROBE_ATTRIBUTES.to_vec(),
                        });
                    }
                }
                ProbeTimer::Window(key) => {
                    if let Some(channel) = self.channels.get_mut(&key) {
                        if channel.mode == ChannelMode::Probing {
                            channel.mode = ChannelMode::Passive;
                            debug!(channel = %key, "Probe window elapsed, listening passively");
                        }
                    }
                }
            }
        }

        commands
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn channel(&self, key: ChannelKey) -> Option<&Channel> {
        self.channels.get(&key)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// First vendor datapoint channel, preferring the primary endpoint
    pub fn vendor_channel(&self) -> Option<ChannelKey> {
        self.channels
            .values()
            .filter(|c| c.category == ChannelCategory::VendorDp)
            .min_by_key(|c| (c.key.endpoint != channels::PRIMARY_ENDPOINT, c.key))
            .map(|c| c.key)
    }

    pub fn is_scanned(&self, endpoint: u8) -> bool {
        self.scanned.contains(&endpoint)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Remove every listener and cancel every probe timer.
    /// Returns (listeners removed, timers cancelled).
    pub fn teardown(&mut self) -> (usize, usize) {
        let listeners = self.listeners.clear();
        let timers = self.timers.cancel_all();
        (listeners, timers)
    }
}
