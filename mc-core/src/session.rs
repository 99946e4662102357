//! Per-device session
//!
//! Composes the classifier, codec, resolved profile, alarm enrollment and
//! power cascade for one paired device. The session is synchronous and
//! clock-free: callers feed it stack events and ticks with the current time
//! and act on the outputs it returns.
//!
//! Two clocks are involved. `now` is the caller's monotonic clock and drives
//! every timer. An event may also carry the time it was observed at its
//! source; datapoint records are stamped with that time so a frame that
//! arrives late never overwrites a newer value.

use std::collections::HashSet;
use std::sync::Arc;

use mc_error::{MeshcapError, Result};
use mc_protocol::{AttributeValue, CapabilityValue, DeviceAddress, EndpointDescriptor, EventPayload, HostMessage, OutboundCommand, StackEvent};
use tracing::{debug, info, trace, warn};

use crate::catalog::{BindingSource, Profile, ProfileRegistry, SourceValue, ZoneSpec};
use crate::channel::{ChannelClassifier, ChannelKey, Observation};
use crate::codec::{decode_records, encode_command, ApplyOutcome, Datapoint, DatapointStore, DatapointValue};
use crate::constants::clusters;
use crate::constants::power::{CAPABILITY_LOW, CAPABILITY_PERCENT};
use crate::enrollment::{EnrollmentMachine, EnrollmentOutput, EnrollmentPhase, ZoneEvent};
use crate::power::{CalibrationKey, Chemistry, PersistedCalibration, PowerEstimate, PowerEstimator, PowerSample};
use crate::settings::CoreSettings;
use crate::timers::Millis;
use crate::vendor::{VendorUpkeep, WallClock};

// ============================================================================
// Types
// ============================================================================

/// Identity of a paired device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: DeviceAddress,
    pub vendor_id: String,
    pub model_id: String,
}

impl DeviceIdentity {
    pub fn new(address: DeviceAddress, vendor_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            address,
            vendor_id: vendor_id.into(),
            model_id: model_id.into(),
        }
    }

    pub fn calibration_key(&self) -> CalibrationKey {
        CalibrationKey::new(&self.vendor_id, &self.model_id, self.address.as_str())
    }
}

/// Output produced by the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    Capability { capability: String, value: CapabilityValue },
    Command(OutboundCommand),
    /// Learned calibration changed; write it out (best effort)
    PersistCalibration { key: CalibrationKey, record: PersistedCalibration },
}

impl SessionOutput {
    /// Host-facing message, if this output is meant for the host
    pub fn into_host_message(self, device: &DeviceAddress) -> Option<HostMessage> {
        match self {
            SessionOutput::Capability { capability, value } => Some(HostMessage::Capability {
                device: device.clone(),
                capability,
                value,
            }),
            SessionOutput::Command(command) => Some(HostMessage::Command {
                device: device.clone(),
                command,
            }),
            SessionOutput::PersistCalibration { .. } => None,
        }
    }
}

/// Resources released by teardown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub listeners_removed: usize,
    pub timers_cancelled: usize,
}

// ============================================================================
// Session
// ============================================================================

pub struct DeviceSession {
    identity: DeviceIdentity,
    profile: Arc<Profile>,
    resolved: bool,
    classifier: ChannelClassifier,
    datapoints: DatapointStore,
    zones: Vec<(ZoneSpec, EnrollmentMachine)>,
    upkeep: VendorUpkeep,
    power: PowerEstimator,
    power_announced: bool,
    standard_power: bool,
    low_battery_percent: f64,
    unmapped_reported: HashSet<u8>,
    next_seq: u16,
    torn_down: bool,
}

impl DeviceSession {
    /// Create a session, resolving the device's profile against `registry`.
    /// Unresolved devices get an observe-only profile.
    pub fn new(
        identity: DeviceIdentity,
        registry: &ProfileRegistry,
        settings: &CoreSettings,
        calibration: Option<PersistedCalibration>,
    ) -> Self {
        let (profile, resolved) = match registry.resolve(&identity.vendor_id, &identity.model_id) {
            Some(profile) => (profile, true),
            None => {
                warn!(
                    device = %identity.address,
                    vendor = %identity.vendor_id,
                    model = %identity.model_id,
                    "No profile for device, observing only"
                );
                (Arc::new(Profile::observe_only("unresolved")), false)
            }
        };

        let zones = profile
            .zones
            .iter()
            .map(|spec| {
                let machine = EnrollmentMachine::new(spec.endpoint, spec.category, &settings.enrollment);
                (spec.clone(), machine)
            })
            .collect();

        let upkeep = VendorUpkeep::new(&settings.vendor, profile.datapoints.iter().map(|d| d.dp_id).collect());

        let chemistry = profile.power.as_ref().map_or(Chemistry::Unknown, |p| p.chemistry);
        let mut power = PowerEstimator::new(chemistry, &settings.power);
        if let Some(record) = &calibration {
            power.restore(record);
        }

        // Standard battery attributes feed the cascade unless the profile
        // describes its own power sources or binds battery capabilities itself
        let standard_power = resolved
            && profile.power.is_none()
            && !profile
                .bindings
                .iter()
                .any(|b| b.capability == CAPABILITY_PERCENT || b.capability == CAPABILITY_LOW);

        info!(
            device = %identity.address,
            profile = %profile.id,
            resolved,
            zones = profile.zones.len(),
            "Device session created"
        );

        Self {
            identity,
            profile,
            resolved,
            classifier: ChannelClassifier::new(&settings.discovery),
            datapoints: DatapointStore::new(),
            zones,
            upkeep,
            power,
            power_announced: false,
            standard_power,
            low_battery_percent: settings.power.low_battery_percent,
            unmapped_reported: HashSet::new(),
            next_seq: 0,
            torn_down: false,
        }
    }

    /// Anchor the session clock to local time so time sync can run.
    /// Takes effect for the next `start`.
    pub fn with_wall_clock(mut self, clock: WallClock) -> Self {
        self.upkeep.set_wall_clock(clock);
        self
    }

    /// Discover channels, start vendor upkeep and start enrollment for every
    /// declared zone
    pub fn start(&mut self, endpoints: &[EndpointDescriptor], now: Millis) -> Vec<SessionOutput> {
        if self.torn_down {
            return Vec::new();
        }
        let mut out = Vec::new();

        let created = self.classifier.discover(endpoints, now);
        if !created.is_empty() {
            debug!(device = %self.identity.address, channels = created.len(), "Discovered channels");
        }

        if let Some(channel) = self.classifier.vendor_channel() {
            let commands = self.upkeep.start(channel, now, &mut self.next_seq);
            out.extend(commands.into_iter().map(SessionOutput::Command));
        }

        for i in 0..self.zones.len() {
            let outputs = self.zones[i].1.start(now);
            self.push_zone_outputs(i, outputs, &mut out);
        }

        if self.profile.power.is_some() && !self.power_announced {
            self.power_announced = true;
            let estimate = self.power.estimate();
            self.push_estimate(estimate, &mut out);
        }

        out
    }

    /// Handle one stack event observed at `now`
    pub fn handle_event(&mut self, event: &StackEvent, now: Millis) -> Vec<SessionOutput> {
        self.handle_event_at(event, now, now)
    }

    /// Handle one stack event. `now` drives timers; `observed_at` is the
    /// source timestamp that orders datapoint records.
    pub fn handle_event_at(&mut self, event: &StackEvent, now: Millis, observed_at: Millis) -> Vec<SessionOutput> {
        if self.torn_down {
            trace!(device = %self.identity.address, event = event.kind(), "Session torn down, ignoring event");
            return Vec::new();
        }

        match event {
            StackEvent::Paired { endpoints, .. } => self.start(endpoints, now),
            StackEvent::Unpaired => {
                self.teardown();
                Vec::new()
            }
            StackEvent::Cluster {
                endpoint,
                cluster,
                name,
                payload,
            } => self.on_cluster(*endpoint, *cluster, name, payload, observed_at),
            StackEvent::ProbeResult { endpoint, cluster, ok } => {
                self.classifier.probe_result(ChannelKey::new(*endpoint, *cluster), *ok);
                Vec::new()
            }
            StackEvent::ZoneInfo { endpoint, ok, zone_type } => self.on_zone(
                *endpoint,
                ZoneEvent::InfoRead {
                    ok: *ok,
                    zone_type: *zone_type,
                },
                now,
            ),
            StackEvent::ZoneEnrollRequest { endpoint, zone_type } => {
                self.on_zone(*endpoint, ZoneEvent::EnrollRequest { zone_type: *zone_type }, now)
            }
            StackEvent::ZoneState { endpoint, enrolled } => {
                self.on_zone(*endpoint, ZoneEvent::StateReport { enrolled: *enrolled }, now)
            }
            StackEvent::ZoneConfigWritten { endpoint, ok } => {
                self.on_zone(*endpoint, ZoneEvent::ConfigWritten { ok: *ok }, now)
            }
            StackEvent::ZoneStatus { endpoint, status } => {
                self.on_zone(*endpoint, ZoneEvent::Status { status: *status }, now)
            }
        }
    }

    /// Fire every timer due at `now`
    pub fn on_tick(&mut self, now: Millis) -> Vec<SessionOutput> {
        if self.torn_down {
            return Vec::new();
        }

        let mut out: Vec<SessionOutput> = self
            .classifier
            .on_tick(now)
            .into_iter()
            .chain(self.upkeep.on_tick(now, &mut self.next_seq))
            .map(SessionOutput::Command)
            .collect();

        for i in 0..self.zones.len() {
            let outputs = self.zones[i].1.on_tick(now);
            self.push_zone_outputs(i, outputs, &mut out);
        }

        out
    }

    /// Earliest pending timer across all components
    pub fn next_deadline(&self) -> Option<Millis> {
        if self.torn_down {
            return None;
        }
        self.zones
            .iter()
            .filter_map(|(_, m)| m.next_deadline())
            .chain(self.classifier.next_deadline())
            .chain(self.upkeep.next_deadline())
            .min()
    }

    /// Encode a command for one declared datapoint
    pub fn send_datapoint(&mut self, dp: &Datapoint) -> Result<SessionOutput> {
        if self.torn_down {
            return Err(MeshcapError::DeviceNotFound(self.identity.address.to_string()));
        }
        let channel = self.classifier.vendor_channel().ok_or_else(|| {
            MeshcapError::NotSupported(format!("{} has no vendor datapoint channel", self.identity.address))
        })?;

        let bytes = encode_command(&self.profile, self.next_seq, dp)?;
        self.next_seq = self.next_seq.wrapping_add(1);

        Ok(SessionOutput::Command(OutboundCommand::SendVendorFrame {
            endpoint: channel.endpoint,
            cluster: channel.cluster,
            bytes,
        }))
    }

    /// Restart enrollment on every zone that ended in `Failed`
    pub fn restart_enrollment(&mut self, now: Millis) -> Vec<SessionOutput> {
        let mut out = Vec::new();
        for i in 0..self.zones.len() {
            let outputs = self.zones[i].1.restart(now);
            self.push_zone_outputs(i, outputs, &mut out);
        }
        out
    }

    /// A calibration write failed; degrade the next power evaluation
    pub fn persistence_failed(&mut self) {
        self.power.persistence_failed();
    }

    /// Unregister every listener and cancel every timer. Idempotent.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }

        let (listeners_removed, mut timers_cancelled) = self.classifier.teardown();
        timers_cancelled += self.upkeep.teardown();
        for (_, machine) in &mut self.zones {
            timers_cancelled += machine.teardown();
        }
        self.torn_down = true;

        info!(
            device = %self.identity.address,
            listeners = listeners_removed,
            timers = timers_cancelled,
            "Device session torn down"
        );
        TeardownReport {
            listeners_removed,
            timers_cancelled,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn classifier(&self) -> &ChannelClassifier {
        &self.classifier
    }

    pub fn datapoints(&self) -> &DatapointStore {
        &self.datapoints
    }

    pub fn upkeep(&self) -> &VendorUpkeep {
        &self.upkeep
    }

    pub fn power(&self) -> &PowerEstimator {
        &self.power
    }

    pub fn zone(&self, endpoint: u8) -> Option<&EnrollmentMachine> {
        self.zones.iter().map(|(_, m)| m).find(|m| m.endpoint() == endpoint)
    }

    pub fn zone_phase(&self, endpoint: u8) -> Option<EnrollmentPhase> {
        self.zone(endpoint).map(|m| m.phase())
    }

    pub fn listener_count(&self) -> usize {
        self.classifier.listeners().len()
    }

    pub fn pending_timers(&self) -> usize {
        self.classifier.pending_timers()
            + self.upkeep.pending_timers()
            + self.zones.iter().map(|(_, m)| m.pending_timers()).sum::<usize>()
    }

    // ------------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------------

    fn on_cluster(
        &mut self,
        endpoint: u8,
        cluster: u16,
        name: &str,
        payload: &EventPayload,
        observed_at: Millis,
    ) -> Vec<SessionOutput> {
        let mut out = Vec::new();
        let key = ChannelKey::new(endpoint, cluster);

        if self.classifier.channel(key).is_none() {
            match payload {
                EventPayload::Attribute { attribute, value } => self.on_attribute(cluster, *attribute, value, &mut out),
                EventPayload::Frame { .. } => {
                    trace!(device = %self.identity.address, channel = %key, "Frame on unclassified cluster");
                }
            }
            return out;
        }

        for observation in self.classifier.observe(key, name, payload, observed_at) {
            match observation {
                Observation::VendorDatapoint { bytes, timestamp, .. } => {
                    self.on_vendor_frame(&bytes, timestamp, &mut out);
                }
                Observation::AttributeObserved {
                    payload: EventPayload::Attribute { attribute, value },
                    ..
                } => self.on_attribute(cluster, attribute, &value, &mut out),
                Observation::AttributeObserved { .. } => {}
            }
        }

        out
    }

    fn on_vendor_frame(&mut self, bytes: &[u8], observed_at: Millis, out: &mut Vec<SessionOutput>) {
        let records = match decode_records(bytes, observed_at) {
            Ok((_, records)) => records,
            Err(e) => {
                warn!(
                    device = %self.identity.address,
                    error = %e,
                    payload = %hex::encode(bytes),
                    "Dropping malformed vendor frame"
                );
                return;
            }
        };

        for record in records {
            let dp_id = record.dp_id;
            let value = record.value.clone();

            if let ApplyOutcome::Stale { stored_timestamp } = self.datapoints.apply(record) {
                debug!(
                    device = %self.identity.address,
                    dp_id,
                    observed_at,
                    stored_timestamp,
                    "Discarding stale datapoint"
                );
                continue;
            }

            let source = BindingSource::Datapoint { dp_id };
            let mut mapped = self.apply_bindings(source, &SourceValue::from(&value), out);
            if let Some(sample) = self.power_sample(source, value.as_f64()) {
                mapped = true;
                self.feed_power(sample, out);
            }

            if !mapped {
                self.report_unmapped(dp_id, &value);
            }
        }
    }

    fn on_attribute(&mut self, cluster: u16, attribute: u16, value: &AttributeValue, out: &mut Vec<SessionOutput>) {
        let source = BindingSource::Attribute { cluster, attribute };
        let mut mapped = self.apply_bindings(source, &SourceValue::from(value), out);
        if let Some(sample) = self.power_sample(source, value.as_f64()) {
            mapped = true;
            self.feed_power(sample, out);
        }
        if !mapped {
            trace!(device = %self.identity.address, source = %source, "Unmapped attribute");
        }
    }

    fn on_zone(&mut self, endpoint: u8, event: ZoneEvent, now: Millis) -> Vec<SessionOutput> {
        let mut out = Vec::new();
        let mut routed = false;

        for i in 0..self.zones.len() {
            if self.zones[i].1.endpoint() != endpoint {
                continue;
            }
            routed = true;
            let outputs = self.zones[i].1.handle(event, now);
            self.push_zone_outputs(i, outputs, &mut out);
        }

        if !routed {
            debug!(device = %self.identity.address, endpoint, event = ?event, "Zone event for undeclared zone");
        }
        out
    }

    // ------------------------------------------------------------------------
    // Output helpers
    // ------------------------------------------------------------------------

    fn apply_bindings(&self, source: BindingSource, value: &SourceValue, out: &mut Vec<SessionOutput>) -> bool {
        let mut bound = false;
        for rule in self.profile.bindings_for(source) {
            bound = true;
            match rule.transform.apply(value) {
                Some(v) => out.push(SessionOutput::Capability {
                    capability: rule.capability.clone(),
                    value: v,
                }),
                None => debug!(
                    device = %self.identity.address,
                    source = %source,
                    transform = rule.transform.name(),
                    "Transform produced no value"
                ),
            }
        }
        bound
    }

    fn power_sample(&self, source: BindingSource, reading: Option<f64>) -> Option<PowerSample> {
        let reading = reading?;

        if let Some(spec) = &self.profile.power {
            let mut sample = PowerSample::default();
            let mut matched = false;
            if let Some(s) = spec.percent.filter(|s| s.source == source) {
                sample.raw = Some(s.scale(reading));
                matched = true;
            }
            if let Some(s) = spec.voltage.filter(|s| s.source == source) {
                sample.voltage = Some(s.scale(reading));
                matched = true;
            }
            if let Some(s) = spec.current.filter(|s| s.source == source) {
                sample.current_ma = Some(s.scale(reading));
                matched = true;
            }
            return matched.then_some(sample);
        }

        if !self.standard_power {
            return None;
        }
        match source {
            BindingSource::Attribute {
                cluster: clusters::POWER_CONFIG,
                attribute: clusters::ATTR_BATTERY_VOLTAGE,
            } => Some(PowerSample::voltage(reading / 10.0)),
            BindingSource::Attribute {
                cluster: clusters::POWER_CONFIG,
                attribute: clusters::ATTR_BATTERY_PERCENT,
            } => Some(PowerSample::raw(reading)),
            _ => None,
        }
    }

    fn feed_power(&mut self, sample: PowerSample, out: &mut Vec<SessionOutput>) {
        self.power_announced = true;
        let estimate = self.power.update(sample);
        self.push_estimate(estimate, out);

        if let Some(record) = self.power.take_dirty() {
            out.push(SessionOutput::PersistCalibration {
                key: self.identity.calibration_key(),
                record,
            });
        }
    }

    fn push_estimate(&self, estimate: PowerEstimate, out: &mut Vec<SessionOutput>) {
        out.push(SessionOutput::Capability {
            capability: CAPABILITY_PERCENT.to_string(),
            value: CapabilityValue::Number(estimate.percent),
        });
        out.push(SessionOutput::Capability {
            capability: CAPABILITY_LOW.to_string(),
            value: CapabilityValue::Bool(estimate.is_low(self.low_battery_percent)),
        });
    }

    fn push_zone_outputs(&self, index: usize, outputs: Vec<EnrollmentOutput>, out: &mut Vec<SessionOutput>) {
        let capability = &self.zones[index].0.capability;
        for output in outputs {
            match output {
                EnrollmentOutput::Command(command) => out.push(SessionOutput::Command(command)),
                EnrollmentOutput::Alarm(state) => out.push(SessionOutput::Capability {
                    capability: capability.clone(),
                    value: CapabilityValue::Bool(state.is_active()),
                }),
                EnrollmentOutput::Enrolled(_) | EnrollmentOutput::Failed => {}
            }
        }
    }

    fn report_unmapped(&mut self, dp_id: u8, value: &DatapointValue) {
        if self.unmapped_reported.insert(dp_id) {
            debug!(
                device = %self.identity.address,
                profile = %self.profile.id,
                dp_id,
                data_type = %value.data_type(),
                "Unmapped datapoint"
            );
        } else {
            trace!(device = %self.identity.address, dp_id, "Unmapped datapoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{compile, BindingRule, Catalog, CompileOptions, DatapointDecl, PowerSpec, ScaledSource, Transform};
    use crate::codec::DataType;
    use crate::enrollment::{EnrollmentMethod, ZoneCategory};
    use chrono::{FixedOffset, TimeZone};

    const VENDOR: &str = "_TZE200_abc";
    const MODEL: &str = "TS0601";

    fn climate_profile() -> Profile {
        let mut p = Profile::observe_only("ts0601_climate");
        p.category = "climate_sensor".into();
        p.vendor_ids = vec![VENDOR.into()];
        p.model_ids = vec![MODEL.into()];
        p.datapoints = vec![
            DatapointDecl::new(1, DataType::Integer32),
            DatapointDecl::new(4, DataType::Integer32),
        ];
        p.bindings = vec![BindingRule {
            source: BindingSource::Datapoint { dp_id: 4 },
            capability: "measure_temperature".into(),
            transform: Transform::Divide { by: 10.0 },
        }];
        p.power = Some(PowerSpec {
            chemistry: Chemistry::Cr2032,
            percent: None,
            voltage: Some(ScaledSource::new(BindingSource::Datapoint { dp_id: 15 }, 100.0)),
            current: None,
        });
        p
    }

    fn motion_profile() -> Profile {
        let mut p = Profile::observe_only("pir");
        p.category = "motion_sensor".into();
        p.vendor_ids = vec!["_TZ3000_pir".into()];
        p.model_ids = vec!["TS0202".into()];
        p.zones = vec![ZoneSpec {
            endpoint: 1,
            category: ZoneCategory::Motion,
            capability: "alarm_motion".into(),
        }];
        p
    }

    fn registry() -> ProfileRegistry {
        compile(
            &Catalog {
                version: 1,
                profiles: vec![climate_profile(), motion_profile()],
            },
            &CompileOptions::default(),
        )
        .unwrap()
    }

    fn session(vendor: &str, model: &str) -> DeviceSession {
        DeviceSession::new(
            DeviceIdentity::new(DeviceAddress::new("0x00124b0001"), vendor, model),
            &registry(),
            &CoreSettings::default(),
            None,
        )
    }

    fn frame_event(bytes: Vec<u8>) -> StackEvent {
        StackEvent::Cluster {
            endpoint: 1,
            cluster: 0xEF00,
            name: "dataReport".into(),
            payload: EventPayload::Frame { bytes },
        }
    }

    fn capabilities(out: &[SessionOutput]) -> Vec<(String, CapabilityValue)> {
        out.iter()
            .filter_map(|o| match o {
                SessionOutput::Capability { capability, value } => Some((capability.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_temperature_binding() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0x0000, 0xEF00])], 0);

        let out = s.handle_event(
            &frame_event(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x02, 0x62]),
            10,
        );
        assert_eq!(
            capabilities(&out),
            vec![("measure_temperature".to_string(), CapabilityValue::Number(61.0))]
        );
        assert_eq!(s.datapoints().get(4).map(|r| r.occurrence_count), Some(1));
    }

    #[test]
    fn test_start_announces_placeholder_battery() {
        let mut s = session(VENDOR, MODEL);
        let out = s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        assert!(capabilities(&out).contains(&(CAPABILITY_PERCENT.to_string(), CapabilityValue::Number(100.0))));
        assert!(capabilities(&out).contains(&(CAPABILITY_LOW.to_string(), CapabilityValue::Bool(false))));
    }

    #[test]
    fn test_voltage_datapoint_feeds_cascade_and_persists() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        // dp15 = 285 -> 2.85 V
        let out = s.handle_event(
            &frame_event(vec![0x00, 0x02, 0x0F, 0x02, 0x00, 0x04, 0x00, 0x00, 0x01, 0x1D]),
            10,
        );
        assert!(capabilities(&out).contains(&(CAPABILITY_PERCENT.to_string(), CapabilityValue::Number(75.0))));
        // no raw reading yet, nothing learned
        assert!(!out.iter().any(|o| matches!(o, SessionOutput::PersistCalibration { .. })));
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        let out = s.handle_event(&frame_event(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00]), 10);
        assert!(out.is_empty());
        assert!(s.datapoints().is_empty());
    }

    #[test]
    fn test_stale_datapoint_not_applied() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        s.handle_event(&frame_event(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xC8]), 20);
        let out = s.handle_event(&frame_event(vec![0x00, 0x02, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x64]), 10);
        assert!(out.is_empty());
        let stored = s.datapoints().get(4).unwrap();
        assert_eq!(stored.timestamp, 20);
        assert_eq!(stored.occurrence_count, 1);
    }

    #[test]
    fn test_late_frame_does_not_overwrite_newer_value() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);

        // dp4 = 610 observed at 2000, delivered first
        let out = s.handle_event_at(
            &frame_event(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x02, 0x62]),
            100,
            2_000,
        );
        assert_eq!(capabilities(&out).len(), 1);

        // dp4 = 200 observed at 1000, delivered later
        let out = s.handle_event_at(
            &frame_event(vec![0x00, 0x02, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xC8]),
            200,
            1_000,
        );
        assert!(out.is_empty());

        let stored = s.datapoints().get(4).unwrap();
        assert_eq!(stored.value, DatapointValue::Integer32(610));
        assert_eq!(stored.timestamp, 2_000);
        assert_eq!(stored.occurrence_count, 1);
    }

    #[test]
    fn test_vendor_upkeep_time_sync_and_query() {
        let wall = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut s = session(VENDOR, MODEL).with_wall_clock(WallClock::new(0, wall));

        let out = s.start(&[EndpointDescriptor::new(1, &[0x0000, 0xEF00])], 0);
        let sync = out
            .iter()
            .find_map(|o| match o {
                SessionOutput::Command(OutboundCommand::SendVendorFrame { bytes, .. }) => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        // seq 0, dp 0x24 raw, len 7, Monday 2025-06-02 12:00:00
        assert_eq!(sync, vec![0x00, 0x00, 0x24, 0x00, 0x00, 0x07, 25, 6, 2, 12, 0, 0, 0]);

        let delay = CoreSettings::default().vendor.query_delay_ms;
        let out = s.on_tick(delay);
        assert!(out.contains(&SessionOutput::Command(OutboundCommand::QueryDatapoints {
            endpoint: 1,
            cluster: 0xEF00,
            dp_ids: vec![1, 4],
        })));

        // the time sync consumed a sequence number
        match s.send_datapoint(&Datapoint::new(1, DatapointValue::Integer32(5))).unwrap() {
            SessionOutput::Command(OutboundCommand::SendVendorFrame { bytes, .. }) => assert_eq!(&bytes[..2], &[0x00, 0x01]),
            other => panic!("unexpected output: {:?}", other),
        }

        // the daily sync and the read window opened at the same tick
        let pending = s.pending_timers();
        assert!(s.upkeep().next_deadline().is_some());
        assert_eq!(s.teardown().timers_cancelled, pending);
        assert_eq!(s.upkeep().pending_timers(), 0);
    }

    #[test]
    fn test_unresolved_device_observes_only() {
        let mut s = session("_TZE200_unknown", "TS0601");
        assert!(!s.is_resolved());
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        let out = s.handle_event(
            &frame_event(vec![0x00, 0x01, 0x04, 0x02, 0x00, 0x04, 0x00, 0x00, 0x02, 0x62]),
            10,
        );
        assert!(out.is_empty());
        assert_eq!(s.datapoints().len(), 1);
    }

    #[test]
    fn test_send_datapoint_uses_vendor_channel() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        let out = s.send_datapoint(&Datapoint::new(1, DatapointValue::Integer32(5))).unwrap();
        match out {
            SessionOutput::Command(OutboundCommand::SendVendorFrame { endpoint, cluster, bytes }) => {
                assert_eq!((endpoint, cluster), (1, 0xEF00));
                assert_eq!(&bytes[..2], &[0x00, 0x00]);
            }
            other => panic!("unexpected output: {:?}", other),
        }
        assert!(s.send_datapoint(&Datapoint::new(99, DatapointValue::Enum(0))).is_err());
    }

    #[test]
    fn test_motion_zone_enrolls_and_alarms() {
        let mut s = session("_TZ3000_pir", "TS0202");
        let out = s.start(&[EndpointDescriptor::new(1, &[0x0000, 0x0500])], 0);
        assert!(out.contains(&SessionOutput::Command(OutboundCommand::ReadZoneInfo { endpoint: 1 })));

        s.handle_event(&StackEvent::ZoneEnrollRequest { endpoint: 1, zone_type: 0x000D }, 5);
        s.handle_event(&StackEvent::ZoneInfo { endpoint: 1, ok: true, zone_type: Some(0x000D) }, 10);
        assert_eq!(s.zone_phase(1), Some(EnrollmentPhase::Enrolled(EnrollmentMethod::PassiveAck)));

        let out = s.handle_event(&StackEvent::ZoneStatus { endpoint: 1, status: 1 }, 100);
        assert_eq!(capabilities(&out), vec![("alarm_motion".to_string(), CapabilityValue::Bool(true))]);

        let deadline = s.next_deadline().unwrap();
        let out = s.on_tick(deadline);
        assert_eq!(capabilities(&out), vec![("alarm_motion".to_string(), CapabilityValue::Bool(false))]);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut s = session("_TZ3000_pir", "TS0202");
        s.start(&[EndpointDescriptor::new(2, &[0xEF00, 0xFC11])], 0);
        assert!(s.listener_count() > 0);
        assert!(s.pending_timers() > 0);

        let report = s.teardown();
        assert_eq!(report.listeners_removed, 1 + crate::constants::events::VENDOR_DP_ALTERNATES.len() + 1);
        // two probe timers plus the zone discovery timer
        assert_eq!(report.timers_cancelled, 3);
        assert_eq!(s.listener_count(), 0);
        assert_eq!(s.pending_timers(), 0);
        assert_eq!(s.next_deadline(), None);

        assert!(s.handle_event(&StackEvent::ZoneStatus { endpoint: 1, status: 1 }, 5).is_empty());
        assert_eq!(s.teardown(), TeardownReport::default());
    }

    #[test]
    fn test_unpaired_tears_down() {
        let mut s = session(VENDOR, MODEL);
        s.start(&[EndpointDescriptor::new(1, &[0xEF00])], 0);
        s.handle_event(&StackEvent::Unpaired, 1);
        assert!(s.is_torn_down());
        assert_eq!(s.listener_count(), 0);
    }

    #[test]
    fn test_host_message_conversion() {
        let addr = DeviceAddress::new("0x01");
        let cap = SessionOutput::Capability {
            capability: "onoff".into(),
            value: CapabilityValue::Bool(true),
        };
        assert!(matches!(cap.into_host_message(&addr), Some(HostMessage::Capability { .. })));
        let persist = SessionOutput::PersistCalibration {
            key: CalibrationKey::new("v", "m", "0x01"),
            record: PersistedCalibration {
                raw_samples: vec![],
                chemistry: Chemistry::Unknown,
                confidence: 0,
                last_level: None,
            },
        };
        assert!(persist.into_host_message(&addr).is_none());
    }
}
