//! Enrollment state machine for one alarm zone
//!
//! Driven entirely by events and `on_tick`; it never blocks and never reads
//! a clock. Commands come back as outputs for the caller to send.

use mc_protocol::OutboundCommand;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::zone::{AlarmState, ZoneCategory};
use crate::settings::EnrollmentSettings;
use crate::timers::{Millis, TimerSet};

/// Enrollment methods in the order they are attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentMethod {
    /// An unsolicited enroll request already seen counts as success
    PassiveAck,
    /// Explicit enroll request/response handshake
    RequestResponse,
    /// Write zone configuration directly
    WriteZoneConfig,
    /// Poll zone status as a last resort
    StatusPolling,
}

impl EnrollmentMethod {
    pub const ORDER: [EnrollmentMethod; 4] = [
        EnrollmentMethod::PassiveAck,
        EnrollmentMethod::RequestResponse,
        EnrollmentMethod::WriteZoneConfig,
        EnrollmentMethod::StatusPolling,
    ];

    pub fn index(&self) -> usize {
        match self {
            EnrollmentMethod::PassiveAck => 0,
            EnrollmentMethod::RequestResponse => 1,
            EnrollmentMethod::WriteZoneConfig => 2,
            EnrollmentMethod::StatusPolling => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentMethod::PassiveAck => "passive_ack",
            EnrollmentMethod::RequestResponse => "request_response",
            EnrollmentMethod::WriteZoneConfig => "write_zone_config",
            EnrollmentMethod::StatusPolling => "status_polling",
        }
    }
}

/// Enrollment phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "method", rename_all = "snake_case")]
pub enum EnrollmentPhase {
    Unstarted,
    Discovering,
    Enrolling(EnrollmentMethod),
    /// Enrolled, with the method that succeeded
    Enrolled(EnrollmentMethod),
    /// All methods exhausted; alarm reports are still honored
    Failed,
}

/// Zone event routed to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneEvent {
    InfoRead { ok: bool, zone_type: Option<u16> },
    EnrollRequest { zone_type: u16 },
    StateReport { enrolled: bool },
    ConfigWritten { ok: bool },
    Status { status: u16 },
}

/// Output of the machine
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentOutput {
    Command(OutboundCommand),
    /// Alarm sub-state changed
    Alarm(AlarmState),
    Enrolled(EnrollmentMethod),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EnrollmentTimer {
    Discover,
    Method,
    Poll,
    AutoReset,
}

/// Per-zone enrollment machine
#[derive(Debug)]
pub struct EnrollmentMachine {
    endpoint: u8,
    category: ZoneCategory,
    phase: EnrollmentPhase,
    alarm: AlarmState,
    ack_seen: bool,
    zone_type: Option<u16>,
    timers: TimerSet<EnrollmentTimer>,
    settings: EnrollmentSettings,
}

impl EnrollmentMachine {
    pub fn new(endpoint: u8, category: ZoneCategory, settings: &EnrollmentSettings) -> Self {
        Self {
            endpoint,
            category,
            phase: EnrollmentPhase::Unstarted,
            alarm: AlarmState::Clear,
            ack_seen: false,
            zone_type: None,
            timers: TimerSet::new(),
            settings: settings.clone(),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn category(&self) -> ZoneCategory {
        self.category
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.phase
    }

    pub fn alarm(&self) -> AlarmState {
        self.alarm
    }

    pub fn is_enrolled(&self) -> bool {
        matches!(self.phase, EnrollmentPhase::Enrolled(_))
    }

    /// Begin enrollment. A no-op unless the machine is unstarted.
    pub fn start(&mut self, now: Millis) -> Vec<EnrollmentOutput> {
        if self.phase != EnrollmentPhase::Unstarted {
            debug!(endpoint = self.endpoint, phase = ?self.phase, "Enrollment already started");
            return Vec::new();
        }

        self.phase = EnrollmentPhase::Discovering;
        self.timers
            .schedule(EnrollmentTimer::Discover, now.saturating_add(self.settings.discover_timeout_ms));
        vec![EnrollmentOutput::Command(OutboundCommand::ReadZoneInfo {
            endpoint: self.endpoint,
        })]
    }

    /// Leave `Failed` and run the whole cascade again
    pub fn restart(&mut self, now: Millis) -> Vec<EnrollmentOutput> {
        if self.phase != EnrollmentPhase::Failed {
            return Vec::new();
        }
        info!(endpoint = self.endpoint, zone = self.category.as_str(), "Restarting enrollment");
        self.phase = EnrollmentPhase::Unstarted;
        self.start(now)
    }

    pub fn handle(&mut self, event: ZoneEvent, now: Millis) -> Vec<EnrollmentOutput> {
        let mut out = Vec::new();

        match event {
            ZoneEvent::InfoRead { ok, zone_type } => {
                if zone_type.is_some() {
                    self.zone_type = zone_type;
                }
                if ok && self.phase == EnrollmentPhase::Discovering {
                    self.timers.cancel(&EnrollmentTimer::Discover);
                    self.enter_method(0, now, &mut out);
                }
            }
            ZoneEvent::EnrollRequest { zone_type } => {
                self.ack_seen = true;
                self.zone_type = Some(zone_type);
                match self.phase {
                    EnrollmentPhase::Enrolling(EnrollmentMethod::PassiveAck) => {
                        self.succeed(EnrollmentMethod::PassiveAck, &mut out);
                    }
                    EnrollmentPhase::Enrolling(EnrollmentMethod::RequestResponse)
                    | EnrollmentPhase::Enrolled(_)
                    | EnrollmentPhase::Failed => {
                        out.push(self.enroll_response());
                    }
                    _ => {}
                }
            }
            ZoneEvent::StateReport { enrolled } => {
                if !enrolled {
                    return out;
                }
                match self.phase {
                    EnrollmentPhase::Enrolling(method) => self.succeed(method, &mut out),
                    EnrollmentPhase::Unstarted | EnrollmentPhase::Discovering => self.ack_seen = true,
                    _ => {}
                }
            }
            ZoneEvent::ConfigWritten { ok } => {
                if self.phase == EnrollmentPhase::Enrolling(EnrollmentMethod::WriteZoneConfig) {
                    if ok {
                        self.succeed(EnrollmentMethod::WriteZoneConfig, &mut out);
                    } else {
                        debug!(endpoint = self.endpoint, "Zone config write rejected");
                        self.advance(now, &mut out);
                    }
                }
            }
            ZoneEvent::Status { status } => {
                if self.phase == EnrollmentPhase::Enrolling(EnrollmentMethod::StatusPolling) {
                    self.succeed(EnrollmentMethod::StatusPolling, &mut out);
                }
                self.apply_status(status, now, &mut out);
            }
        }

        out
    }

    pub fn on_tick(&mut self, now: Millis) -> Vec<EnrollmentOutput> {
        let mut out = Vec::new();

        for timer in self.timers.take_expired(now) {
            match timer {
                EnrollmentTimer::Discover => {
                    if self.phase == EnrollmentPhase::Discovering {
                        debug!(endpoint = self.endpoint, "Zone info read timed out, enrolling anyway");
                        self.enter_method(0, now, &mut out);
                    }
                }
                EnrollmentTimer::Method => {
                    if let EnrollmentPhase::Enrolling(method) = self.phase {
                        debug!(endpoint = self.endpoint, method = method.as_str(), "Enrollment method timed out");
                        self.advance(now, &mut out);
                    }
                }
                EnrollmentTimer::Poll => {
                    if self.phase == EnrollmentPhase::Enrolling(EnrollmentMethod::StatusPolling) {
                        out.push(self.poll());
                        self.timers
                            .schedule(EnrollmentTimer::Poll, now.saturating_add(self.settings.poll_interval_ms));
                    }
                }
                EnrollmentTimer::AutoReset => {
                    if self.alarm == AlarmState::Active {
                        self.alarm = AlarmState::Clear;
                        out.push(EnrollmentOutput::Alarm(AlarmState::Clear));
                    }
                }
            }
        }

        out
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every timer. Returns how many were pending.
    pub fn teardown(&mut self) -> usize {
        self.timers.cancel_all()
    }

    // ------------------------------------------------------------------------

    fn enter_method(&mut self, index: usize, now: Millis, out: &mut Vec<EnrollmentOutput>) {
        let method = EnrollmentMethod::ORDER[index];
        self.phase = EnrollmentPhase::Enrolling(method);
        self.timers.schedule(
            EnrollmentTimer::Method,
            now.saturating_add(self.settings.method_timeout(method)),
        );

        match method {
            EnrollmentMethod::PassiveAck => {
                if self.ack_seen {
                    self.succeed(method, out);
                }
            }
            EnrollmentMethod::RequestResponse => out.push(self.enroll_response()),
            EnrollmentMethod::WriteZoneConfig => {
                out.push(EnrollmentOutput::Command(OutboundCommand::WriteZoneConfig {
                    endpoint: self.endpoint,
                    zone_type: self.zone_type.unwrap_or_else(|| self.category.zone_type()),
                }));
            }
            EnrollmentMethod::StatusPolling => {
                out.push(self.poll());
                self.timers
                    .schedule(EnrollmentTimer::Poll, now.saturating_add(self.settings.poll_interval_ms));
            }
        }
    }

    fn advance(&mut self, now: Millis, out: &mut Vec<EnrollmentOutput>) {
        let EnrollmentPhase::Enrolling(method) = self.phase else {
            return;
        };
        self.timers.cancel(&EnrollmentTimer::Method);
        self.timers.cancel(&EnrollmentTimer::Poll);

        let next = method.index() + 1;
        if next < EnrollmentMethod::ORDER.len() {
            self.enter_method(next, now, out);
        } else {
            self.phase = EnrollmentPhase::Failed;
            warn!(
                endpoint = self.endpoint,
                zone = self.category.as_str(),
                attempted = ?EnrollmentMethod::ORDER.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                "Alarm zone enrollment failed, listening passively"
            );
            out.push(EnrollmentOutput::Failed);
        }
    }

    fn succeed(&mut self, method: EnrollmentMethod, out: &mut Vec<EnrollmentOutput>) {
        self.phase = EnrollmentPhase::Enrolled(method);
        self.timers.cancel(&EnrollmentTimer::Discover);
        self.timers.cancel(&EnrollmentTimer::Method);
        self.timers.cancel(&EnrollmentTimer::Poll);
        info!(
            endpoint = self.endpoint,
            zone = self.category.as_str(),
            method = method.as_str(),
            "Alarm zone enrolled"
        );
        out.push(EnrollmentOutput::Enrolled(method));
    }

    fn apply_status(&mut self, status: u16, now: Millis, out: &mut Vec<EnrollmentOutput>) {
        let state = AlarmState::from_zone_status(status);

        if state.is_active() {
            let reset_ms = self.settings.auto_reset_for(self.category);
            if reset_ms > 0 {
                self.timers
                    .schedule(EnrollmentTimer::AutoReset, now.saturating_add(reset_ms));
            }
        } else {
            self.timers.cancel(&EnrollmentTimer::AutoReset);
        }

        if state != self.alarm {
            self.alarm = state;
            out.push(EnrollmentOutput::Alarm(state));
        }
    }

    fn enroll_response(&self) -> EnrollmentOutput {
        EnrollmentOutput::Command(OutboundCommand::SendEnrollResponse {
            endpoint: self.endpoint,
            zone_id: self.settings.zone_id,
        })
    }

    fn poll(&self) -> EnrollmentOutput {
        EnrollmentOutput::Command(OutboundCommand::PollZoneStatus {
            endpoint: self.endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(category: ZoneCategory) -> (EnrollmentMachine, EnrollmentSettings) {
        let settings = EnrollmentSettings::default();
        (EnrollmentMachine::new(1, category, &settings), settings)
    }

    fn commands(out: &[EnrollmentOutput]) -> Vec<&OutboundCommand> {
        out.iter()
            .filter_map(|o| match o {
                EnrollmentOutput::Command(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_reads_zone_info() {
        let (mut m, _) = machine(ZoneCategory::Motion);
        let out = m.start(0);
        assert_eq!(commands(&out), vec![&OutboundCommand::ReadZoneInfo { endpoint: 1 }]);
        assert_eq!(m.phase(), EnrollmentPhase::Discovering);
        assert!(m.start(10).is_empty());
    }

    #[test]
    fn test_passive_ack_before_enrolling() {
        let (mut m, _) = machine(ZoneCategory::Contact);
        m.start(0);
        m.handle(ZoneEvent::EnrollRequest { zone_type: 0x0015 }, 5);
        let out = m.handle(ZoneEvent::InfoRead { ok: true, zone_type: Some(0x0015) }, 10);
        assert!(out.contains(&EnrollmentOutput::Enrolled(EnrollmentMethod::PassiveAck)));
        assert_eq!(m.phase(), EnrollmentPhase::Enrolled(EnrollmentMethod::PassiveAck));
        assert_eq!(m.pending_timers(), 0);
    }

    #[test]
    fn test_request_response_success() {
        let (mut m, s) = machine(ZoneCategory::Motion);
        m.start(0);
        m.handle(ZoneEvent::InfoRead { ok: true, zone_type: None }, 0);
        let out = m.on_tick(s.passive_ack_ms);
        assert_eq!(
            commands(&out),
            vec![&OutboundCommand::SendEnrollResponse { endpoint: 1, zone_id: s.zone_id }]
        );
        m.handle(ZoneEvent::StateReport { enrolled: true }, s.passive_ack_ms + 1);
        assert_eq!(m.phase(), EnrollmentPhase::Enrolled(EnrollmentMethod::RequestResponse));
    }

    #[test]
    fn test_full_cascade_to_failed() {
        let (mut m, s) = machine(ZoneCategory::Motion);
        m.start(0);
        let mut now = s.discover_timeout_ms;
        m.on_tick(now);
        assert_eq!(m.phase(), EnrollmentPhase::Enrolling(EnrollmentMethod::PassiveAck));

        now += s.passive_ack_ms;
        m.on_tick(now);
        assert_eq!(m.phase(), EnrollmentPhase::Enrolling(EnrollmentMethod::RequestResponse));

        now += s.request_response_ms;
        let out = m.on_tick(now);
        assert_eq!(
            commands(&out),
            vec![&OutboundCommand::WriteZoneConfig { endpoint: 1, zone_type: 0x000D }]
        );

        now += s.write_config_ms;
        let out = m.on_tick(now);
        assert_eq!(commands(&out), vec![&OutboundCommand::PollZoneStatus { endpoint: 1 }]);

        now += s.polling_ms;
        let out = m.on_tick(now);
        assert!(out.contains(&EnrollmentOutput::Failed));
        assert_eq!(m.phase(), EnrollmentPhase::Failed);
        assert_eq!(m.next_deadline(), None);

        // Events do not pull the machine back into enrolling
        m.handle(ZoneEvent::StateReport { enrolled: true }, now + 1);
        m.handle(ZoneEvent::InfoRead { ok: true, zone_type: None }, now + 2);
        assert_eq!(m.phase(), EnrollmentPhase::Failed);
    }

    #[test]
    fn test_failed_still_honors_alarm() {
        let (mut m, s) = machine(ZoneCategory::Contact);
        m.start(0);
        let total = s.discover_timeout_ms
            + s.passive_ack_ms
            + s.request_response_ms
            + s.write_config_ms
            + s.polling_ms;
        let mut now = 0;
        while m.phase() != EnrollmentPhase::Failed && now <= total {
            now += 1_000;
            m.on_tick(now);
        }
        assert_eq!(m.phase(), EnrollmentPhase::Failed);

        let out = m.handle(ZoneEvent::Status { status: 0x0001 }, now);
        assert_eq!(out, vec![EnrollmentOutput::Alarm(AlarmState::Active)]);
        assert_eq!(m.alarm(), AlarmState::Active);
    }

    #[test]
    fn test_restart_from_failed() {
        let (mut m, _) = machine(ZoneCategory::Contact);
        assert!(m.restart(0).is_empty());
        m.phase = EnrollmentPhase::Failed;
        let out = m.restart(100);
        assert_eq!(commands(&out), vec![&OutboundCommand::ReadZoneInfo { endpoint: 1 }]);
        assert_eq!(m.phase(), EnrollmentPhase::Discovering);
    }

    #[test]
    fn test_motion_auto_reset() {
        let (mut m, s) = machine(ZoneCategory::Motion);
        m.start(0);
        m.handle(ZoneEvent::EnrollRequest { zone_type: 0x000D }, 0);
        m.handle(ZoneEvent::InfoRead { ok: true, zone_type: None }, 0);
        assert!(m.is_enrolled());

        m.handle(ZoneEvent::Status { status: 0x0001 }, 1_000);
        let reset = s.auto_reset_for(ZoneCategory::Motion);
        assert!(m.on_tick(1_000 + reset - 1).is_empty());
        assert_eq!(
            m.on_tick(1_000 + reset),
            vec![EnrollmentOutput::Alarm(AlarmState::Clear)]
        );
    }

    #[test]
    fn test_contact_has_no_auto_reset() {
        let (mut m, _) = machine(ZoneCategory::Contact);
        m.handle(ZoneEvent::Status { status: 0x0001 }, 0);
        assert_eq!(m.next_deadline(), None);
        assert_eq!(m.alarm(), AlarmState::Active);
    }

    #[test]
    fn test_polling_reply_enrolls() {
        let (mut m, _) = machine(ZoneCategory::Water);
        m.phase = EnrollmentPhase::Enrolling(EnrollmentMethod::StatusPolling);
        let out = m.handle(ZoneEvent::Status { status: 0 }, 0);
        assert_eq!(out, vec![EnrollmentOutput::Enrolled(EnrollmentMethod::StatusPolling)]);
    }

    #[test]
    fn test_rejected_config_write_advances() {
        let (mut m, _) = machine(ZoneCategory::Gas);
        let mut out = Vec::new();
        m.enter_method(2, 0, &mut out);
        let out = m.handle(ZoneEvent::ConfigWritten { ok: false }, 1);
        assert_eq!(m.phase(), EnrollmentPhase::Enrolling(EnrollmentMethod::StatusPolling));
        assert_eq!(commands(&out), vec![&OutboundCommand::PollZoneStatus { endpoint: 1 }]);
    }

    #[test]
    fn test_teardown_cancels_timers() {
        let (mut m, _) = machine(ZoneCategory::Motion);
        m.start(0);
        m.handle(ZoneEvent::Status { status: 1 }, 0);
        assert_eq!(m.teardown(), 2);
        assert_eq!(m.next_deadline(), None);
    }
}
