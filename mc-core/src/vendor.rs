//! Vendor channel upkeep
//!
//! Many devices on the vendor datapoint channel stay silent until their
//! clock is set or they are asked for their datapoints. Once a session knows
//! its vendor channel it sends a time sync right away, repeats it every day
//! at a fixed local hour, and queries the profile's declared datapoints
//! after a short delay.
//!
//! The session clock is monotonic and carries no date, so the time sync
//! needs a `WallClock` anchor supplied by the host. Without one the sync is
//! skipped and only the query runs.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, Timelike};
use mc_protocol::OutboundCommand;
use tracing::{debug, trace, warn};

use crate::channel::ChannelKey;
use crate::codec::{encode_frame, Datapoint, DatapointValue, VendorFrame};
use crate::constants::vendor::TIME_SYNC_DP;
use crate::settings::VendorSettings;
use crate::timers::{Millis, TimerSet};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Wall clock
// ============================================================================

/// Maps the session clock onto local wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    at: Millis,
    wall: DateTime<FixedOffset>,
}

impl WallClock {
    /// `wall` is the local time when the session clock reads `at`
    pub fn new(at: Millis, wall: DateTime<FixedOffset>) -> Self {
        Self { at, wall }
    }

    /// Anchor the session clock reading `at` to the system's local time
    pub fn local(at: Millis) -> Self {
        let now = Local::now();
        Self::new(at, now.with_timezone(now.offset()))
    }

    /// Local time when the session clock reads `now`
    pub fn time_at(&self, now: Millis) -> DateTime<FixedOffset> {
        let delta = now as i64 - self.at as i64;
        self.wall + Duration::milliseconds(delta)
    }
}

/// Time sync payload: `[yy, mm, dd, hh, mi, ss, weekday]`, years since
/// 2000 and Monday as weekday 0
pub fn time_sync_payload(time: &DateTime<FixedOffset>) -> [u8; 7] {
    [
        (time.year() - 2000).clamp(0, u8::MAX as i32) as u8,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.weekday().num_days_from_monday() as u8,
    ]
}

/// Milliseconds from `time` until the next `hour`:00 local time, strictly later
pub fn millis_until_hour(time: &DateTime<FixedOffset>, hour: u32) -> u64 {
    let target = i64::from(hour.min(23)) * 3_600_000;
    let current = i64::from(time.num_seconds_from_midnight()) * 1000 + i64::from(time.timestamp_subsec_millis());
    let mut delta = target - current;
    if delta <= 0 {
        delta += DAY_MS;
    }
    delta as u64
}

// ============================================================================
// Upkeep
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum UpkeepTimer {
    Query,
    TimeSync,
}

/// Time sync and datapoint query scheduling for one device
#[derive(Debug)]
pub struct VendorUpkeep {
    settings: VendorSettings,
    dp_ids: Vec<u8>,
    channel: Option<ChannelKey>,
    wall_clock: Option<WallClock>,
    timers: TimerSet<UpkeepTimer>,
    syncs_sent: u32,
}

impl VendorUpkeep {
    /// `dp_ids` are the datapoints to query once the channel is known
    pub fn new(settings: &VendorSettings, dp_ids: Vec<u8>) -> Self {
        Self {
            settings: settings.clone(),
            dp_ids,
            channel: None,
            wall_clock: None,
            timers: TimerSet::new(),
            syncs_sent: 0,
        }
    }

    /// Must be set before `start` for time sync to run
    pub fn set_wall_clock(&mut self, clock: WallClock) {
        self.wall_clock = Some(clock);
    }

    /// Begin upkeep on `channel`. Returns the commands due now.
    /// Only the first call has any effect.
    pub fn start(&mut self, channel: ChannelKey, now: Millis, seq: &mut u16) -> Vec<OutboundCommand> {
        if self.channel.is_some() {
            return Vec::new();
        }
        self.channel = Some(channel);

        let mut out = Vec::new();
        if self.settings.time_sync {
            out.extend(self.sync_time(channel, now, seq));
        }
        if self.settings.query_datapoints && !self.dp_ids.is_empty() {
            self.timers
                .schedule(UpkeepTimer::Query, now.saturating_add(self.settings.query_delay_ms));
        }
        out
    }

    /// Fire due upkeep timers
    pub fn on_tick(&mut self, now: Millis, seq: &mut u16) -> Vec<OutboundCommand> {
        let Some(channel) = self.channel else {
            return Vec::new();
        };
        let mut out = Vec::new();

        for timer in self.timers.take_expired(now) {
            match timer {
                UpkeepTimer::Query => {
                    debug!(channel = %channel, dp_ids = ?self.dp_ids, "Querying declared datapoints");
                    out.push(OutboundCommand::QueryDatapoints {
                        endpoint: channel.endpoint,
                        cluster: channel.cluster,
                        dp_ids: self.dp_ids.clone(),
                    });
                }
                UpkeepTimer::TimeSync => out.extend(self.sync_time(channel, now, seq)),
            }
        }

        out
    }

    /// Build a time sync frame and schedule the next one
    fn sync_time(&mut self, channel: ChannelKey, now: Millis, seq: &mut u16) -> Option<OutboundCommand> {
        let Some(clock) = self.wall_clock else {
            trace!(channel = %channel, "No wall clock, skipping time sync");
            return None;
        };
        let time = clock.time_at(now);

        let frame = VendorFrame {
            seq: *seq,
            datapoints: vec![Datapoint::new(TIME_SYNC_DP, DatapointValue::Raw(time_sync_payload(&time).to_vec()))],
        };
        *seq = seq.wrapping_add(1);

        let delay = millis_until_hour(&time, self.settings.time_sync_hour);
        self.timers.schedule(UpkeepTimer::TimeSync, now.saturating_add(delay));

        match encode_frame(&frame) {
            Ok(bytes) => {
                self.syncs_sent += 1;
                debug!(channel = %channel, time = %time, next_in_ms = delay, "Sending time sync");
                Some(OutboundCommand::SendVendorFrame {
                    endpoint: channel.endpoint,
                    cluster: channel.cluster,
                    bytes,
                })
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to encode time sync");
                None
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.channel.is_some()
    }

    pub fn syncs_sent(&self) -> u32 {
        self.syncs_sent
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every upkeep timer and return how many were pending
    pub fn teardown(&mut self) -> usize {
        self.timers.cancel_all()
    }
}
