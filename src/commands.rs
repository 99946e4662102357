/*
 * This file is part of Meshcap.
 *
 * Copyright (C) 2025 Meshcap contributors
 *
 * Meshcap is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Meshcap is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Meshcap. If not, see <https://www.gnu.org/licenses/>.
 */

//! Command execution
//!
//! Each command builds its report as a `String` so the output can be
//! checked without a terminal; `run_cli` only prints.
//!
//! # Replay
//! A captured stack event log (one `WireEnvelope` per line) is driven
//! through one `DeviceSession` per address. The clock is taken from the
//! envelope timestamps, and timers falling due between two events fire in
//! deadline order before the later event is handled.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use mc_core::{
    compile, decode_records, load_settings, save_settings, Catalog, Chemistry, CollisionReason, CoreSettings,
    DeviceIdentity, DeviceSession, Millis, PowerEstimator, PowerSample, ProfileRegistry, SessionOutput,
};
use mc_protocol::{parse_envelope, DeviceAddress, HostMessage, StackEvent, WireEnvelope};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, SettingsCommands};
use crate::logger;

/// Upper bound on timer firings while draining one replay
const MAX_DRAIN_STEPS: usize = 100_000;

pub fn run_cli(cli: &Cli) -> anyhow::Result<()> {
    let settings_path = cli.settings.as_deref();

    match &cli.command {
        Commands::Compile { catalog, strict } => {
            let settings = load_settings(settings_path)?;
            print!("{}", compile_report(catalog, &settings, *strict)?);
        }
        Commands::Resolve { catalog, vendor, model } => {
            let settings = load_settings(settings_path)?;
            print!("{}", resolve_report(catalog, &settings, vendor, model)?);
        }
        Commands::Decode { hex } => {
            print!("{}", decode_report(hex)?);
        }
        Commands::Estimate {
            chemistry,
            voltage,
            current,
            raw,
        } => {
            let settings = load_settings(settings_path)?;
            print!("{}", estimate_report(*chemistry, *voltage, *current, *raw, &settings)?);
        }
        Commands::Replay {
            catalog,
            events,
            events_out,
            drain,
        } => {
            let settings = load_settings(settings_path)?;
            if let Some(out) = events_out {
                logger::init_logging(out).with_context(|| format!("Failed to open {}", out.display()))?;
            }
            let result = replay_file(catalog, events, &settings, *drain);
            logger::close_logging();

            for message in result? {
                match message.to_line() {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Dropping host message"),
                }
            }
        }
        Commands::Settings(sub) => cmd_settings(sub, settings_path)?,
    }

    Ok(())
}

// ============================================================================
// Catalog Commands
// ============================================================================

fn load_registry(path: &Path, settings: &CoreSettings, strict: bool) -> anyhow::Result<ProfileRegistry> {
    let catalog = Catalog::load(path).with_context(|| format!("Failed to load catalog {}", path.display()))?;
    let mut options = settings.catalog.compile_options();
    options.strict_ties |= strict;
    compile(&catalog, &options).map_err(|e| {
        if e.is_build_fatal() {
            anyhow!("Catalog rejected: {}", e)
        } else {
            e.into()
        }
    })
}

/// Compile a catalog and describe every collision decision
pub fn compile_report(path: &Path, settings: &CoreSettings, strict: bool) -> anyhow::Result<String> {
    let registry = load_registry(path, settings, strict)?;

    let mut out = String::new();
    writeln!(
        out,
        "Compiled {} profiles ({} identities)",
        registry.len(),
        registry.identity_count()
    )?;

    let collisions = registry.collisions();
    if collisions.is_empty() {
        writeln!(out, "No identity collisions")?;
        return Ok(out);
    }

    writeln!(out, "Collisions ({}):", collisions.len())?;
    for record in collisions {
        let rule = match &record.reason {
            CollisionReason::Specificity {
                winner_rank,
                runner_up_rank,
            } => format!("specificity {} > {}", winner_rank, runner_up_rank),
            CollisionReason::DeclarationOrder { rank } => format!("declaration order at rank {}", rank),
        };
        writeln!(
            out,
            "  {} / {}: [{}] -> {} ({})",
            record.vendor_id,
            record.model_id,
            record.candidates.join(", "),
            record.winner,
            rule
        )?;
    }
    Ok(out)
}

/// Describe the profile an identity resolves to
pub fn resolve_report(path: &Path, settings: &CoreSettings, vendor: &str, model: &str) -> anyhow::Result<String> {
    let registry = load_registry(path, settings, false)?;

    let Some(profile) = registry.resolve(vendor, model) else {
        return Ok(format!("{} / {}: no profile (observe only)\n", vendor, model));
    };

    let mut out = String::new();
    writeln!(out, "{} / {} -> {} ({})", vendor, model, profile.id, profile.category)?;
    if !profile.name.is_empty() {
        writeln!(out, "  Name: {}", profile.name)?;
    }
    for rule in &profile.bindings {
        writeln!(out, "  {} <- {} ({})", rule.capability, rule.source, rule.transform.name())?;
    }
    if let Some(power) = &profile.power {
        writeln!(out, "  Battery: {}", power.chemistry)?;
    }
    for zone in &profile.zones {
        writeln!(
            out,
            "  Zone: endpoint {} {} -> {}",
            zone.endpoint,
            zone.category.as_str(),
            zone.capability
        )?;
    }
    Ok(out)
}

// ============================================================================
// Frame and Power Commands
// ============================================================================

/// Decode a vendor frame given as one or more hex fragments
pub fn decode_report(parts: &[String]) -> anyhow::Result<String> {
    let joined: String = parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .map(|p| p.trim_start_matches("0x"))
        .collect();
    let bytes = hex::decode(&joined).context("Frame is not valid hex")?;

    let (seq, records) = decode_records(&bytes, 0)?;

    let mut out = String::new();
    writeln!(out, "seq {} ({} datapoints)", seq, records.len())?;
    for record in &records {
        writeln!(
            out,
            "  dp {:>3} {:<8} {:?} [{}]",
            record.dp_id,
            record.data_type.as_str(),
            record.value,
            hex::encode(&record.raw_bytes)
        )?;
    }
    Ok(out)
}

/// Run one cascade evaluation for a single sample
pub fn estimate_report(
    chemistry: Chemistry,
    voltage: Option<f64>,
    current: Option<f64>,
    raw: Option<f64>,
    settings: &CoreSettings,
) -> anyhow::Result<String> {
    let mut estimator = PowerEstimator::new(chemistry, &settings.power);
    let sample = PowerSample {
        raw,
        voltage,
        current_ma: current,
    };
    let estimate = estimator.update(sample);

    let mut out = String::new();
    writeln!(out, "Chemistry: {}", chemistry)?;
    writeln!(
        out,
        "Level {} ({:?}): {:.1}%",
        estimate.level.number(),
        estimate.level,
        estimate.percent
    )?;
    if let Some(format) = estimate.raw_format {
        writeln!(out, "Raw format: {:?}", format)?;
    }
    if estimate.is_low(settings.power.low_battery_percent) {
        writeln!(out, "Battery low")?;
    }
    Ok(out)
}

// ============================================================================
// Replay
// ============================================================================

/// Offline driver for device sessions over a recorded event log
pub struct Replayer<'a> {
    registry: &'a ProfileRegistry,
    settings: &'a CoreSettings,
    sessions: BTreeMap<DeviceAddress, DeviceSession>,
    clock: Millis,
    persisted: usize,
}

impl<'a> Replayer<'a> {
    pub fn new(registry: &'a ProfileRegistry, settings: &'a CoreSettings) -> Self {
        Self {
            registry,
            settings,
            sessions: BTreeMap::new(),
            clock: 0,
            persisted: 0,
        }
    }

    pub fn clock(&self) -> Millis {
        self.clock
    }

    pub fn device_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, address: &DeviceAddress) -> Option<&DeviceSession> {
        self.sessions.get(address)
    }

    /// Calibration records the sessions asked to persist
    pub fn persisted_count(&self) -> usize {
        self.persisted
    }

    /// Handle one envelope, firing timers due before it first.
    ///
    /// The replay clock never runs backwards, so an out-of-order envelope
    /// is delivered at the current clock. Its own timestamp still stamps the
    /// datapoints it carries.
    pub fn feed(&mut self, envelope: WireEnvelope) -> Vec<HostMessage> {
        let now = envelope.timestamp_ms.map_or(self.clock, |ts| ts.max(self.clock));
        let observed_at = envelope.timestamp_ms.unwrap_or(now);
        let mut messages = self.advance_to(now);

        let WireEnvelope { id, device, event, .. } = envelope;

        if let StackEvent::Paired {
            vendor_id, model_id, ..
        } = &event
        {
            if !self.sessions.contains_key(&device) {
                let identity = DeviceIdentity::new(device.clone(), vendor_id.as_str(), model_id.as_str());
                let session = DeviceSession::new(identity, self.registry, self.settings, None);
                info!(device = %device, profile = %session.profile().id, "Device paired");
                self.sessions.insert(device.clone(), session);
            }
        }

        let Some(session) = self.sessions.get_mut(&device) else {
            debug!(device = %device, event = event.kind(), "Event for unknown device");
            let message = HostMessage::error(Some(device.clone()), Some(id), format!("Device not found: {}", device));
            record_host_message(&message);
            messages.push(message);
            return messages;
        };

        let outputs = session.handle_event_at(&event, now, observed_at);
        self.collect(&device, outputs, &mut messages);

        if matches!(event, StackEvent::Unpaired) {
            self.sessions.remove(&device);
            info!(device = %device, "Device removed");
        }
        messages
    }

    /// Fire every pending timer until none remain
    pub fn drain(&mut self) -> Vec<HostMessage> {
        let mut messages = Vec::new();
        for _ in 0..MAX_DRAIN_STEPS {
            let Some(deadline) = self.earliest_deadline() else {
                return messages;
            };
            messages.extend(self.advance_to(deadline));
        }
        warn!(steps = MAX_DRAIN_STEPS, "Timers still pending after drain limit");
        messages
    }

    fn earliest_deadline(&self) -> Option<Millis> {
        self.sessions.values().filter_map(|s| s.next_deadline()).min()
    }

    /// Fire timers due at or before `now`, in deadline order
    fn advance_to(&mut self, now: Millis) -> Vec<HostMessage> {
        let mut messages = Vec::new();

        while let Some(deadline) = self.earliest_deadline().filter(|d| *d <= now) {
            self.clock = self.clock.max(deadline);
            let due: Vec<DeviceAddress> = self
                .sessions
                .iter()
                .filter(|(_, s)| s.next_deadline().is_some_and(|d| d <= deadline))
                .map(|(address, _)| address.clone())
                .collect();

            let mut fired = false;
            for address in due {
                if let Some(session) = self.sessions.get_mut(&address) {
                    let before = session.pending_timers();
                    let outputs = session.on_tick(deadline);
                    fired |= !outputs.is_empty() || session.pending_timers() != before;
                    self.collect(&address, outputs, &mut messages);
                }
            }
            if !fired {
                warn!(deadline, "Timer did not fire, stopping");
                break;
            }
        }

        self.clock = now;
        messages
    }

    fn collect(&mut self, device: &DeviceAddress, outputs: Vec<SessionOutput>, messages: &mut Vec<HostMessage>) {
        for output in outputs {
            if let SessionOutput::PersistCalibration { key, record } = &output {
                self.persisted += 1;
                debug!(key = %key, confidence = record.confidence, "Calibration updated");
            }
            if let Some(message) = output.into_host_message(device) {
                record_host_message(&message);
                messages.push(message);
            }
        }
    }
}

fn record_host_message(message: &HostMessage) {
    if logger::is_enabled() {
        match serde_json::to_value(message) {
            Ok(value) => {
                logger::log_event("host_message", value);
            }
            Err(e) => warn!(error = %e, "Could not record host message"),
        }
    }
}

/// Replay a JSON-lines event log against a catalog
pub fn replay_file(
    catalog: &Path,
    events: &Path,
    settings: &CoreSettings,
    drain: bool,
) -> anyhow::Result<Vec<HostMessage>> {
    let registry = load_registry(catalog, settings, false)?;
    let content = fs::read_to_string(events).with_context(|| format!("Failed to read {}", events.display()))?;

    let mut replayer = Replayer::new(&registry, settings);
    let mut messages = Vec::new();

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match parse_envelope(line) {
            Ok(envelope) => envelope,
            Err(e) => bail!("{}:{}: {}", events.display(), index + 1, e),
        };
        messages.extend(replayer.feed(envelope));
    }

    if drain {
        messages.extend(replayer.drain());
    }

    logger::log_event(
        "replay_finished",
        json!({
            "devices": replayer.device_count(),
            "messages": messages.len(),
            "calibration_updates": replayer.persisted_count(),
            "clock_ms": replayer.clock(),
        }),
    );
    info!(
        devices = replayer.device_count(),
        messages = messages.len(),
        "Replay finished"
    );
    Ok(messages)
}

// ============================================================================
// Settings Commands
// ============================================================================

fn cmd_settings(cmd: &SettingsCommands, path: Option<&Path>) -> anyhow::Result<()> {
    match cmd {
        SettingsCommands::Show => {
            let settings = load_settings(path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCommands::Path => match path {
            Some(p) => println!("{}", p.display()),
            None => println!("{}", mc_core::get_settings_path()?.display()),
        },
        SettingsCommands::Init => {
            let settings = load_settings(path)?;
            save_settings(&settings, path)?;
            println!("Settings written");
        }
    }
    Ok(())
}
