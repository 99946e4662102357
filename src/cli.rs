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

//! Command Line Interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mc_core::Chemistry;

#[derive(Parser, Debug)]
#[command(name = "meshcap")]
#[command(version)]
#[command(about = "Meshcap - runtime protocol adaptation for mesh devices")]
#[command(long_about = "Meshcap - runtime protocol adaptation for mesh devices

Operator tooling for profile catalogs, vendor datapoint frames, battery
estimation and offline replay of captured stack event logs.

EXAMPLES:
    meshcap compile profiles.json              Compile and list collisions
    meshcap resolve profiles.json _TZE200_abc TS0601
    meshcap decode 0001 0402000400000262        Decode a vendor frame
    meshcap estimate --chemistry CR2032 --voltage 2.85
    meshcap replay profiles.json capture.jsonl --events-out out.jsonl
    meshcap settings show                      Show effective settings as JSON

ENVIRONMENT VARIABLES:
    RUST_LOG=debug          Enable debug logging
    MESHCAP_CONFIG_DIR      Override the configuration directory

FILES:
    ~/.config/meshcap/settings.json      Core settings
    ~/.config/meshcap/calibration/       Learned battery curves")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Core settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a catalog and print every collision decision
    Compile {
        catalog: PathBuf,
        /// Treat equal-rank collisions as fatal
        #[arg(long)]
        strict: bool,
    },

    /// Print the profile a device identity resolves to
    Resolve {
        catalog: PathBuf,
        vendor: String,
        model: String,
    },

    /// Decode a vendor datapoint frame given as hex
    Decode {
        /// Frame bytes, e.g. 000104020004 00000262 (spaces allowed)
        #[arg(num_args = 1.., required = true)]
        hex: Vec<String>,
    },

    /// Run the power estimation cascade once
    Estimate {
        #[arg(long, default_value = "unknown")]
        chemistry: Chemistry,
        /// Battery voltage in volts
        #[arg(long)]
        voltage: Option<f64>,
        /// Load current in milliamps
        #[arg(long)]
        current: Option<f64>,
        /// Device-reported raw battery reading
        #[arg(long)]
        raw: Option<f64>,
    },

    /// Drive device sessions over a captured event log
    Replay {
        catalog: PathBuf,
        /// JSON lines, one stack envelope per line
        events: PathBuf,
        /// Also record every host message to this JSON-lines file
        #[arg(long)]
        events_out: Option<PathBuf>,
        /// Keep firing timers after the last event until none remain
        #[arg(long)]
        drain: bool,
    },

    /// Settings management
    #[command(subcommand, about = "View core settings")]
    Settings(SettingsCommands),
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Show effective settings as JSON
    Show,
    /// Show the settings file path
    Path,
    /// Write the effective settings back to disk (creates the file)
    Init,
}
