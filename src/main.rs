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

use clap::Parser;

use meshcap::cli::Cli;
use meshcap::commands::run_cli;

fn main() {
    // Diagnostics only when asked for; stdout carries command output
    if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let cli = Cli::parse();

    if let Err(e) = run_cli(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
