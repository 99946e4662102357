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

//! Meshcap - operator tooling for the mesh device adaptation layer
//! 
//! Catalog compilation reports, vendor frame decoding, one-shot battery
//! estimation and offline replay of captured stack event logs. The device
//! logic itself lives in `mc-core`; the long-running host is `meshcapd`.

pub mod cli;
pub mod commands;
pub mod logger;
