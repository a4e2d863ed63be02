// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Expansion of host specifications into logical devices.

use crate::config::{Settings, DEFAULT_PORT};
use crate::error::{self, ErrorKind};

/// Memory on every supported board; used as a hint only.
const TOTAL_MEMORY_HINT: u64 = 8 * 1024 * 1024 * 1024;

/// Device kind tag for this driver family.
const DEVICE_KIND: &str = "sqrl";

/// One logical device. Created by enumeration, immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub unique_id: String,
    pub kind: &'static str,
    pub total_memory: u64,
    pub target_clk: Option<u32>,
}

impl DeviceDescriptor {
    fn new(host: &str, port: u16, index: usize, target_clk: Option<u32>) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: format!("{}:{}", host, port),
            unique_id: format!("{}-{}", DEVICE_KIND, index),
            kind: DEVICE_KIND,
            total_memory: TOTAL_MEMORY_HINT,
            target_clk,
        }
    }
}

/// Expand the configured host specs into logical devices.
///
/// A single spec of the form `host:startPort-endPort` enumerates one device
/// per port; otherwise every entry is `host[:port]` for exactly one device.
pub fn enumerate(settings: &Settings) -> error::Result<Vec<DeviceDescriptor>> {
    if settings.hosts.len() == 1 {
        if let Some((host, start, end)) = parse_port_range(&settings.hosts[0])? {
            return Ok((start..=end)
                .enumerate()
                .map(|(i, port)| DeviceDescriptor::new(&host, port, i, settings.target_clk))
                .collect());
        }
    }

    settings
        .hosts
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let (host, port) = parse_host_port(spec)?;
            Ok(DeviceDescriptor::new(&host, port, i, settings.target_clk))
        })
        .collect()
}

/// Recognize `host:start-end`; `Ok(None)` when the spec has no port range.
fn parse_port_range(spec: &str) -> error::Result<Option<(String, u16, u16)>> {
    let (host, ports) = match spec.rfind(':') {
        Some(pos) => (&spec[..pos], &spec[pos + 1..]),
        None => return Ok(None),
    };
    let mut bounds = ports.splitn(2, '-');
    let start = bounds.next().unwrap_or("");
    let end = match bounds.next() {
        Some(end) => end,
        None => return Ok(None),
    };
    let start: u16 = parse_port(start, spec)?;
    let end: u16 = parse_port(end, spec)?;
    if end < start {
        Err(ErrorKind::Config(format!("empty port range in '{}'", spec)))?
    }
    Ok(Some((host.to_string(), start, end)))
}

fn parse_host_port(spec: &str) -> error::Result<(String, u16)> {
    match spec.rfind(':') {
        Some(pos) => Ok((spec[..pos].to_string(), parse_port(&spec[pos + 1..], spec)?)),
        None => Ok((spec.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str, spec: &str) -> error::Result<u16> {
    port.parse()
        .map_err(|_| ErrorKind::Config(format!("bad port in host spec '{}'", spec)).into())
}
