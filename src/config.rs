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

//! This module handles miner configuration and configuration file parsing

use crate::error::{self, ErrorKind};

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sqrlminer.toml";

/// Default TCP port of the board bridge
pub const DEFAULT_PORT: u16 = 2000;

/// Default per-call AXI timeout
pub const DEFAULT_AXI_TIMEOUT_MS: u64 = 2000;

/// Default interrupt-wait granularity in microseconds
pub const DEFAULT_WORK_DELAY_US: u64 = 100_000;

/// Number of DAG mixers baked into the current bitstream
pub const DEFAULT_DAG_MIXERS: u32 = 8;

/// Largest duty divisor encodable in the 6-bit flags field
const MAX_INTENSITY_D: u8 = 8;

/// Auto-tuner operating mode
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoTuneMode {
    Off,
    Clock,
    Intensity,
}

impl std::str::FromStr for AutoTuneMode {
    type Err = error::Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s {
            "off" => Ok(AutoTuneMode::Off),
            "clock" => Ok(AutoTuneMode::Clock),
            "intensity" => Ok(AutoTuneMode::Intensity),
            other => Err(ErrorKind::Config(format!("unknown auto-tune mode '{}'", other)).into()),
        }
    }
}

/// The hashcore knobs the tuner is allowed to override at runtime.
/// Always read and written as one unit so the search loop sees a
/// consistent triple per work package.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    pub patience: u8,
    pub intensity_n: u8,
    pub intensity_d: u8,
}

/// Resolved settings for the whole run. Immutable after construction with the
/// sole exception of [`Tunables`], which the tuner may replace.
#[derive(Debug)]
pub struct Settings {
    pub hosts: Vec<String>,
    pub axi_timeout_ms: u64,
    pub work_delay_us: u64,
    pub dag_mixers: u32,
    pub force_dag: bool,
    pub skip_dag: bool,
    pub skip_stall_detection: bool,
    pub die_on_error: bool,
    pub show_hbm_stats: bool,
    pub target_clk: Option<u32>,
    pub tune_file: Option<PathBuf>,
    pub auto_tune: AutoTuneMode,
    pub fk_vccint_mv: u32,
    pub jc_vccint_mv: u32,
    tunables: Mutex<Tunables>,
}

impl Settings {
    pub fn tunables(&self) -> Tunables {
        *self.tunables.lock().expect("BUG: tunables lock poisoned")
    }

    pub fn set_tunables(&self, tunables: Tunables) {
        *self.tunables.lock().expect("BUG: tunables lock poisoned") = tunables;
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Configuration {
    hosts: Option<Vec<String>>,
    axi_timeout_ms: Option<u64>,
    work_delay: Option<u64>,
    patience: Option<u8>,
    intensity_n: Option<u8>,
    intensity_d: Option<u8>,
    dag_mixers: Option<u32>,
    force_dag: Option<bool>,
    skip_dag: Option<bool>,
    skip_stall_detection: Option<bool>,
    die_on_error: Option<bool>,
    show_hbm_stats: Option<bool>,
    target_clk: Option<u32>,
    tune_file: Option<PathBuf>,
    auto_tune: Option<AutoTuneMode>,
    fk_vccint: Option<u32>,
    jc_vccint: Option<u32>,
}

impl Configuration {
    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("host")
                .long("host")
                .value_name("HOST[:PORT[-ENDPORT]]")
                .help("Board bridge address; a port range enumerates one device per port")
                .required(false)
                .multiple(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("target-clk")
                .long("target-clk")
                .help("Core clock (in MHz) applied after DAG generation")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("fk-vccint")
                .long("fk-vccint")
                .help("FK board VCCINT target (in mV)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("jc-vccint")
                .long("jc-vccint")
                .help("JC board VCCINT target (in mV)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("tune-file")
                .long("tune-file")
                .help("Path of the clock tune file")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("auto-tune")
                .long("auto-tune")
                .help("Auto-tuner mode (off, clock, intensity)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("force-dag")
                .long("force-dag")
                .help("Regenerate the DAG even when the on-device epoch tag matches")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("skip-dag")
                .long("skip-dag")
                .help("Never generate a DAG; assume the on-device copy is usable")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("die-on-error")
                .long("die-on-error")
                .help("Terminate the process on the first transport error")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("show-hbm-stats")
                .long("show-hbm-stats")
                .help("Include HBM stack details in the periodic status line")
                .required(false),
        )
    }

    /// Merge file contents with command line overrides into final `Settings`
    pub fn resolve(self, matches: &clap::ArgMatches) -> error::Result<Settings> {
        let mut hosts = self.hosts.unwrap_or_default();
        if let Some(cli_hosts) = matches.values_of("host") {
            hosts = cli_hosts.map(|h| h.to_string()).collect();
        }
        if hosts.is_empty() {
            Err(ErrorKind::Config("no hosts specified".to_string()))?
        }

        let mut target_clk = self.target_clk;
        if let Some(value) = matches.value_of("target-clk") {
            target_clk = Some(parse_number(value, "target-clk")?);
        }
        let mut fk_vccint = self.fk_vccint.unwrap_or(0);
        if let Some(value) = matches.value_of("fk-vccint") {
            fk_vccint = parse_number(value, "fk-vccint")?;
        }
        let mut jc_vccint = self.jc_vccint.unwrap_or(0);
        if let Some(value) = matches.value_of("jc-vccint") {
            jc_vccint = parse_number(value, "jc-vccint")?;
        }
        let mut tune_file = self.tune_file;
        if let Some(value) = matches.value_of("tune-file") {
            tune_file = Some(PathBuf::from(value));
        }
        let mut auto_tune = self.auto_tune.unwrap_or(AutoTuneMode::Off);
        if let Some(value) = matches.value_of("auto-tune") {
            auto_tune = value.parse()?;
        }

        let intensity_d = self.intensity_d.unwrap_or(1);
        if intensity_d > MAX_INTENSITY_D {
            Err(ErrorKind::Config(format!(
                "intensity-d {} out of range 1..={}",
                intensity_d, MAX_INTENSITY_D
            )))?
        }

        Ok(Settings {
            hosts,
            axi_timeout_ms: self.axi_timeout_ms.unwrap_or(DEFAULT_AXI_TIMEOUT_MS),
            work_delay_us: self.work_delay.unwrap_or(DEFAULT_WORK_DELAY_US),
            dag_mixers: self.dag_mixers.unwrap_or(DEFAULT_DAG_MIXERS),
            force_dag: self.force_dag.unwrap_or(false) || matches.is_present("force-dag"),
            skip_dag: self.skip_dag.unwrap_or(false) || matches.is_present("skip-dag"),
            skip_stall_detection: self.skip_stall_detection.unwrap_or(false),
            die_on_error: self.die_on_error.unwrap_or(false) || matches.is_present("die-on-error"),
            show_hbm_stats: self.show_hbm_stats.unwrap_or(false)
                || matches.is_present("show-hbm-stats"),
            target_clk,
            tune_file,
            auto_tune,
            fk_vccint_mv: fk_vccint,
            jc_vccint_mv: jc_vccint,
            tunables: Mutex::new(Tunables {
                patience: self.patience.unwrap_or(0),
                intensity_n: self.intensity_n.unwrap_or(0),
                intensity_d,
            }),
        })
    }

    pub fn parse_file(path: &str) -> error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| ErrorKind::Config(format!("{}: {}", path, e)).into())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> error::Result<T> {
    value
        .parse()
        .map_err(|_| ErrorKind::Config(format!("{} is not a number: '{}'", what, value)).into())
}

#[cfg(test)]
mod test {
    use super::*;

    fn resolve(config: Configuration) -> error::Result<Settings> {
        let app = Configuration::add_args(clap::App::new("test"));
        config.resolve(&app.get_matches_from(vec!["test"]))
    }

    #[test]
    fn test_defaults() {
        let config: Configuration = toml::from_str("hosts = [\"board0\"]").unwrap();
        let settings = resolve(config).unwrap();
        assert_eq!(settings.axi_timeout_ms, DEFAULT_AXI_TIMEOUT_MS);
        assert_eq!(settings.work_delay_us, DEFAULT_WORK_DELAY_US);
        assert_eq!(settings.dag_mixers, DEFAULT_DAG_MIXERS);
        assert_eq!(settings.auto_tune, AutoTuneMode::Off);
        assert_eq!(
            settings.tunables(),
            Tunables {
                patience: 0,
                intensity_n: 0,
                intensity_d: 1
            }
        );
    }

    #[test]
    fn test_no_hosts_rejected() {
        assert!(resolve(Configuration::default()).is_err());
    }

    #[test]
    fn test_file_surface() {
        let config: Configuration = toml::from_str(
            r#"
            hosts = ["board0:2000-2003"]
            axi-timeout-ms = 500
            work-delay = 50000
            patience = 4
            intensity-n = 64
            intensity-d = 8
            force-dag = true
            show-hbm-stats = true
            target-clk = 550
            fk-vccint = 850
            auto-tune = "clock"
            "#,
        )
        .unwrap();
        let settings = resolve(config).unwrap();
        assert_eq!(settings.axi_timeout_ms, 500);
        assert!(settings.force_dag);
        assert!(settings.show_hbm_stats);
        assert_eq!(settings.target_clk, Some(550));
        assert_eq!(settings.fk_vccint_mv, 850);
        assert_eq!(settings.auto_tune, AutoTuneMode::Clock);
        assert_eq!(settings.tunables().intensity_n, 64);
    }

    #[test]
    fn test_intensity_d_range() {
        let config: Configuration =
            toml::from_str("hosts = [\"b\"]\nintensity-d = 9").unwrap();
        assert!(resolve(config).is_err());
    }

    #[test]
    fn test_tunables_override() {
        let config: Configuration = toml::from_str("hosts = [\"b\"]").unwrap();
        let settings = resolve(config).unwrap();
        let tuned = Tunables {
            patience: 2,
            intensity_n: 32,
            intensity_d: 4,
        };
        settings.set_tunables(tuned);
        assert_eq!(settings.tunables(), tuned);
    }
}
