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

//! Bring-up front end for the SQRL Ethash driver.
//!
//! Enumerates the configured boards, stages a DAG and drives them with
//! self-generated benchmark work. The farm dispatcher that normally feeds
//! `Miner` lives outside this crate; this binary stands in for it during
//! board bring-up, the way the hashboard test tools do for other drivers.

use log::*;

use sqrlminer::axi;
use sqrlminer::config::{Configuration, DEFAULT_CONFIG_PATH};
use sqrlminer::error::{self, ErrorKind};
use sqrlminer::registry;
use sqrlminer::work::{EpochContext, EpochProvider, Solution, SolutionSink, WorkPackage};
use sqrlminer::Miner;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often benchmark work is refreshed.
const BENCH_WORK_PERIOD: Duration = Duration::from_secs(10);

/// How often the status line is printed.
const STATUS_PERIOD: Duration = Duration::from_secs(5);

/// Ethash size schedule constants.
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const MIX_BYTES: u64 = 128;
const HASH_BYTES: u64 = 64;

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

fn dag_size(epoch: u64) -> u64 {
    let mut size = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES;
    while !is_prime(size / MIX_BYTES) {
        size -= 2 * MIX_BYTES;
    }
    size
}

fn cache_size(epoch: u64) -> u64 {
    let mut size = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES;
    while !is_prime(size / HASH_BYTES) {
        size -= 2 * HASH_BYTES;
    }
    size
}

/// Epoch provider with a caller-supplied seed. Sufficient for bring-up: the
/// board builds a well-formed DAG, it just will not match mainnet unless the
/// real epoch seed is passed in.
struct FixedSeedEpochs {
    seed: [u8; 32],
}

impl EpochProvider for FixedSeedEpochs {
    fn epoch_context(&self, epoch: u32) -> error::Result<EpochContext> {
        Ok(EpochContext {
            number: epoch,
            seed: self.seed,
            light_size: cache_size(epoch as u64),
            dag_size: dag_size(epoch as u64),
        })
    }
}

/// Farm stand-in that just logs whatever the boards find.
struct LoggingSink;

impl SolutionSink for LoggingSink {
    fn submit(&self, solution: Solution) {
        info!(
            "miner {}: nonce {:#018x} for epoch {} at {}",
            solution.miner_index, solution.nonce, solution.work.epoch, solution.when
        );
    }
}

fn benchmark_package(epoch: u32, round: u64) -> WorkPackage {
    let mut header = [0u8; 32];
    header[..8].copy_from_slice(&round.to_be_bytes());
    let mut boundary = [0xffu8; 32];
    boundary[..3].copy_from_slice(&[0, 0, 0]);
    WorkPackage {
        algorithm: "ethash".to_string(),
        epoch,
        header,
        boundary,
        start_nonce: round << 32,
    }
}

fn parse_seed(hex_seed: &str) -> error::Result<[u8; 32]> {
    let bytes = hex::decode(hex_seed)
        .map_err(|e| ErrorKind::Config(format!("bad seed hex: {}", e)))?;
    if bytes.len() != 32 {
        Err(ErrorKind::Config(format!(
            "seed must be 32 bytes, got {}",
            bytes.len()
        )))?
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes);
    Ok(seed)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app = Configuration::add_args(
        clap::App::new("sqrlminer")
            .version(env!("CARGO_PKG_VERSION"))
            .arg(
                clap::Arg::with_name("config")
                    .long("config")
                    .help("Set config file path")
                    .required(false)
                    .takes_value(true),
            )
            .arg(
                clap::Arg::with_name("benchmark")
                    .long("benchmark")
                    .value_name("EPOCH")
                    .help("Epoch to stage for benchmark work")
                    .required(false)
                    .takes_value(true),
            )
            .arg(
                clap::Arg::with_name("seed")
                    .long("seed")
                    .value_name("HEX32")
                    .help("Epoch seed for the on-device DAG build (32 bytes hex)")
                    .required(false)
                    .takes_value(true),
            ),
    );
    let matches = app.get_matches();

    let configuration = match matches.value_of("config") {
        Some(path) => Configuration::parse_file(path).expect("cannot read config file"),
        None => Configuration::parse_file(DEFAULT_CONFIG_PATH).unwrap_or_default(),
    };
    let settings = Arc::new(
        configuration
            .resolve(&matches)
            .expect("invalid configuration"),
    );

    let epoch: u32 = matches
        .value_of("benchmark")
        .unwrap_or("0")
        .parse()
        .expect("benchmark epoch is not a number");
    let seed = match matches.value_of("seed") {
        Some(hex_seed) => parse_seed(hex_seed).expect("invalid seed"),
        None => [0u8; 32],
    };

    let devices = registry::enumerate(&settings).expect("invalid host specification");
    info!("enumerated {} device(s)", devices.len());

    let sink = Arc::new(LoggingSink);
    let tuner = Arc::new(sqrlminer::tuner::NoTuner);
    let mut miners = Vec::new();
    for (index, descriptor) in devices.into_iter().enumerate() {
        let bus = axi::Tcp::connect(
            &descriptor.host,
            descriptor.port,
            Duration::from_millis(settings.axi_timeout_ms),
        )
        .expect("cannot connect to board");
        let miner = Miner::new(
            bus,
            descriptor,
            index,
            settings.clone(),
            tuner.clone() as Arc<dyn sqrlminer::tuner::Tuner>,
            sink.clone() as Arc<dyn SolutionSink>,
        )
        .expect("device identification failed");
        miner.init().expect("device initialization failed");
        miners.push(Arc::new(miner));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let miners = miners.clone();
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            warn!("shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
            for miner in miners.iter() {
                miner.request_stop();
            }
        })
        .expect("cannot install shutdown handler");
    }

    // benchmark work generator, standing in for the farm dispatcher
    let round = Arc::new(AtomicU64::new(0));
    let generator = {
        let miners = miners.clone();
        let shutdown = shutdown.clone();
        let round = round.clone();
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let package = benchmark_package(epoch, round.fetch_add(1, Ordering::Relaxed));
                for miner in miners.iter() {
                    miner.assign_work(package.clone());
                }
                thread::sleep(BENCH_WORK_PERIOD);
            }
        })
    };

    // telemetry caller
    let telemetry = {
        let miners = miners.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(STATUS_PERIOD);
                for miner in miners.iter() {
                    let snapshot = miner.telemetry();
                    let avg = miner.averages();
                    info!(
                        "{}: {} | {:.1}/{:.1}/{:.1} MH/s, err {:.2} %",
                        miner.descriptor().name,
                        snapshot,
                        avg[0],
                        avg[1],
                        avg[2],
                        avg[3]
                    );
                    if miner.settings().show_hbm_stats {
                        info!("{}: {}", miner.descriptor().name, snapshot.hbm_summary());
                    }
                }
            }
        })
    };

    let epochs = FixedSeedEpochs { seed };
    let mut workers = Vec::new();
    for miner in miners.iter() {
        let miner = miner.clone();
        let epochs = FixedSeedEpochs { seed: epochs.seed };
        workers.push(thread::spawn(move || {
            let _ = miner.run(&epochs);
        }));
    }

    for worker in workers {
        let _ = worker.join();
    }
    shutdown.store(true, Ordering::Relaxed);
    let _ = generator.join();
    let _ = telemetry.join();
    info!("all miners stopped");
}
