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

//! `FakeBus` is an AXI transport backed by a register map.
//!
//! Reads serve preset values (optionally as a scripted sequence whose last
//! entry sticks, for status-poll loops), writes land in the map and in an
//! ordered log, and interrupt waits replay a scripted outcome list.

use crate::axi::{Bus, IrqWait};
use crate::config::{self, Settings};
use crate::error::{self, ErrorKind};
use crate::registry;
use crate::regs;
use crate::tuner;
use crate::work::{Solution, SolutionSink};
use crate::Miner;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeBus {
    regs: Mutex<HashMap<u32, u32>>,
    read_seq: Mutex<HashMap<u32, VecDeque<u32>>>,
    failing_reads: Mutex<HashSet<u32>>,
    bulk_failures_left: AtomicUsize,
    reads: Mutex<Vec<u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
    bulk: Mutex<Vec<(u32, Vec<u8>, bool)>>,
    cdma: Mutex<Vec<(u64, u64, u64)>>,
    irq_script: Mutex<VecDeque<IrqWait>>,
    irq_masks: Mutex<Vec<u32>>,
    kicks: AtomicUsize,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backing value of one register.
    pub fn preset(&self, addr: u32, value: u32) {
        self.regs.lock().unwrap().insert(addr, value);
    }

    /// Script a sequence of read results for one register. The final entry
    /// keeps being served once the rest is consumed.
    pub fn preset_seq(&self, addr: u32, values: &[u32]) {
        self.read_seq
            .lock()
            .unwrap()
            .insert(addr, values.iter().cloned().collect());
    }

    /// Make every read of `addr` fail with a transport error.
    pub fn fail_reads(&self, addr: u32) {
        self.failing_reads.lock().unwrap().insert(addr);
    }

    /// Make the next `count` bulk writes fail.
    pub fn fail_bulk_writes(&self, count: usize) {
        self.bulk_failures_left.store(count, Ordering::Relaxed);
    }

    /// Script the interrupt-wait outcomes; an exhausted script times out.
    pub fn script_irq(&self, outcomes: &[IrqWait]) {
        *self.irq_script.lock().unwrap() = outcomes.iter().cloned().collect();
    }

    /// Current backing value of one register (0 when never written/preset).
    pub fn value(&self, addr: u32) -> u32 {
        self.regs.lock().unwrap().get(&addr).cloned().unwrap_or(0)
    }

    pub fn reads(&self) -> Vec<u32> {
        self.reads.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().unwrap().clone()
    }

    /// True if any single-word write touched `addr`.
    pub fn wrote(&self, addr: u32) -> bool {
        self.writes.lock().unwrap().iter().any(|&(a, _)| a == addr)
    }

    pub fn bulk_writes(&self) -> Vec<(u32, Vec<u8>, bool)> {
        self.bulk.lock().unwrap().clone()
    }

    pub fn cdma_copies(&self) -> Vec<(u64, u64, u64)> {
        self.cdma.lock().unwrap().clone()
    }

    pub fn irq_masks(&self) -> Vec<u32> {
        self.irq_masks.lock().unwrap().clone()
    }

    pub fn kicks(&self) -> usize {
        self.kicks.load(Ordering::Relaxed)
    }
}

impl Bus for FakeBus {
    fn read(&self, addr: u32) -> error::Result<u32> {
        self.reads.lock().unwrap().push(addr);
        if self.failing_reads.lock().unwrap().contains(&addr) {
            Err(ErrorKind::Axi(format!("scripted read failure at {:#06x}", addr)))?
        }
        if let Some(seq) = self.read_seq.lock().unwrap().get_mut(&addr) {
            if seq.len() > 1 {
                return Ok(seq.pop_front().expect("BUG: scripted sequence empty"));
            }
            if let Some(&last) = seq.front() {
                return Ok(last);
            }
        }
        Ok(self.value(addr))
    }

    fn write(&self, value: u32, addr: u32, _wait: bool) -> error::Result<()> {
        self.writes.lock().unwrap().push((addr, value));
        self.regs.lock().unwrap().insert(addr, value);
        Ok(())
    }

    fn bulk_write(&self, data: &[u8], addr: u32, byte_swap: bool) -> error::Result<()> {
        let left = self.bulk_failures_left.load(Ordering::Relaxed);
        if left > 0 {
            self.bulk_failures_left.store(left - 1, Ordering::Relaxed);
            Err(ErrorKind::Axi("scripted bulk failure".to_string()))?
        }
        self.bulk
            .lock()
            .unwrap()
            .push((addr, data.to_vec(), byte_swap));
        Ok(())
    }

    fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> error::Result<()> {
        self.cdma.lock().unwrap().push((src, dst, len));
        Ok(())
    }

    fn cdma_write(&self, data: &[u8], addr: u64) -> error::Result<()> {
        self.bulk
            .lock()
            .unwrap()
            .push((addr as u32, data.to_vec(), false));
        Ok(())
    }

    fn enable_interrupts(&self, mask: u32) -> error::Result<()> {
        self.irq_masks.lock().unwrap().push(mask);
        Ok(())
    }

    fn wait_for_interrupt(&self, _mask: u32, _timeout: Duration) -> error::Result<IrqWait> {
        Ok(self
            .irq_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(IrqWait::TimedOut))
    }

    fn kick_interrupts(&self) -> error::Result<()> {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_timeout(&self, _timeout: Duration) {}
}

/// Sink collecting every submitted solution.
pub struct CollectingSink {
    pub solutions: Mutex<Vec<Solution>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            solutions: Mutex::new(Vec::new()),
        }
    }
}

impl SolutionSink for CollectingSink {
    fn submit(&self, solution: Solution) {
        self.solutions.lock().unwrap().push(solution);
    }
}

/// Tuner that only remembers whether it was started.
pub struct StartedTuner {
    pub started: AtomicBool,
}

impl StartedTuner {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
        }
    }
}

impl tuner::Tuner for StartedTuner {
    fn start(&self) {
        self.started.store(true, Ordering::Relaxed);
    }
}

pub fn test_settings() -> Arc<Settings> {
    test_settings_from("hosts = [\"board0\"]")
}

pub fn test_settings_from(toml_str: &str) -> Arc<Settings> {
    let config: config::Configuration = toml::from_str(toml_str).expect("config");
    let app = config::Configuration::add_args(clap::App::new("test"));
    Arc::new(
        config
            .resolve(&app.get_matches_from(vec!["test"]))
            .expect("settings"),
    )
}

/// Identification registers every constructed fake device needs.
pub fn seed_identity(bus: &FakeBus) {
    bus.preset(regs::DEVICE_MAGIC, 0x5351_524c);
    bus.preset(regs::BITSTREAM_VERSION, 0xa1);
    bus.preset(regs::DNA_LO, 0x11);
    bus.preset(regs::DNA_MID, 0x22);
    bus.preset(regs::DNA_HI, 0x33);
}

/// PLL registers consistent with a 1200 MHz VCO and a 600 MHz core clock.
pub fn seed_pll(bus: &FakeBus) {
    bus.preset(regs::PLL_VCO, 0x0601);
    bus.preset(regs::PLL_CLK0, 0x2);
    bus.preset(regs::CLK_LOCK, 0x1);
}

pub fn test_miner(bus: FakeBus) -> (Arc<Miner<FakeBus>>, Arc<CollectingSink>, Arc<StartedTuner>) {
    test_miner_with_settings(bus, test_settings())
}

pub fn test_miner_with_settings(
    bus: FakeBus,
    settings: Arc<Settings>,
) -> (Arc<Miner<FakeBus>>, Arc<CollectingSink>, Arc<StartedTuner>) {
    seed_identity(&bus);
    seed_pll(&bus);
    let sink = Arc::new(CollectingSink::new());
    let tuner = Arc::new(StartedTuner::new());
    let descriptor = registry::enumerate(&settings).expect("devices").remove(0);
    let miner = Miner::new(
        bus,
        descriptor,
        0,
        settings,
        tuner.clone() as Arc<dyn tuner::Tuner>,
        sink.clone() as Arc<dyn SolutionSink>,
    )
    .expect("miner");
    (Arc::new(miner), sink, tuner)
}
