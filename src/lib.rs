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

//! Control-plane driver for Ethash mining on SQRL FPGA boards.
//!
//! `Miner` is the per-device state machine: it owns the connected AXI
//! transport, stages the DAG for the current epoch, programs work into the
//! hashcore, harvests candidate nonces and keeps the clock, voltage and
//! thermal state of the board in hand. One mining thread runs the work loop;
//! a telemetry caller and the farm dispatcher poke the same `Miner` from
//! their own threads.

pub mod axi;
pub mod clock;
pub mod config;
pub mod dag;
pub mod error;
pub mod power;
pub mod regs;
pub mod registry;
pub mod search;
pub mod stats;
pub mod telemetry;
pub mod tuner;
pub mod utils;
pub mod work;

#[cfg(test)]
pub mod test_utils;

use log::*;

use crate::axi::Bus;
use crate::config::Settings;
use crate::error::ErrorKind;
use crate::registry::DeviceDescriptor;
use crate::utils::PackedRegister;
use crate::work::{EpochProvider, SolutionSink, WorkPackage};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// How long the idle work loop sleeps before re-checking for work.
const IDLE_WAIT: Duration = Duration::from_secs(3);

/// Soft hashcore stop ramps the intensity down in this many equal steps.
const RAMP_STEPS: u32 = 8;
/// Pause between ramp steps.
const RAMP_STEP_DELAY: Duration = Duration::from_millis(10);

/// Why the search loop returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchExit {
    /// A fresh work package (or a kick) arrived.
    NewWork,
    /// Shutdown was requested.
    Stopped,
    /// The stall counter stopped moving; the core needs a reset.
    Stalled,
}

/// Stall and target-check history carried between search polls.
#[derive(Debug, Default)]
pub(crate) struct SearchCounters {
    pub last_stall: Option<u32>,
    pub last_tchecks: u64,
}

/// Per-device driver state machine.
///
/// All register traffic is serialized by `axi_lock`; the interrupt wait and
/// kick deliberately bypass it so that telemetry and new-work kicks can
/// interleave with a search in flight (the transport keeps a dedicated
/// channel for them).
pub struct Miner<B: Bus> {
    descriptor: DeviceDescriptor,
    bus: B,
    axi_lock: Mutex<()>,
    settings: Arc<Settings>,
    tuner: Arc<dyn tuner::Tuner>,
    sink: Arc<dyn SolutionSink>,
    index: usize,
    setting_id: String,
    /// Last successfully programmed core clock in MHz; 0 until known
    last_clk: AtomicU64,
    /// True while the epoch initializer holds the core, or after a safety
    /// shutdown latched the device off
    dagging: AtomicBool,
    new_work: AtomicBool,
    stop: AtomicBool,
    /// Epoch whose DAG is staged on the device; -1 before the first init
    current_epoch: AtomicI64,
    work_slot: Mutex<Option<WorkPackage>>,
    work_signal: Condvar,
    pub(crate) meter: Mutex<stats::HashRateMeter>,
    pub(crate) counters: Mutex<SearchCounters>,
    hwmon: Mutex<Option<telemetry::Telemetry>>,
}

impl<B: Bus> Miner<B> {
    /// Take ownership of a connected transport and identify the device.
    /// Fails when no Ethash bitstream is present.
    pub fn new(
        bus: B,
        descriptor: DeviceDescriptor,
        index: usize,
        settings: Arc<Settings>,
        tuner: Arc<dyn tuner::Tuner>,
        sink: Arc<dyn SolutionSink>,
    ) -> error::Result<Self> {
        bus.set_timeout(Duration::from_millis(settings.axi_timeout_ms));

        let magic = bus.read(regs::DEVICE_MAGIC)?;
        if magic == 0 || magic == 0xffff_ffff {
            Err(ErrorKind::Device(
                descriptor.name.clone(),
                "no bitstream found".to_string(),
            ))?
        }
        let bitstream = bus.read(regs::BITSTREAM_VERSION)?;
        let dna = [
            bus.read(regs::DNA_LO)?,
            bus.read(regs::DNA_MID)?,
            bus.read(regs::DNA_HI)?,
        ];
        let setting_id = tuner::setting_id(
            dna,
            bitstream,
            settings.fk_vccint_mv,
            settings.jc_vccint_mv,
        );
        info!(
            "{}: device {:#010x}, bitstream {:#010x}, settings ID {}",
            descriptor.name, magic, bitstream, setting_id
        );

        Ok(Self {
            descriptor,
            bus,
            axi_lock: Mutex::new(()),
            settings,
            tuner,
            sink,
            index,
            setting_id,
            last_clk: AtomicU64::new(0),
            dagging: AtomicBool::new(false),
            new_work: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            current_epoch: AtomicI64::new(-1),
            work_slot: Mutex::new(None),
            work_signal: Condvar::new(),
            meter: Mutex::new(stats::HashRateMeter::new()),
            counters: Mutex::new(SearchCounters::default()),
            hwmon: Mutex::new(None),
        })
    }

    /// Program the configured voltage targets and learn the current clock.
    pub fn init(&self) -> error::Result<()> {
        let _axi = self.lock_axi();
        power::set_voltage(
            &self.bus,
            self.settings.fk_vccint_mv,
            self.settings.jc_vccint_mv,
        )?;
        let clk = clock::get_clock(&self.bus)?;
        self.last_clk.store(clk as u64, Ordering::Relaxed);
        info!("{}: core clock currently {} MHz", self.descriptor.name, clk);
        Ok(())
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn setting_id(&self) -> &str {
        &self.setting_id
    }

    pub fn last_clk(&self) -> u64 {
        self.last_clk.load(Ordering::Relaxed)
    }

    pub fn averages(&self) -> [f64; 4] {
        self.meter
            .lock()
            .expect("BUG: meter lock poisoned")
            .averages(self.tuner.error_rate())
    }

    /// Last telemetry snapshot, if any was taken yet.
    pub fn hwmon(&self) -> Option<telemetry::Telemetry> {
        self.hwmon
            .lock()
            .expect("BUG: hwmon lock poisoned")
            .clone()
    }

    pub(crate) fn store_hwmon(&self, snapshot: telemetry::Telemetry) {
        *self.hwmon.lock().expect("BUG: hwmon lock poisoned") = Some(snapshot);
    }

    pub(crate) fn lock_axi(&self) -> MutexGuard<'_, ()> {
        self.axi_lock.lock().expect("BUG: AXI lock poisoned")
    }

    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }

    pub(crate) fn tuner(&self) -> &dyn tuner::Tuner {
        &*self.tuner
    }

    pub(crate) fn sink(&self) -> &dyn SolutionSink {
        &*self.sink
    }

    pub(crate) fn miner_index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_dagging(&self) -> bool {
        self.dagging.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dagging(&self, value: bool) {
        self.dagging.store(value, Ordering::Relaxed)
    }

    pub(crate) fn take_new_work_flag(&self) {
        self.new_work.store(false, Ordering::Relaxed)
    }

    pub(crate) fn new_work_pending(&self) -> bool {
        self.new_work.load(Ordering::Relaxed)
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Ask the work loop to wind down and wake whatever is blocking.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.kick_miner();
    }

    /// Hand a new work package to the mining thread.
    pub fn assign_work(&self, work: WorkPackage) {
        {
            let mut slot = self.work_slot.lock().expect("BUG: work slot poisoned");
            *slot = Some(work);
        }
        self.kick_miner();
    }

    /// Interrupt both the idle wait and an in-flight search.
    ///
    /// Takes no AXI lock on purpose: the search thread may be holding it, and
    /// the interrupt kick travels on the transport's own channel.
    pub fn kick_miner(&self) {
        self.new_work.store(true, Ordering::Relaxed);
        if !self.is_dagging() {
            if let Err(e) = self.bus.kick_interrupts() {
                warn!("{}: interrupt kick failed: {}", self.descriptor.name, e);
            }
        }
        self.work_signal.notify_all();
    }

    /// The mining thread's work loop: pull work, stage the epoch when it
    /// changes, then search until something interrupts it.
    pub fn run(&self, epochs: &dyn EpochProvider) -> error::Result<()> {
        info!("{}: work loop starting", self.descriptor.name);
        let result = self.work_loop(epochs);
        if let Err(ref e) = result {
            error!("{}: work loop failed: {}", self.descriptor.name, e);
            if self.settings.die_on_error {
                std::process::exit(1);
            }
        }
        info!("{}: work loop finished", self.descriptor.name);
        result
    }

    fn work_loop(&self, epochs: &dyn EpochProvider) -> error::Result<()> {
        loop {
            if self.should_stop() {
                return Ok(());
            }
            let work = match self.next_work() {
                Some(work) => work,
                None => continue,
            };
            if self.is_dagging() {
                // only the safety interlock leaves this set between packages
                warn!(
                    "{}: safety shutdown latched, refusing work",
                    self.descriptor.name
                );
                continue;
            }
            if work.algorithm != work::ALGORITHM_ETHASH {
                Err(ErrorKind::Config(format!(
                    "unsupported algorithm '{}'",
                    work.algorithm
                )))?
            }

            if self.current_epoch.load(Ordering::Relaxed) != work.epoch as i64 {
                let context = epochs.epoch_context(work.epoch)?;
                self.init_epoch(&context)?;
                self.current_epoch.store(work.epoch as i64, Ordering::Relaxed);
            }

            match self.search(&work)? {
                SearchExit::Stalled => {
                    warn!(
                        "{}: hashcore stalled, scheduling re-initialization",
                        self.descriptor.name
                    );
                    self.current_epoch.store(-1, Ordering::Relaxed);
                }
                SearchExit::NewWork | SearchExit::Stopped => {}
            }
        }
    }

    /// Take the pending work package, waiting up to `IDLE_WAIT` for one.
    fn next_work(&self) -> Option<WorkPackage> {
        let mut slot = self.work_slot.lock().expect("BUG: work slot poisoned");
        if let Some(work) = slot.take() {
            return Some(work);
        }
        let (mut slot, _) = self
            .work_signal
            .wait_timeout(slot, IDLE_WAIT)
            .expect("BUG: work slot poisoned");
        slot.take()
    }

    /// Reprogram the core clock, remembering the frequency on success.
    /// Takes the AXI lock itself.
    pub fn set_clock(&self, target: clock::Target) -> error::Result<f64> {
        let _axi = self.lock_axi();
        let clk = clock::set_clock(&self.bus, target)?;
        if let clock::Target::Mhz(_) = target {
            self.last_clk.store(clk as u64, Ordering::Relaxed);
            info!("{}: core clock set to {} MHz", self.descriptor.name, clk);
        }
        Ok(clk)
    }

    /// Bring the clock back after DAG work: the configured target if there is
    /// one, otherwise whatever was programmed before. A relock failure is not
    /// fatal; the miner continues on the previous clock.
    pub(crate) fn restore_mining_clock(&self) {
        let target = self
            .descriptor
            .target_clk
            .unwrap_or(self.last_clk() as u32);
        if target == 0 {
            return;
        }
        if let Err(e) = self.set_clock(clock::Target::Mhz(target)) {
            warn!(
                "{}: restoring {} MHz failed: {}",
                self.descriptor.name, target, e
            );
        }
    }

    /// Stop the hashcore. The soft variant ramps the intensity down first so
    /// in-flight pipeline state drains before the reset. Caller holds the AXI
    /// lock; transport failures degrade to a hard reset.
    pub(crate) fn stop_hashcore_locked(&self, soft: bool) {
        if soft {
            match self.bus.read(regs::CORE_FLAGS) {
                Ok(reg) => {
                    let flags = regs::CoreFlags::from_reg(reg)
                        .expect("BUG: flags word unpack cannot fail");
                    let intensity = flags.intensity_n as u32;
                    for step in (0..RAMP_STEPS).rev() {
                        let ramped = flags.with_intensity((intensity * step / RAMP_STEPS) as u8);
                        self.write_or_log(ramped.to_reg(), regs::CORE_FLAGS, false);
                        thread::sleep(RAMP_STEP_DELAY);
                    }
                }
                Err(e) => {
                    warn!(
                        "{}: intensity readback failed ({}), hard reset",
                        self.descriptor.name, e
                    );
                }
            }
        }
        self.write_or_log(regs::CORE_RESET, regs::CORE_CTRL, true);
    }

    /// Read a register under the standing error policy: log, substitute zero,
    /// die when configured to.
    pub(crate) fn read_or_zero(&self, addr: u32) -> u32 {
        match self.bus.read(addr) {
            Ok(value) => value,
            Err(e) => {
                self.transport_fault(&format!("read {:#06x}", addr), &e);
                0
            }
        }
    }

    /// Write a register under the standing error policy.
    pub(crate) fn write_or_log(&self, value: u32, addr: u32, wait: bool) {
        if let Err(e) = self.bus.write(value, addr, wait) {
            self.transport_fault(&format!("write {:#06x}", addr), &e);
        }
    }

    pub(crate) fn transport_fault(&self, what: &str, e: &error::Error) {
        error!("{}: {}: {}", self.descriptor.name, what, e);
        if self.settings.die_on_error {
            std::process::exit(1);
        }
    }
}
