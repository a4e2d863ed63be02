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

//! The search loop: one work package in, candidate nonces out.
//!
//! The hashcore is programmed, started in interrupt mode, and then polled:
//! each pass waits for a nonce interrupt (or its timeout), samples the
//! target-check and stall counters, forwards any candidate to the farm and
//! feeds the hash-rate meter and the tuner. The AXI lock is dropped for the
//! duration of every interrupt wait.

use log::*;

use crate::axi::{Bus, IrqWait};
use crate::regs;
use crate::utils::PackedRegister;
use crate::work::{Solution, WorkPackage};
use crate::{error, Miner, SearchExit};

use std::time::{Duration, Instant};

/// Smallest boundary the hashcore is given. A pool boundary below this floor
/// is quietly raised to it: the core then reports some nonces above the pool
/// target, which the farm side filters, but it never starves the interrupt
/// path of traffic.
const BOUNDARY_FLOOR: [u8; 32] = [
    0x00, 0x00, 0x00, 0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff,
];

/// The boundary actually programmed: the numeric maximum (big-endian) of the
/// pool boundary and the floor.
fn false_target(boundary: &[u8; 32]) -> [u8; 32] {
    if boundary[..] > BOUNDARY_FLOOR[..] {
        *boundary
    } else {
        BOUNDARY_FLOOR
    }
}

/// Reassemble the 64-bit target-check counter from its halves. The hardware
/// value is monotonic but the two words are read separately, so a low-word
/// rollover shows up as a decrease; bump the high half when that happens.
fn reconstruct_checks(last: u64, hi: u32, lo: u32) -> u64 {
    let mut value = (hi as u64) << 32 | lo as u64;
    if value < last {
        value += 1 << 32;
    }
    value
}

impl<B: Bus> Miner<B> {
    /// Run one work package until new work, shutdown or a stall ends it.
    pub fn search(&self, work: &WorkPackage) -> error::Result<SearchExit> {
        if self.is_dagging() {
            // the initializer owns the mining registers right now
            return Ok(SearchExit::Stopped);
        }
        let mut axi = self.lock_axi();
        self.take_new_work_flag();

        self.bus().bulk_write(&work.header, regs::HEADER, true)?;
        let target = false_target(&work.boundary);
        self.bus().bulk_write(&target, regs::BOUNDARY, true)?;
        self.bus()
            .write((work.start_nonce >> 32) as u32, regs::NONCE_HI, false)?;
        self.bus()
            .write(work.start_nonce as u32, regs::NONCE_LO, false)?;

        if let Some(tuned) = self.tuner().intensity() {
            self.settings().set_tunables(tuned);
        }
        let tunables = self.settings().tunables();
        let flags =
            regs::CoreFlags::new(tunables.intensity_n, tunables.intensity_d, tunables.patience);
        self.bus().write(flags.to_reg(), regs::CORE_FLAGS, false)?;

        // program first, then start, then arm the interrupt path
        self.bus().write(regs::CORE_START_IRQ, regs::CORE_CTRL, true)?;
        self.bus().enable_interrupts(regs::IRQ_NONCE)?;

        {
            let mut counters = self.counters.lock().expect("BUG: counters lock poisoned");
            // the core was just reset, stall history does not carry over
            counters.last_stall = None;
        }

        let timeout = Duration::from_millis((self.settings().work_delay_us / 1000).max(1));
        let exit = loop {
            if self.new_work_pending() {
                break SearchExit::NewWork;
            }
            if self.should_stop() {
                break SearchExit::Stopped;
            }

            drop(axi);
            let wait = self.bus().wait_for_interrupt(regs::IRQ_NONCE, timeout);
            axi = self.lock_axi();

            let candidate = match wait {
                Ok(IrqWait::Nonce(nonce)) => Some(nonce),
                Ok(IrqWait::TimedOut) => None,
                Err(e) => {
                    self.transport_fault("interrupt wait", &e);
                    None
                }
            };

            let stall = if self.settings().skip_stall_detection {
                None
            } else {
                Some(self.read_or_zero(regs::STALL_CNT))
            };
            let lo = self.read_or_zero(regs::TCHECK_LO);
            let hi = self.read_or_zero(regs::TCHECK_HI);

            let (delta, stalled) = {
                let mut counters = self.counters.lock().expect("BUG: counters lock poisoned");
                let checks = reconstruct_checks(counters.last_tchecks, hi, lo);
                let delta = checks - counters.last_tchecks;
                counters.last_tchecks = checks;

                let stalled = match stall {
                    Some(count) => {
                        let repeat = counters.last_stall == Some(count);
                        counters.last_stall = Some(count);
                        repeat
                    }
                    None => false,
                };
                (delta, stalled)
            };

            if let Some(nonce) = candidate {
                debug!("{}: candidate nonce {:#018x}", self.descriptor().name, nonce);
                self.sink()
                    .submit(Solution::new(nonce, work.clone(), self.miner_index()));
            }

            self.meter
                .lock()
                .expect("BUG: meter lock poisoned")
                .insert(delta, Instant::now());
            self.tuner().tune(delta);

            if stalled {
                break SearchExit::Stalled;
            }
        };

        if exit == SearchExit::Stalled {
            warn!("{}: stall counter stopped moving", self.descriptor().name);
        }
        self.stop_hashcore_locked(true);
        drop(axi);
        Ok(exit)
    }
}
