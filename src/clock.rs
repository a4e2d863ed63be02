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

//! Core clock control through the PLL reconfiguration registers.
//!
//! A relock clobbers the Ethash item registers and the DAG generator power
//! gate, so any programming call snapshots them up front and restores them
//! after the PLL reports lock. Caller holds the AXI lock for the whole call.

use log::*;

use crate::axi::Bus;
use crate::error::{self, ErrorKind};
use crate::regs;
use crate::utils::{ceil_to_eighth, PackedRegister};

use std::thread;
use std::time::Duration;

/// How many times to poll the lock bit before giving up.
const LOCK_POLL_LIMIT: usize = 1000;

/// Settle time inside the stock-reset sequence.
const STOCK_RESET_DELAY: Duration = Duration::from_millis(10);

/// Output dividers below this would overclock the fabric; refused.
const MIN_DIVIDER: f64 = 2.0;

/// What the caller wants from the clock controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Read-only query of the current core clock.
    Query,
    /// Return to the bitstream's stock clock.
    Stock,
    /// Program the given frequency in MHz.
    Mhz(u32),
}

/// Read-only frequency query.
pub fn get_clock<B: Bus>(bus: &B) -> error::Result<f64> {
    set_clock(bus, Target::Query)
}

/// Reprogram (or query) the core clock; returns the resulting frequency in
/// MHz. For any change the three mining registers a relock clobbers are
/// preserved across the call.
pub fn set_clock<B: Bus>(bus: &B, target: Target) -> error::Result<f64> {
    let vco_reg = decode_vco(bus.read(regs::PLL_VCO)?)?;
    let div_reg = decode_div(bus.read(regs::PLL_CLK0)?)?;
    let vco = vco_reg.vco_mhz();

    if target == Target::Query {
        return Ok((vco / div_reg.divider()).floor());
    }

    // Snapshot what the relock will clobber and keep the DAG generator
    // powered through it.
    let saved_nitems = bus.read(regs::NITEMS)?;
    let saved_rnitems = bus.read(regs::RNITEMS)?;
    let saved_daggen = bus.read(regs::DAGGEN_POWER)?;
    bus.write(0xffff_ffff, regs::DAGGEN_POWER, true)?;

    let programmed = (|| -> error::Result<Option<f64>> {
        match target {
            Target::Mhz(mhz) => {
                let desired_div = ceil_to_eighth(vco / (mhz as f64 + 1.0));
                if desired_div < MIN_DIVIDER {
                    Err(ErrorKind::Pll(format!(
                        "target {} MHz needs divider {} below minimum {}",
                        mhz, desired_div, MIN_DIVIDER
                    )))?
                }
                bus.write(vco_reg.to_reg(), regs::PLL_VCO, false)?;
                bus.write(
                    regs::PllClkDiv::from_divider(desired_div).to_reg(),
                    regs::PLL_CLK0,
                    false,
                )?;
                bus.write(0x7, regs::PLL_LOAD, true)?;
                bus.write(0x3, regs::PLL_LOAD, true)?;
                Ok(Some((vco / desired_div).floor()))
            }
            Target::Stock => {
                bus.write(0x5, regs::PLL_LOAD, true)?;
                bus.write(0x1, regs::PLL_LOAD, true)?;
                thread::sleep(STOCK_RESET_DELAY);
                bus.write(0xa, regs::CLK_RESET, true)?;
                Ok(None)
            }
            Target::Query => unreachable!("query handled above"),
        }
    })();

    if programmed.is_ok() {
        wait_for_lock(bus)?;
    }

    bus.write(saved_nitems, regs::NITEMS, false)?;
    bus.write(saved_rnitems, regs::RNITEMS, false)?;
    bus.write(saved_daggen, regs::DAGGEN_POWER, true)?;

    match programmed? {
        Some(clk) => Ok(clk),
        None => {
            // Stock reset: report whatever the PLL settled on
            let vco_reg = decode_vco(bus.read(regs::PLL_VCO)?)?;
            let div_reg = decode_div(bus.read(regs::PLL_CLK0)?)?;
            Ok((vco_reg.vco_mhz() / div_reg.divider()).floor())
        }
    }
}

fn wait_for_lock<B: Bus>(bus: &B) -> error::Result<()> {
    for _ in 0..LOCK_POLL_LIMIT {
        if bus.read(regs::CLK_LOCK)? & 1 == 1 {
            return Ok(());
        }
    }
    warn!("PLL did not report lock, continuing with possibly unchanged clock");
    Ok(())
}

fn decode_vco(reg: u32) -> error::Result<regs::PllVco> {
    regs::PllVco::from_reg(reg)
        .map_err(|e| ErrorKind::Pll(format!("VCO word {:#010x}: {}", reg, e)).into())
}

fn decode_div(reg: u32) -> error::Result<regs::PllClkDiv> {
    regs::PllClkDiv::from_reg(reg)
        .map_err(|e| ErrorKind::Pll(format!("divider word {:#010x}: {}", reg, e)).into())
}
