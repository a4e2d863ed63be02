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

//! Board telemetry and the HBM safety interlock.
//!
//! A periodic caller samples die temperature, core voltage and the HBM
//! status word. A catastrophic or uncalibrated HBM stack shuts the hashcore
//! down and latches the device off; only a reinit recovers it.

use log::*;

use crate::axi::Bus;
use crate::regs::{self, HbmStatus};
use crate::utils::PackedRegister;
use crate::Miner;

use std::fmt;

/// Die temperature conversion, raw 16-bit sample to degrees Celsius.
const TEMP_SCALE: f64 = 507.6 / 65536.0;
const TEMP_OFFSET: f64 = -279.43;

/// Core voltage conversion, raw 16-bit sample to millivolts.
const VOLTAGE_SCALE_MV: f64 = 3.0 / 65536.0 * 1000.0;

/// One telemetry snapshot.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub temp_c: f64,
    pub core_mv: f64,
    /// Last confirmed core clock; stands in for a fan-speed slot upstream
    pub clock_mhz: u64,
    pub hbm: HbmStatus,
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MHz, die {:.1} C, vccint {:.0} mV",
            self.clock_mhz, self.temp_c, self.core_mv
        )
    }
}

impl Telemetry {
    /// HBM detail for the status line.
    pub fn hbm_summary(&self) -> String {
        format!(
            "HBM left: {} {} C, right: {} {} C",
            calib_str(self.hbm.left_calibrated, self.hbm.left_catastrophe),
            u8::from(self.hbm.left_temp),
            calib_str(self.hbm.right_calibrated, self.hbm.right_catastrophe),
            u8::from(self.hbm.right_temp),
        )
    }
}

fn calib_str(calibrated: bool, catastrophe: bool) -> &'static str {
    match (calibrated, catastrophe) {
        (_, true) => "CATASTROPHIC",
        (false, false) => "UNCALIBRATED",
        (true, false) => "ok",
    }
}

impl<B: Bus> Miner<B> {
    /// Sample the board. Called from the telemetry thread; any read failure
    /// degrades to a safe value so a flaky link cannot cascade into bogus
    /// shutdowns. A genuine HBM fault shuts the hashcore down and latches
    /// the device off.
    pub fn telemetry(&self) -> Telemetry {
        let axi = self.lock_axi();

        let temp_raw = self.read_or_zero(regs::TEMP_RAW);
        let volt_raw = self.read_or_zero(regs::VOLTAGE_RAW);
        let hbm_word = match self.bus().read(regs::HBM_STATUS) {
            Ok(word) => word,
            Err(e) => {
                warn!(
                    "{}: HBM status read failed ({}), assuming healthy",
                    self.descriptor().name,
                    e
                );
                HbmStatus::FALLBACK
            }
        };
        let hbm = HbmStatus::from_reg(hbm_word).expect("BUG: HBM word unpack cannot fail");

        let snapshot = Telemetry {
            temp_c: temp_raw as f64 * TEMP_SCALE + TEMP_OFFSET,
            core_mv: volt_raw as f64 * VOLTAGE_SCALE_MV,
            clock_mhz: self.last_clk(),
            hbm,
        };

        let fault = snapshot.hbm.is_fault();
        if fault && !self.is_dagging() {
            error!(
                "{}: HBM fault ({}), shutting hashcore down",
                self.descriptor().name,
                snapshot.hbm_summary()
            );
            self.stop_hashcore_locked(true);
            self.write_or_log(0, regs::DAGGEN_POWER, true);
            self.set_dagging(true);
        }
        drop(axi);
        if fault {
            self.kick_miner();
        }

        self.store_hwmon(snapshot.clone());
        snapshot
    }
}
