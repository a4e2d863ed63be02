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

//! Contract between the driver and the clock auto-tuner.
//!
//! The search policy itself lives outside this crate; the driver only starts
//! the tuner once a DAG is in place, feeds it target-check deltas and lets it
//! override the hashcore tunables. Tune-file persistence is keyed by the
//! settings ID derived here.

use crate::config::Tunables;
use crate::utils::format2decimal;

/// Hooks the driver calls into. All default to "no tuner present".
pub trait Tuner: Send + Sync {
    /// Called by the epoch initializer once the DAG is staged and the mining
    /// clock has been restored.
    fn start(&self) {}

    /// Called once per search-loop poll with the target-check delta.
    fn tune(&self, _target_checks: u64) {}

    /// Current tunables override, if the tuner wants one.
    fn intensity(&self) -> Option<Tunables> {
        None
    }

    /// Fraction of rejected/invalid results the tuner has observed.
    fn error_rate(&self) -> f64 {
        0.0
    }
}

/// NoTuner uses default implementation of all hooks
pub struct NoTuner;

impl Tuner for NoTuner {}

/// Key identifying a (board, bitstream, voltage) tuple in the tune file.
pub fn setting_id(dna: [u32; 3], bitstream: u32, fk_vccint_mv: u32, jc_vccint_mv: u32) -> String {
    format!(
        "{:08x}{:08x}{:08x}_{:08x}_{}{}",
        dna[2],
        dna[1],
        dna[0],
        bitstream,
        format2decimal(fk_vccint_mv),
        format2decimal(jc_vccint_mv)
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_setting_id() {
        let id = setting_id([0x11, 0x22, 0x33], 0xa1, 850, 0);
        assert_eq!(id, "000000330000002200000011_000000a1_0.850.00");
    }

    #[test]
    fn test_no_tuner_defaults() {
        let tuner = NoTuner;
        tuner.start();
        tuner.tune(12345);
        assert!(tuner.intensity().is_none());
        assert_eq!(tuner.error_rate(), 0.0);
    }
}
