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

//! Register map of the Ethash bitstream and the multi-field register words.
//!
//! This is the single symbolic table shared by the driver and its tests;
//! nothing else in the crate spells a raw register address.

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

/// Device-type magic.
pub const DEVICE_MAGIC: u32 = 0x0000;
/// Bitstream version.
pub const BITSTREAM_VERSION: u32 = 0x0008;
/// Device DNA, low/mid/high words.
pub const DNA_LO: u32 = 0x1000;
pub const DNA_MID: u32 = 0x1008;
pub const DNA_HI: u32 = 0x7000;
/// Die temperature, raw 16-bit sample.
pub const TEMP_RAW: u32 = 0x3400;
/// Core voltage, raw 16-bit sample.
pub const VOLTAGE_RAW: u32 = 0x3404;
/// DAG generator control/status; bit 1 signals completion.
pub const DAG_CTRL: u32 = 0x4000;
/// Parent-node count on the way in, generation progress on the way out.
pub const DAG_PARENTS: u32 = 0x4008;
/// Persisted DAG epoch tag (bit 31 = valid, low 16 bits = epoch).
pub const EPOCH_TAG: u32 = 0x40b8;
/// Light-cache build control/status; bit 1 signals completion.
pub const CACHE_CTRL: u32 = 0x40bc;
/// Light-cache seed window (32 bytes, byte-swapped bulk write).
pub const CACHE_SEED: u32 = 0x40c0;
/// Work header (32 bytes).
pub const HEADER: u32 = 0x5000;
/// Boundary/target (32 bytes).
pub const BOUNDARY: u32 = 0x5020;
/// Number of DAG items.
pub const NITEMS: u32 = 0x5040;
/// Target-check counter, high and low words.
pub const TCHECK_HI: u32 = 0x5044;
pub const TCHECK_LO: u32 = 0x5048;
/// Start nonce, low and high words.
pub const NONCE_LO: u32 = 0x5064;
pub const NONCE_HI: u32 = 0x5068;
/// Core control word.
pub const CORE_CTRL: u32 = 0x506c;
/// Core flags (intensity/patience), see [`CoreFlags`].
pub const CORE_FLAGS: u32 = 0x5080;
/// Liveness counter; a repeat of the previous sample means a stuck core.
pub const STALL_CNT: u32 = 0x5084;
/// Reciprocal of `NITEMS` consumed by the modulo-free item mapper.
pub const RNITEMS: u32 = 0x5088;
/// HBM stack status word, see [`HbmStatus`].
pub const HBM_STATUS: u32 = 0x7008;
/// Clock reset and PLL lock status (bit 0).
pub const CLK_RESET: u32 = 0x8000;
pub const CLK_LOCK: u32 = 0x8004;
/// PLL VCO configuration, output-divider configuration and load pulse.
pub const PLL_VCO: u32 = 0x8200;
pub const PLL_CLK0: u32 = 0x8208;
pub const PLL_LOAD: u32 = 0x825c;
/// I2C cores wired to the FK wiper regulator and the JC PMIC.
pub const FK_IIC_BASE: u32 = 0x9000;
pub const JC_IIC_BASE: u32 = 0xa000;
/// DAG generator power gate.
pub const DAGGEN_POWER: u32 = 0xb000;

/// Core control values.
pub const CORE_START_IRQ: u32 = 0x0001_0001;
#[allow(dead_code)]
pub const CORE_CLEAR_NONCE: u32 = 0x0001_0000;
pub const CORE_RESET: u32 = 0;

/// Interrupt mask bit carrying candidate nonces.
pub const IRQ_NONCE: u32 = 0x1;

/// Mixer `i` address range registers.
pub fn mixer_start(i: u32) -> u32 {
    0x400c + 8 * i
}

pub fn mixer_end(i: u32) -> u32 {
    0x4010 + 8 * i
}

/// Layout of the core flags register
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct CoreFlags {
    /// Hash batch size; only consumed with `intensity_en`
    #[packed_field(bits = "31:24")]
    pub intensity_n: u8,
    /// Encoded duty divisor: `intensity_d * 8 - 1`
    #[packed_field(bits = "21:16")]
    pub intensity_d: Integer<u8, packed_bits::Bits6>,
    /// Pipeline patience; only consumed with `patience_en`
    #[packed_field(bits = "15:8")]
    pub patience: u8,
    #[packed_field(bits = "6")]
    pub patience_en: bool,
    #[packed_field(bits = "0")]
    pub intensity_en: bool,
}

impl CoreFlags {
    /// Compose the flags word from the effective tunables.
    pub fn new(intensity_n: u8, intensity_d: u8, patience: u8) -> Self {
        let d_enc = if intensity_d > 0 {
            ((intensity_d as u16 * 8 - 1) & 0x3f) as u8
        } else {
            0
        };
        Self {
            intensity_n,
            intensity_d: d_enc.into(),
            patience,
            patience_en: patience != 0,
            intensity_en: intensity_n != 0,
        }
    }

    /// Same word with the intensity byte replaced; used by the soft-stop ramp.
    pub fn with_intensity(&self, intensity_n: u8) -> Self {
        let mut flags = self.clone();
        flags.intensity_n = intensity_n;
        flags
    }
}

/// Layout of the HBM status word
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct HbmStatus {
    #[packed_field(bits = "17:11")]
    pub right_temp: Integer<u8, packed_bits::Bits7>,
    #[packed_field(bits = "10")]
    pub right_catastrophe: bool,
    #[packed_field(bits = "9:3")]
    pub left_temp: Integer<u8, packed_bits::Bits7>,
    #[packed_field(bits = "2")]
    pub left_catastrophe: bool,
    #[packed_field(bits = "1")]
    pub right_calibrated: bool,
    #[packed_field(bits = "0")]
    pub left_calibrated: bool,
}

impl HbmStatus {
    /// Value substituted when the register cannot be read; reads as two
    /// calibrated, healthy stacks so a transport hiccup does not cascade
    /// into a safety shutdown.
    pub const FALLBACK: u32 = 0x3;

    /// True when either stack forbids further mining.
    pub fn is_fault(&self) -> bool {
        self.left_catastrophe
            || self.right_catastrophe
            || !self.left_calibrated
            || !self.right_calibrated
    }
}

/// Layout of the persisted epoch tag
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct EpochTag {
    #[packed_field(bits = "31")]
    pub valid: bool,
    #[packed_field(bits = "15:0")]
    pub epoch: u16,
}

impl EpochTag {
    pub fn new(epoch: u16) -> Self {
        Self { valid: true, epoch }
    }

    pub fn matches(&self, epoch: u32) -> bool {
        self.valid && self.epoch as u32 == epoch
    }
}

/// Layout of the PLL VCO word: 200 MHz reference times `mult` plus a
/// fractional part in thousandths, divided by `gdiv`.
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct PllVco {
    #[packed_field(bits = "25:16")]
    pub frac: Integer<u16, packed_bits::Bits10>,
    #[packed_field(bits = "15:8")]
    pub mult: u8,
    #[packed_field(bits = "7:0")]
    pub gdiv: u8,
}

impl PllVco {
    /// Reference clock feeding the PLL.
    const F_REF_MHZ: f64 = 200.0;

    pub fn vco_mhz(&self) -> f64 {
        let mult = self.mult as f64 + u16::from(self.frac) as f64 / 1000.0;
        Self::F_REF_MHZ * mult / self.gdiv as f64
    }
}

/// Layout of the clock0 output-divider word, fractional part in thousandths.
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct PllClkDiv {
    #[packed_field(bits = "17:8")]
    pub frac: Integer<u16, packed_bits::Bits10>,
    #[packed_field(bits = "7:0")]
    pub divide: u8,
}

impl PllClkDiv {
    pub fn divider(&self) -> f64 {
        self.divide as f64 + u16::from(self.frac) as f64 / 1000.0
    }

    /// Encode a divider that is already rounded to an 1/8 step.
    pub fn from_divider(div: f64) -> Self {
        let int_part = div.floor();
        let frac_part = ((div - int_part) * 1000.0).round() as u16;
        Self {
            frac: frac_part.into(),
            divide: int_part as u8,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::PackedRegister;

    #[test]
    fn test_core_flags_encoding() {
        // intensity 0x40, divisor 8 (encodes as 63), patience 0x20
        let flags = CoreFlags::new(0x40, 8, 0x20);
        assert_eq!(flags.to_reg(), 0x403f_2041);

        // everything off is an all-zero word
        assert_eq!(CoreFlags::new(0, 0, 0).to_reg(), 0);

        // patience only: no intensity enable bit
        let flags = CoreFlags::new(0, 1, 5);
        assert_eq!(flags.to_reg(), 0x0007_0540);
    }

    #[test]
    fn test_core_flags_ramp() {
        let flags = CoreFlags::new(0x80, 1, 0);
        let halved = flags.with_intensity(0x40);
        assert_eq!(halved.intensity_n, 0x40);
        assert_eq!(halved.intensity_d, flags.intensity_d);
    }

    #[test]
    fn test_hbm_status_decoding() {
        // both stacks calibrated and healthy
        let st = HbmStatus::from_reg(0x3).unwrap();
        assert!(!st.is_fault());
        assert_eq!(u8::from(st.left_temp), 0);

        // catastrophic bits on both stacks, calibration lost
        let st = HbmStatus::from_reg(0x0000_0404).unwrap();
        assert!(st.left_catastrophe);
        assert!(st.right_catastrophe);
        assert!(!st.left_calibrated);
        assert!(st.is_fault());

        // temperatures land in the expected windows
        let st = HbmStatus::from_reg((45 << 3) | (50 << 11) | 0x3).unwrap();
        assert!(!st.is_fault());
        assert_eq!(u8::from(st.left_temp), 45);
        assert_eq!(u8::from(st.right_temp), 50);
    }

    #[test]
    fn test_epoch_tag() {
        let tag = EpochTag::from_reg(0x8000_0077).unwrap();
        assert!(tag.matches(0x77));
        assert!(!tag.matches(0x78));

        // without the valid bit nothing matches
        let tag = EpochTag::from_reg(0x77).unwrap();
        assert!(!tag.matches(0x77));

        assert_eq!(EpochTag::new(0x142).to_reg(), 0x8000_0142);
    }

    #[test]
    fn test_pll_words() {
        // gdiv 1, mult 6.000 -> 1200 MHz VCO
        let vco = PllVco::from_reg(0x0000_0601).unwrap();
        assert_eq!(vco.vco_mhz(), 1200.0);

        // divider 2.875 programmed back and forth
        let div = PllClkDiv::from_divider(2.875);
        assert_eq!(div.divide, 2);
        assert_eq!(u16::from(div.frac), 875);
        assert_eq!(PllClkDiv::from_reg(div.to_reg()).unwrap().divider(), 2.875);
    }

    #[test]
    fn test_mixer_addresses() {
        assert_eq!(mixer_start(0), 0x400c);
        assert_eq!(mixer_end(0), 0x4010);
        assert_eq!(mixer_start(7), 0x4044);
        assert_eq!(mixer_end(7), 0x4048);
    }
}
