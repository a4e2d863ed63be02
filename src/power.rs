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

//! Core voltage control for both supported board families.
//!
//! FK boards adjust VCCINT through a wiper-style regulator, JC boards carry a
//! PMBus-capable PMIC. Both are reached through small I2C masters mapped into
//! the register space; the sequences below must not be reordered and the
//! settle delays are part of the contract with the silicon.

use log::*;

use crate::axi::Bus;
use crate::error;
use crate::regs;

use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;

/// Setpoints below or at this many millivolts are refused.
const SETPOINT_MIN_MV: u32 = 500;
/// Setpoints above this many millivolts are refused.
const SETPOINT_MAX_MV: u32 = 920;

/// Register offsets within an I2C master bank.
const IIC_SOFT_RESET: u32 = 0x40;
const IIC_CONTROL: u32 = 0x100;
const IIC_TX_FIFO: u32 = 0x108;

/// Soft-reset magic of the I2C master.
const IIC_SOFT_RESET_KEY: u32 = 0xa;
/// TX-FIFO side-band bits: first byte of a transaction, last byte of a
/// transaction.
const IIC_START: u32 = 0x100;
const IIC_STOP: u32 = 0x200;

/// I2C address of the FK wiper regulator.
const FK_WIPER_ADDR: u8 = 0x2e;
/// Wiper register within the FK regulator.
const FK_WIPER_REG: u8 = 0x00;
/// How long the wiper needs after a reprogram.
const FK_SETTLE: Duration = Duration::from_millis(100);

/// I2C address of the JC PMIC.
const JC_PMIC_ADDR: u8 = 0x4d;
/// PMBus commands used on the JC PMIC.
const PMBUS_PAGE: u8 = 0x00;
const PMBUS_VOUT_COMMAND: u8 = 0x21;
const PMBUS_VOUT_OV_FAULT_LIMIT: u8 = 0x40;
const PMBUS_LOOP_CONFIG: u8 = 0xd3;
/// The PMIC needs this long to re-run its loop after any configuration write.
const JC_SETTLE: Duration = Duration::from_secs(1);

/// Vendor bring-up fixes: regulation-loop coefficients and overvoltage fault
/// limits for the VCCBRAM and VCCINT rails. Applied before every setpoint
/// change; the byte streams are opaque vendor data.
const JC_HOTFIX_VCCBRAM: &[u8] = &[
    PMBUS_PAGE,
    0x01,
    PMBUS_LOOP_CONFIG,
    0x90,
    0x1b,
    PMBUS_VOUT_OV_FAULT_LIMIT,
    0x63,
    0x02,
];
const JC_HOTFIX_VCCINT: &[u8] = &[
    PMBUS_PAGE,
    0x00,
    PMBUS_LOOP_CONFIG,
    0xc8,
    0x19,
    PMBUS_VOUT_OV_FAULT_LIMIT,
    0x70,
    0x02,
];

lazy_static! {
    /// Map from VID code to regulator output volts; monotonically decreasing.
    static ref VOLTAGE_TBL: [f64; 256] = init_voltage_tbl();
}

fn init_voltage_tbl() -> [f64; 256] {
    let mut tbl = [0.0; 256];
    for (vid, volts) in tbl.iter_mut().enumerate() {
        *volts = 0.6 + 2.661 / (20.0 - 2048.0 / (vid as f64 + 153.6));
    }
    tbl
}

/// Output volts for one VID code.
pub fn voltage_for_vid(vid: u8) -> f64 {
    VOLTAGE_TBL[vid as usize]
}

/// VID whose table entry is the closest representable voltage to `volts`.
///
/// Requests outside the table are clamped to its ends. The walk starts in the
/// middle and binary-steps by halving; ties keep the first probe that reached
/// the minimal distance. The walk by construction never lands on VID 0, so
/// that entry gets one extra comparison when the walk settles right next to
/// it.
pub fn vid_for_voltage(volts: f64) -> u8 {
    let tbl: &[f64; 256] = &VOLTAGE_TBL;
    if volts >= tbl[0] {
        return 0;
    }
    if volts <= tbl[255] {
        return 255;
    }

    let mut idx: usize = 0x80;
    let mut best: usize = 0x80;
    let mut step: usize = 0x40;
    loop {
        if (tbl[idx] - volts).abs() < (tbl[best] - volts).abs() {
            best = idx;
        }
        if tbl[idx] == volts {
            return idx as u8;
        }
        if volts > tbl[idx] {
            idx -= step;
        } else {
            idx += step;
        }
        if step == 1 {
            break;
        }
        step >>= 1;
    }
    if (tbl[idx] - volts).abs() < (tbl[best] - volts).abs() {
        best = idx;
    }
    if best == 1 && (tbl[0] - volts).abs() < (tbl[1] - volts).abs() {
        best = 0;
    }
    best as u8
}

/// One AXI-mapped I2C master.
struct IicBank {
    base: u32,
}

impl IicBank {
    fn new(base: u32) -> Self {
        Self { base }
    }

    fn soft_reset<B: Bus>(&self, bus: &B) -> error::Result<()> {
        bus.write(IIC_SOFT_RESET_KEY, self.base + IIC_SOFT_RESET, true)
    }

    /// Push one dynamic-mode transaction: address byte with start flag, data
    /// bytes, stop flag on the last one, then trigger the master.
    fn transact<B: Bus>(&self, bus: &B, addr: u8, data: &[u8]) -> error::Result<()> {
        assert!(!data.is_empty(), "empty I2C transaction");
        bus.write(IIC_START | (addr as u32) << 1, self.base + IIC_TX_FIFO, false)?;
        for (i, byte) in data.iter().enumerate() {
            let mut word = *byte as u32;
            if i == data.len() - 1 {
                word |= IIC_STOP;
            }
            bus.write(word, self.base + IIC_TX_FIFO, false)?;
        }
        bus.write(1, self.base + IIC_CONTROL, true)
    }
}

fn setpoint_valid(mv: u32) -> bool {
    mv > SETPOINT_MIN_MV && mv <= SETPOINT_MAX_MV
}

/// Program the VCCINT targets. A zero setpoint leaves the respective rail
/// alone; an out-of-range one is logged and skipped. Caller holds the AXI
/// lock for the whole sequence.
pub fn set_voltage<B: Bus>(bus: &B, fk_mv: u32, jc_mv: u32) -> error::Result<()> {
    if fk_mv != 0 {
        if !setpoint_valid(fk_mv) {
            warn!("FK VCCINT setpoint {} mV out of bounds, not set", fk_mv);
        } else {
            set_fk_voltage(bus, fk_mv)?;
        }
    }
    if jc_mv != 0 {
        if !setpoint_valid(jc_mv) {
            warn!("JC VCCINT setpoint {} mV out of bounds, not set", jc_mv);
        } else {
            set_jc_voltage(bus, jc_mv)?;
        }
    }
    Ok(())
}

fn set_fk_voltage<B: Bus>(bus: &B, mv: u32) -> error::Result<()> {
    let vid = vid_for_voltage(mv as f64 / 1000.0);
    info!(
        "Setting FK VCCINT to {} mV (VID {:#04x} = {:.4} V)",
        mv,
        vid,
        voltage_for_vid(vid)
    );
    let bank = IicBank::new(regs::FK_IIC_BASE);
    bank.soft_reset(bus)?;
    bank.transact(bus, FK_WIPER_ADDR, &[FK_WIPER_REG, vid])?;
    thread::sleep(FK_SETTLE);
    Ok(())
}

fn set_jc_voltage<B: Bus>(bus: &B, mv: u32) -> error::Result<()> {
    // VOUT_COMMAND in linear16 with a fixed -8 exponent
    let v_enc = (mv as f64 / 1000.0 * 256.0).round() as u16;
    info!("Setting JC VCCINT to {} mV (VOUT_COMMAND {:#06x})", mv, v_enc);
    let bank = IicBank::new(regs::JC_IIC_BASE);
    for fix in &[JC_HOTFIX_VCCBRAM, JC_HOTFIX_VCCINT] {
        bank.transact(bus, JC_PMIC_ADDR, fix)?;
        thread::sleep(JC_SETTLE);
    }
    let vout = [
        PMBUS_PAGE,
        0x00,
        PMBUS_VOUT_COMMAND,
        (v_enc & 0xff) as u8,
        (v_enc >> 8) as u8,
    ];
    bank.transact(bus, JC_PMIC_ADDR, &vout)?;
    thread::sleep(JC_SETTLE);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::FakeBus;

    use approx::assert_relative_eq;

    #[test]
    fn test_table_shape() {
        for vid in 0..256 {
            let v = VOLTAGE_TBL[vid];
            assert!(v > 0.6 && v < 1.0, "VID {} out of range: {}", vid, v);
            if vid > 0 {
                assert!(VOLTAGE_TBL[vid - 1] > v, "table not decreasing at {}", vid);
            }
        }
        assert_relative_eq!(VOLTAGE_TBL[0], 0.99915, epsilon = 1e-4);
        assert_relative_eq!(VOLTAGE_TBL[255], 0.77754, epsilon = 1e-4);
    }

    #[test]
    fn test_vid_search_exact_entries() {
        for vid in 0..=255u8 {
            assert_eq!(vid_for_voltage(voltage_for_vid(vid)), vid);
        }
    }

    #[test]
    fn test_vid_search_is_closest() {
        // probe every bracket at several offsets and verify no other VID is
        // strictly closer
        for k in 0..255usize {
            for &frac in &[0.1, 0.25, 0.5, 0.75, 0.9] {
                let v = VOLTAGE_TBL[k] * (1.0 - frac) + VOLTAGE_TBL[k + 1] * frac;
                let got = vid_for_voltage(v) as usize;
                let got_err = (VOLTAGE_TBL[got] - v).abs();
                for other in 0..256 {
                    assert!(
                        got_err <= (VOLTAGE_TBL[other] - v).abs() + 1e-15,
                        "VID {} beats chosen {} for {}",
                        other,
                        got,
                        v
                    );
                }
            }
        }
    }

    #[test]
    fn test_vid_search_clamps() {
        assert_eq!(vid_for_voltage(2.0), 0);
        assert_eq!(vid_for_voltage(0.1), 255);
        assert_eq!(vid_for_voltage(voltage_for_vid(0)), 0);
        assert_eq!(vid_for_voltage(voltage_for_vid(255)), 255);
    }

    #[test]
    fn test_vid_search_tie_break() {
        // equidistant between two entries the lower VID is probed first and
        // first hit wins
        let v = (VOLTAGE_TBL[2] + VOLTAGE_TBL[3]) / 2.0;
        assert_eq!(vid_for_voltage(v), 2);
    }

    #[test]
    fn test_out_of_bounds_setpoints_write_nothing() {
        let bus = FakeBus::new();
        set_voltage(&bus, 499, 1000).unwrap();
        assert!(bus
            .writes()
            .iter()
            .all(|&(addr, _)| !(0x9000..0xc000).contains(&addr)));
    }

    #[test]
    fn test_fk_sequence() {
        let bus = FakeBus::new();
        set_voltage(&bus, 850, 0).unwrap();
        let writes = bus.writes();
        // soft reset, address byte, wiper register, wiper value, trigger
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0], (regs::FK_IIC_BASE + IIC_SOFT_RESET, 0xa));
        assert_eq!(
            writes[1],
            (
                regs::FK_IIC_BASE + IIC_TX_FIFO,
                IIC_START | (FK_WIPER_ADDR as u32) << 1
            )
        );
        let vid = vid_for_voltage(0.85) as u32;
        assert_eq!(writes[3], (regs::FK_IIC_BASE + IIC_TX_FIFO, IIC_STOP | vid));
        assert_eq!(writes[4], (regs::FK_IIC_BASE + IIC_CONTROL, 1));
    }

    #[test]
    fn test_jc_sequence() {
        let bus = FakeBus::new();
        set_voltage(&bus, 0, 900).unwrap();
        let writes = bus.writes();
        // three transactions, each triggered once
        let triggers = writes
            .iter()
            .filter(|&&(addr, _)| addr == regs::JC_IIC_BASE + IIC_CONTROL)
            .count();
        assert_eq!(triggers, 3);
        // 0.9 V encodes as round(0.9 * 256) = 230
        let v_enc = 230;
        let last = writes
            .iter()
            .rev()
            .find(|&&(addr, _)| addr == regs::JC_IIC_BASE + IIC_TX_FIFO)
            .unwrap();
        assert_eq!(last.1, IIC_STOP | (v_enc >> 8));
    }
}
