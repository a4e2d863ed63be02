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

use packed_struct::prelude::*;

/// Just an util trait so that we can pack/unpack directly to registers
pub trait PackedRegister: Sized {
    fn from_reg(reg: u32) -> Result<Self, PackingError>;
    fn to_reg(&self) -> u32;
}

impl<T> PackedRegister for T
where
    T: PackedStruct<[u8; 4]>,
{
    /// Take register and unpack (as big endian)
    fn from_reg(reg: u32) -> Result<Self, PackingError> {
        Self::unpack(&u32::to_be_bytes(reg))
    }
    /// Pack into big-endian register
    fn to_reg(&self) -> u32 {
        u32::from_be_bytes(self.pack())
    }
}

/// Explicit byte-order swap. The AXI bridge talks little-endian words while the
/// hashcore consumes some of its 32-byte operands byte-reversed, so the swap is
/// always spelled out instead of hidden inside a transfer.
#[inline]
pub fn eswap32(x: u32) -> u32 {
    x.swap_bytes()
}

#[inline]
pub fn eswap64(x: u64) -> u64 {
    x.swap_bytes()
}

/// Round up to the nearest 1/8. PLL output dividers are programmed in
/// eighth-of-a-divider steps.
pub fn ceil_to_eighth(x: f64) -> f64 {
    (x * 8.0).ceil() / 8.0
}

/// Format millivolts as volts with two decimal places ("850" -> "0.85").
/// Used when composing the tune-file key.
pub fn format2decimal(mv: u32) -> String {
    format!("{:.2}", mv as f64 / 1000.0)
}
