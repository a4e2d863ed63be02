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

//! Work packages, epoch contexts and solutions exchanged with the farm layer.

use crate::error;

use chrono::{DateTime, Utc};

/// Algorithm this driver can serve. Anything else terminates the work loop.
pub const ALGORITHM_ETHASH: &str = "ethash";

/// One unit of work as handed down by the farm dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPackage {
    pub algorithm: String,
    pub epoch: u32,
    pub header: [u8; 32],
    pub boundary: [u8; 32],
    pub start_nonce: u64,
}

/// Per-epoch parameters provided by the external light-cache builder.
///
/// The cache itself never crosses this boundary: the generator on the device
/// rebuilds it from the seed, so only the sizes and the seed travel here.
#[derive(Debug, Clone)]
pub struct EpochContext {
    pub number: u32,
    pub seed: [u8; 32],
    pub light_size: u64,
    pub dag_size: u64,
}

/// A candidate nonce harvested from the hashcore.
///
/// The FPGA does not return a mix-hash, so `mix_hash` is always zero and the
/// farm side must accept that from FPGA miners.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub mix_hash: [u8; 32],
    pub work: WorkPackage,
    pub when: DateTime<Utc>,
    pub miner_index: usize,
}

impl Solution {
    pub fn new(nonce: u64, work: WorkPackage, miner_index: usize) -> Self {
        Self {
            nonce,
            mix_hash: [0u8; 32],
            work,
            when: Utc::now(),
            miner_index,
        }
    }
}

/// Where harvested solutions go.
pub trait SolutionSink: Send + Sync {
    fn submit(&self, solution: Solution);
}

/// Source of per-epoch parameters, owned by the farm layer.
pub trait EpochProvider: Send + Sync {
    fn epoch_context(&self, epoch: u32) -> error::Result<EpochContext>;
}
