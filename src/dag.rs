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

//! Epoch initialization: staging the DAG for one Ethash epoch on the device.
//!
//! The generator builds the light cache and the DAG on-board from nothing but
//! the epoch seed, so an epoch switch costs no bulk upload. A persisted epoch
//! tag survives driver restarts and lets a warm board skip the whole build.
//! Register programming here is strictly ordered; the status polls drop the
//! AXI lock between iterations so telemetry and kicks can interleave.

use log::*;

use crate::axi::Bus;
use crate::clock;
use crate::error::{self, ErrorKind};
use crate::regs;
use crate::utils::PackedRegister;
use crate::work::EpochContext;
use crate::Miner;

use std::sync::MutexGuard;
use std::thread;
use std::time::{Duration, Instant};

/// Poll period for the on-device light-cache build.
const CACHE_POLL: Duration = Duration::from_millis(100);

/// Poll period for DAG generation.
const DAG_POLL: Duration = Duration::from_millis(500);

/// How often DAG progress is reported.
const PROGRESS_PERIOD: Duration = Duration::from_secs(5);

/// The duplication pass moves the DAG in chunks of this size.
const SWIZZLE_CHUNK: u64 = 0x100_0000;
/// Number of chunks the first DAG copy occupies.
const SWIZZLE_CHUNKS: u64 = 256;
/// Fabric address of the second (generator-side) DAG copy.
const DAG_UPPER_BASE: u64 = 0x1_0000_0000;

impl<B: Bus> Miner<B> {
    /// Stage the DAG for `ctx` on the device.
    ///
    /// On success the persisted epoch tag names `ctx.number`, the mining
    /// clock is restored and the tuner is started. On failure the error
    /// propagates to the work loop; there is no partial recovery.
    pub fn init_epoch(&self, ctx: &EpochContext) -> error::Result<()> {
        info!(
            "{}: initializing epoch {} (DAG {} MiB, cache {} MiB)",
            self.descriptor().name,
            ctx.number,
            ctx.dag_size >> 20,
            ctx.light_size >> 20
        );
        let mut axi = self.lock_axi();
        self.set_dagging(true);

        // stock clock before anything touches the core
        clock::set_clock(self.bus(), clock::Target::Stock)?;
        self.stop_hashcore_locked(true);

        // power up the generator
        self.bus().write(0xffff_ffff, regs::DAGGEN_POWER, true)?;

        // Ethash core parameters for this epoch
        let n_items = (ctx.dag_size / 128) as u32;
        let rn_items = ((1u64 << 56) / n_items as u64) as u32;
        self.bus().write(n_items, regs::NITEMS, false)?;
        self.bus().write(rn_items, regs::RNITEMS, false)?;

        let tag = regs::EpochTag::from_reg(self.bus().read(regs::EPOCH_TAG)?)
            .expect("BUG: epoch tag unpack cannot fail");
        let generate = !self.settings().skip_dag
            && (self.settings().force_dag || !tag.matches(ctx.number));

        if generate {
            // halt a build possibly left over from a previous run, then
            // pulse the generator reset
            self.bus().write(0x2, regs::DAG_CTRL, true)?;
            self.bus().write(0xffff_fffd, regs::DAGGEN_POWER, true)?;
            self.bus().write(0xffff_ffff, regs::DAGGEN_POWER, true)?;

            axi = self.build_light_cache(axi, ctx)?;
            self.program_mixers(ctx)?;
            axi = self.generate_dag(axi, ctx)?;
            self.duplicate_dag(ctx)?;

            self.bus()
                .write(regs::EpochTag::new(ctx.number as u16).to_reg(), regs::EPOCH_TAG, true)?;
            info!("{}: epoch {} DAG staged", self.descriptor().name, ctx.number);
        } else {
            info!(
                "{}: on-device DAG already at epoch {}, skipping generation",
                self.descriptor().name,
                ctx.number
            );
        }

        self.bus().write(0, regs::DAGGEN_POWER, true)?;
        drop(axi);

        self.restore_mining_clock();
        self.set_dagging(false);
        self.tuner().start();
        Ok(())
    }

    /// Build the light cache on-device from the reversed epoch seed.
    fn build_light_cache<'a>(
        &'a self,
        mut axi: MutexGuard<'a, ()>,
        ctx: &EpochContext,
    ) -> error::Result<MutexGuard<'a, ()>> {
        self.bus().write(0x2, regs::CACHE_CTRL, true)?;
        let parents = (ctx.light_size / 64) as u32;
        self.bus().write(parents, regs::DAG_PARENTS, false)?;

        let mut seed = ctx.seed;
        seed.reverse();
        debug!(
            "{}: cache seed (reversed) {}",
            self.descriptor().name,
            hex::encode(&seed)
        );
        // the seed upload is the only retried transfer
        if let Err(e) = self.bus().bulk_write(&seed, regs::CACHE_SEED, true) {
            warn!(
                "{}: seed upload failed ({}), retrying once",
                self.descriptor().name,
                e
            );
            self.bus().bulk_write(&seed, regs::CACHE_SEED, true)?;
        }
        self.bus().write(0x1, regs::CACHE_CTRL, true)?;

        loop {
            if self.bus().read(regs::CACHE_CTRL)? & 0x2 != 0 {
                break;
            }
            drop(axi);
            thread::sleep(CACHE_POLL);
            axi = self.lock_axi();
        }
        debug!("{}: light cache built", self.descriptor().name);
        Ok(axi)
    }

    /// Split the DAG item range across the bitstream's mixers. The first
    /// mixer absorbs the remainder of the division.
    fn program_mixers(&self, ctx: &EpochContext) -> error::Result<()> {
        let words = ctx.dag_size / 64;
        let mixers = self.settings().dag_mixers as u64;
        if mixers == 0 {
            Err(ErrorKind::Dag("dag-mixers must not be zero".to_string()))?
        }
        let mixer_size = words / mixers;
        let leftover = words - mixer_size * mixers;

        let mut start = 0u64;
        for i in 0..mixers {
            let mut end = start + mixer_size;
            if i == 0 {
                end += leftover;
            }
            self.bus().write(start as u32, regs::mixer_start(i as u32), false)?;
            self.bus().write(end as u32, regs::mixer_end(i as u32), false)?;
            start = end;
        }
        Ok(())
    }

    /// Kick off DAG generation and poll until the generator reports done.
    fn generate_dag<'a>(
        &'a self,
        mut axi: MutexGuard<'a, ()>,
        ctx: &EpochContext,
    ) -> error::Result<MutexGuard<'a, ()>> {
        self.bus().write(0x1, regs::DAG_CTRL, true)?;

        let total_items = ctx.dag_size / 64;
        let started = Instant::now();
        let mut last_report = Instant::now();
        loop {
            if self.bus().read(regs::DAG_CTRL)? & 0x2 != 0 {
                break;
            }
            if last_report.elapsed() >= PROGRESS_PERIOD {
                let progress = self.bus().read(regs::DAG_PARENTS)? as u64;
                info!(
                    "{}: DAG generation {:.1} %",
                    self.descriptor().name,
                    progress as f64 * 100.0 / total_items as f64
                );
                last_report = Instant::now();
            }
            drop(axi);
            thread::sleep(DAG_POLL);
            axi = self.lock_axi();
        }
        info!(
            "{}: DAG generated in {} s",
            self.descriptor().name,
            started.elapsed().as_secs()
        );
        Ok(axi)
    }

    /// Stage the second DAG copy: swizzle the generated items into the
    /// layout the hashcore expects, 4 MiB at a time, then mirror the whole
    /// copy back to the upper region.
    fn duplicate_dag(&self, ctx: &EpochContext) -> error::Result<()> {
        for i in 0..SWIZZLE_CHUNKS {
            let src = DAG_UPPER_BASE | (i << 24);
            let dst = ((i & 0x0f) << 4 | (i & 0xf0) >> 4) << 24;
            self.bus().cdma_copy(src, dst, SWIZZLE_CHUNK)?;
        }
        self.bus().cdma_copy(0, DAG_UPPER_BASE, ctx.dag_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{test_miner, test_miner_with_settings, test_settings_from, FakeBus};

    use std::sync::atomic::Ordering;

    fn test_context() -> EpochContext {
        EpochContext {
            number: 0x77,
            seed: {
                let mut seed = [0u8; 32];
                for (i, byte) in seed.iter_mut().enumerate() {
                    *byte = i as u8;
                }
                seed
            },
            light_size: 1 << 24,
            dag_size: 1 << 32,
        }
    }

    #[test]
    fn test_matching_epoch_tag_skips_generation() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0x8000_0077);
        let (miner, _, tuner) = test_miner(bus);

        miner.init_epoch(&test_context()).unwrap();

        let bus = miner.bus();
        assert!(!bus.wrote(regs::DAG_CTRL));
        assert!(!bus.wrote(regs::CACHE_CTRL));
        assert!(bus.bulk_writes().is_empty());
        assert!(bus.cdma_copies().is_empty());
        // core parameters are programmed even on the skip path
        assert_eq!(bus.value(regs::NITEMS), 1 << 25);
        assert_eq!(bus.value(regs::RNITEMS), 1 << 31);
        // generator powered down again
        assert_eq!(bus.value(regs::DAGGEN_POWER), 0);

        assert!(!miner.is_dagging());
        assert!(tuner.started.load(Ordering::Relaxed));
    }

    #[test]
    fn test_skip_dag_setting_bypasses_generation() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        let settings = test_settings_from("hosts = [\"board0\"]\nskip-dag = true");
        let (miner, _, _) = test_miner_with_settings(bus, settings);

        miner.init_epoch(&test_context()).unwrap();
        assert!(!miner.bus().wrote(regs::DAG_CTRL));
    }

    #[test]
    fn test_full_generation() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        bus.preset_seq(regs::CACHE_CTRL, &[0x0, 0x2]);
        bus.preset_seq(regs::DAG_CTRL, &[0x0, 0x2]);
        let (miner, _, tuner) = test_miner(bus);

        let ctx = test_context();
        miner.init_epoch(&ctx).unwrap();

        let bus = miner.bus();
        // exactly one generation start
        let dag_starts = bus
            .writes()
            .iter()
            .filter(|&&(addr, value)| addr == regs::DAG_CTRL && value == 0x1)
            .count();
        assert_eq!(dag_starts, 1);

        // reversed seed uploaded with byte-swap
        let bulk = bus.bulk_writes();
        assert_eq!(bulk.len(), 1);
        let (addr, data, swapped) = &bulk[0];
        assert_eq!(*addr, regs::CACHE_SEED);
        assert!(*swapped);
        let mut expected = ctx.seed;
        expected.reverse();
        assert_eq!(&data[..], &expected[..]);

        // the duplication swizzle and the final mirror copy
        let cdma = bus.cdma_copies();
        assert_eq!(cdma.len(), 257);
        for (i, &(src, dst, len)) in cdma[..256].iter().enumerate() {
            let i = i as u64;
            assert_eq!(src, 0x1_0000_0000 | (i << 24));
            assert_eq!(dst, ((i & 0x0f) << 4 | (i & 0xf0) >> 4) << 24);
            assert_eq!(len, 0x100_0000);
        }
        assert_eq!(cdma[256], (0, 0x1_0000_0000, 0x1_0000_0000));

        // epoch tag persisted, generator powered down
        assert_eq!(bus.value(regs::EPOCH_TAG), 0x8000_0077);
        assert_eq!(bus.value(regs::DAGGEN_POWER), 0);

        assert!(!miner.is_dagging());
        assert!(tuner.started.load(Ordering::Relaxed));
    }

    #[test]
    fn test_force_dag_regenerates() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0x8000_0077);
        bus.preset_seq(regs::CACHE_CTRL, &[0x2]);
        bus.preset_seq(regs::DAG_CTRL, &[0x2]);
        let settings = test_settings_from("hosts = [\"board0\"]\nforce-dag = true");
        let (miner, _, _) = test_miner_with_settings(bus, settings);

        miner.init_epoch(&test_context()).unwrap();
        assert!(miner.bus().wrote(regs::DAG_CTRL));
    }

    #[test]
    fn test_mixer_ranges() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        bus.preset_seq(regs::CACHE_CTRL, &[0x2]);
        bus.preset_seq(regs::DAG_CTRL, &[0x2]);
        let (miner, _, _) = test_miner(bus);

        // 2^32 / 64 = 2^26 items over 8 mixers: 2^23 each, no leftover
        miner.init_epoch(&test_context()).unwrap();
        let bus = miner.bus();
        assert_eq!(bus.value(regs::mixer_start(0)), 0);
        assert_eq!(bus.value(regs::mixer_end(0)), 1 << 23);
        assert_eq!(bus.value(regs::mixer_start(7)), 7 << 23);
        assert_eq!(bus.value(regs::mixer_end(7)), 1 << 26);
    }

    #[test]
    fn test_mixer_leftover_goes_first() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        bus.preset_seq(regs::CACHE_CTRL, &[0x2]);
        bus.preset_seq(regs::DAG_CTRL, &[0x2]);
        let settings = test_settings_from("hosts = [\"board0\"]\ndag-mixers = 3");
        let (miner, _, _) = test_miner_with_settings(bus, settings);

        let mut ctx = test_context();
        // 100 items over 3 mixers: 33 each, first takes 34
        ctx.dag_size = 100 * 64;
        miner.init_epoch(&ctx).unwrap();
        let bus = miner.bus();
        assert_eq!(bus.value(regs::mixer_start(0)), 0);
        assert_eq!(bus.value(regs::mixer_end(0)), 34);
        assert_eq!(bus.value(regs::mixer_start(1)), 34);
        assert_eq!(bus.value(regs::mixer_end(1)), 67);
        assert_eq!(bus.value(regs::mixer_end(2)), 100);
    }

    #[test]
    fn test_seed_upload_retries_once() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        bus.preset_seq(regs::CACHE_CTRL, &[0x2]);
        bus.preset_seq(regs::DAG_CTRL, &[0x2]);
        bus.fail_bulk_writes(1);
        let (miner, _, _) = test_miner(bus);

        miner.init_epoch(&test_context()).unwrap();
        assert_eq!(miner.bus().bulk_writes().len(), 1);
    }

    #[test]
    fn test_seed_upload_double_failure_aborts() {
        let bus = FakeBus::new();
        bus.preset(regs::EPOCH_TAG, 0);
        bus.fail_bulk_writes(2);
        let (miner, _, tuner) = test_miner(bus);

        assert!(miner.init_epoch(&test_context()).is_err());
        assert!(!tuner.started.load(Ordering::Relaxed));
    }
}
