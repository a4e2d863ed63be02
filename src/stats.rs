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

//! Rolling hash-rate estimation from target-check counter deltas.
//!
//! Every search-loop poll feeds its delta in; once a minute the accumulated
//! count is folded into a 1-minute average and appended to bounded 10- and
//! 60-minute windows. Averages far outside the plausible range of the
//! hashcore are transients (relocks, counter glitches) and are discarded.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of one accumulation window.
const SAMPLE_WINDOW: Duration = Duration::from_secs(60);

/// Plausible per-device hash-rate band in MH/s; anything outside is discarded.
const MIN_PLAUSIBLE_MHS: f64 = 10.0;
const MAX_PLAUSIBLE_MHS: f64 = 100.0;

/// Sizes of the rolling windows, in one-minute samples.
const WINDOW_10MIN: usize = 10;
const WINDOW_60MIN: usize = 60;

#[derive(Debug)]
pub struct HashRateMeter {
    /// Target checks accumulated in the current window
    window_checks: u64,
    /// When the current window opened; `None` until the first sample
    window_start: Option<Instant>,
    /// Last accepted 1-minute average (MH/s)
    avg_1min: f64,
    mins10: VecDeque<f64>,
    mins60: VecDeque<f64>,
}

impl HashRateMeter {
    pub fn new() -> Self {
        Self {
            window_checks: 0,
            window_start: None,
            avg_1min: 0.0,
            mins10: VecDeque::with_capacity(WINDOW_10MIN),
            mins60: VecDeque::with_capacity(WINDOW_60MIN),
        }
    }

    /// Account one poll's worth of target checks.
    /// `now` is passed explicitly to facilitate testing.
    pub fn insert(&mut self, target_checks: u64, now: Instant) {
        let start = match self.window_start {
            None => {
                self.window_start = Some(now);
                self.window_checks = target_checks;
                return;
            }
            Some(start) => start,
        };
        self.window_checks += target_checks;

        if now.duration_since(start) >= SAMPLE_WINDOW {
            let avg = (self.window_checks as f64 / SAMPLE_WINDOW.as_secs() as f64) / 1e6;
            if avg > MIN_PLAUSIBLE_MHS && avg < MAX_PLAUSIBLE_MHS {
                self.avg_1min = avg;
                push_bounded(&mut self.mins10, avg, WINDOW_10MIN);
                push_bounded(&mut self.mins60, avg, WINDOW_60MIN);
            }
            self.window_start = Some(now);
            self.window_checks = 0;
        }
    }

    /// The four public average slots: 1-minute, 10-minute mean, 60-minute
    /// mean and the tuner's error rate in percent.
    pub fn averages(&self, error_rate: f64) -> [f64; 4] {
        [
            self.avg_1min,
            mean(&self.mins10),
            mean(&self.mins60),
            error_rate * 100.0,
        ]
    }
}

fn push_bounded(queue: &mut VecDeque<f64>, value: f64, bound: usize) {
    if queue.len() == bound {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn mean(queue: &VecDeque<f64>) -> f64 {
    if queue.is_empty() {
        return 0.0;
    }
    queue.iter().sum::<f64>() / queue.len() as f64
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_window(meter: &mut HashRateMeter, start: Instant, checks: u64) -> Instant {
        // one opening sample, then the rest of the window in a single delta
        meter.insert(0, start);
        let end = start + SAMPLE_WINDOW;
        meter.insert(checks, end);
        end
    }

    #[test]
    fn test_plausible_average_accepted() {
        let mut meter = HashRateMeter::new();
        let t0 = Instant::now();
        // 1.8e9 checks per minute is 30 MH/s
        run_window(&mut meter, t0, 1_800_000_000);
        let avg = meter.averages(0.0);
        assert_eq!(avg[0], 30.0);
        assert_eq!(avg[1], 30.0);
        assert_eq!(avg[2], 30.0);
    }

    #[test]
    fn test_transients_discarded() {
        let mut meter = HashRateMeter::new();
        let mut now = Instant::now();
        // 500 MH/s: relock transient
        now = run_window(&mut meter, now, 30_000_000_000);
        // exactly 10 MH/s and exactly 100 MH/s sit outside the open interval
        now = run_window(&mut meter, now, 600_000_000);
        run_window(&mut meter, now, 6_000_000_000);
        let avg = meter.averages(0.0);
        assert_eq!(avg[0], 0.0);
        assert_eq!(avg[1], 0.0);
        assert_eq!(avg[2], 0.0);
    }

    #[test]
    fn test_window_bounds() {
        let mut meter = HashRateMeter::new();
        let mut now = Instant::now();
        for _ in 0..(WINDOW_10MIN + 2) {
            now = run_window(&mut meter, now, 1_800_000_000);
        }
        assert_eq!(meter.mins10.len(), WINDOW_10MIN);
        assert_eq!(meter.mins60.len(), WINDOW_10MIN + 2);
    }

    #[test]
    fn test_error_rate_slot() {
        let meter = HashRateMeter::new();
        assert_eq!(meter.averages(0.031)[3], 3.1);
    }
}
