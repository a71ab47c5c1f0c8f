// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-Entity Load Tracking
//!
//! A decaying-average estimator of how busy a scheduling entity (a task, a
//! group of tasks, or a CPU run-queue) has been. Time is divided into fixed
//! 1024us sampling periods and each period's contribution is weighted by
//! `y^n` where `n` is the period's age; `y` is chosen so that the weight of
//! the past halves every configured half-life.
//!
//! The estimator maintains three signals:
//!
//! - `load_avg`: decaying average of running time.
//! - `runnable_avg`: decaying average of runnable (running or waiting)
//!   time. Always >= `load_avg` since running implies runnable.
//! - `util_avg`: decaying average of CPU capacity actually occupied,
//!   bounded by the entity's current capacity.
//!
//! All three are normalized so that an entity which is permanently active
//! converges to [`CAPACITY_SCALE`] (util converges to the entity's
//! capacity). Updates are pure state transitions driven by caller-supplied
//! monotonic timestamps; the estimator never reads a clock and never fails.
//!
//! The half-life is process-wide configuration shared by every tracked
//! entity ([`get_pelt_halflife`] / [`set_pelt_halflife`]). Changing it only
//! affects decay steps computed after the change. [`PeltState::update`]
//! reads the shared cell; [`PeltState::update_with_halflife`] takes the
//! half-life explicitly and is a pure function of its arguments.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use serde::Serialize;
use static_assertions::const_assert;

/// One sampling period in microseconds.
pub const PELT_PERIOD_US: u64 = 1024;

/// Fixed-point unity for capacity and for the tracked averages:
/// an average of `CAPACITY_SCALE` means "fully busy".
pub const CAPACITY_SCALE: f64 = 1024.0;

/// Default half-life in milliseconds, equal to the number of sampling
/// periods after which past contributions lose half their weight.
pub const PELT_HALFLIFE_DEFAULT_MS: u32 = 32;

/// Upper bound accepted by [`set_pelt_halflife`].
pub const PELT_HALFLIFE_MAX_MS: u32 = 1024;

const_assert!(PELT_PERIOD_US.is_power_of_two());
const_assert!(PELT_HALFLIFE_DEFAULT_MS >= 1 && PELT_HALFLIFE_DEFAULT_MS <= PELT_HALFLIFE_MAX_MS);

// Timestamps are in nanoseconds; accrual happens in ~us units obtained by
// shifting, so one period spans this many clock units.
pub(crate) const PELT_PERIOD_NS: u64 = PELT_PERIOD_US << 10;

static PELT_HALFLIFE_MS: AtomicU32 = AtomicU32::new(PELT_HALFLIFE_DEFAULT_MS);

/// Return the process-wide PELT half-life in milliseconds.
pub fn get_pelt_halflife() -> u32 {
    PELT_HALFLIFE_MS.load(Ordering::Relaxed)
}

/// Set the process-wide PELT half-life. Rejects zero and values above
/// [`PELT_HALFLIFE_MAX_MS`], leaving the previous half-life in place.
/// Takes effect for all future decay steps of all entities; history
/// already accumulated is not re-weighted.
pub fn set_pelt_halflife(ms: u32) -> Result<()> {
    if ms == 0 || ms > PELT_HALFLIFE_MAX_MS {
        bail!(
            "invalid PELT half-life {}ms, allowed range 1-{}ms",
            ms,
            PELT_HALFLIFE_MAX_MS
        );
    }

    let prev = PELT_HALFLIFE_MS.swap(ms, Ordering::Relaxed);
    if prev != ms {
        debug!("PELT half-life changed {}ms -> {}ms", prev, ms);
    }
    Ok(())
}

// Per-period decay factor: halves every `halflife_ms` periods.
fn per_period_decay(halflife_ms: u32) -> f64 {
    0.5f64.powf(1.0 / halflife_ms as f64)
}

// Geometric ceiling of the accumulated sum, in us: sum of PELT_PERIOD_US
// weighted by y^n over all past periods.
fn max_sum(y: f64) -> f64 {
    PELT_PERIOD_US as f64 / (1.0 - y)
}

/// Read-only view of an entity's tracked averages at its last update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub load_avg: f64,
    pub runnable_avg: f64,
    pub util_avg: f64,
    pub last_update_time: u64,
}

/// Load-tracking state of one scheduling entity.
///
/// Owned by whichever execution context currently updates the entity;
/// other contexts may observe copies of [`LoadSnapshot`] and must tolerate
/// them being slightly stale.
#[derive(Clone, Debug)]
pub struct PeltState {
    load_sum: f64,
    runnable_sum: f64,
    util_sum: f64,
    load_avg: f64,
    runnable_avg: f64,
    util_avg: f64,
    last_update_time: u64,
    // Time already accrued into the current, not yet complete period, in
    // us. Always < PELT_PERIOD_US.
    period_contrib: u32,
}

impl PeltState {
    /// Create the tracking state for an entity attached at time `now` (ns).
    pub fn new(now: u64) -> Self {
        Self {
            load_sum: 0.0,
            runnable_sum: 0.0,
            util_sum: 0.0,
            load_avg: 0.0,
            runnable_avg: 0.0,
            util_avg: 0.0,
            last_update_time: now,
            period_contrib: 0,
        }
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            load_avg: self.load_avg,
            runnable_avg: self.runnable_avg,
            util_avg: self.util_avg,
            last_update_time: self.last_update_time,
        }
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    /// Advance the averages to time `now` (ns) given the entity's status
    /// over the elapsed interval, using the process-wide half-life.
    ///
    /// `capacity` is the entity's current capacity in [`CAPACITY_SCALE`]
    /// units; `util_avg` accrues toward it and never exceeds it. A zero
    /// capacity pins `util_avg` at zero.
    pub fn update(
        &mut self,
        now: u64,
        running: bool,
        runnable: bool,
        capacity: u64,
    ) -> LoadSnapshot {
        self.update_with_halflife(now, running, runnable, capacity, get_pelt_halflife())
    }

    /// Same as [`PeltState::update`] with the half-life supplied by the
    /// caller instead of read from the shared cell.
    pub fn update_with_halflife(
        &mut self,
        now: u64,
        running: bool,
        runnable: bool,
        capacity: u64,
        halflife_ms: u32,
    ) -> LoadSnapshot {
        // Clock went backward or a stale call raced an earlier update.
        // Never accrue a negative interval.
        if now < self.last_update_time {
            return self.snapshot();
        }

        let delta = (now - self.last_update_time) >> 10;
        if delta == 0 {
            return self.snapshot();
        }
        // Consume only whole us; the sub-us remainder stays in the clock
        // delta of the next update.
        self.last_update_time += delta << 10;

        let runnable = runnable || running;
        let capacity = capacity.min(CAPACITY_SCALE as u64);
        let y = per_period_decay(halflife_ms.max(1));

        self.accumulate(delta, y, running, runnable, capacity);

        // The current partial period counts toward the divider so that a
        // permanently active entity sits exactly at the ceiling.
        let divider = max_sum(y) - PELT_PERIOD_US as f64 + self.period_contrib as f64;
        self.load_avg = (self.load_sum / divider * CAPACITY_SCALE).clamp(0.0, CAPACITY_SCALE);
        self.runnable_avg =
            (self.runnable_sum / divider * CAPACITY_SCALE).clamp(0.0, CAPACITY_SCALE);
        self.util_avg = (self.util_sum / divider * CAPACITY_SCALE).clamp(0.0, capacity as f64);

        self.snapshot()
    }

    // Split the elapsed us into three segments: d1 completes the period
    // that was in flight at the previous update, then come zero or more
    // whole periods, then d3 starts a new partial period. Old sums and d1
    // decay by y^periods, the k-th whole period by y^k, d3 not at all.
    // Closed-form powers keep this stable for arbitrarily long idle spans
    // where a naive repeated multiply would underflow in one step.
    fn accumulate(&mut self, delta: u64, y: f64, running: bool, runnable: bool, capacity: u64) {
        let total = self.period_contrib as u64 + delta;
        // y^p underflows to 0.0 long before p saturates; the clamp only
        // guards the cast.
        let periods = (total / PELT_PERIOD_US).min(i32::MAX as u64) as i32;
        let new_contrib = (total % PELT_PERIOD_US) as u32;

        if periods > 0 {
            let decay = y.powi(periods);
            self.load_sum *= decay;
            self.runnable_sum *= decay;
            self.util_sum *= decay;
        }

        let active = if periods == 0 {
            delta as f64
        } else {
            let d1 = (PELT_PERIOD_US - self.period_contrib as u64) as f64;
            let whole = if periods > 1 {
                PELT_PERIOD_US as f64 * y * (1.0 - y.powi(periods - 1)) / (1.0 - y)
            } else {
                0.0
            };
            d1 * y.powi(periods) + whole + new_contrib as f64
        };

        if runnable {
            self.runnable_sum += active;
        }
        if running {
            self.load_sum += active;
            self.util_sum += active * capacity as f64 / CAPACITY_SCALE;
        }

        self.period_contrib = new_contrib;
    }
}
