// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency Domain Policy
//!
//! One [`FreqDomain`] exists per group of CPUs sharing a clock/voltage
//! rail. It owns the domain-wide policy state (frequency step table,
//! bounds, rate limit, update ownership) and the aggregation step that
//! folds the per-CPU load signals into a single normalized demand figure.
//!
//! Aggregation combines member utilizations by maximum, never by average:
//! all members run at the same frequency, so the rail must satisfy its
//! busiest CPU. Averaging would starve a bursty member while its siblings
//! idle. The combined figure is scaled by a headroom factor to leave slack
//! for demand growth between decision cycles, then clamped to 1.0.
//!
//! Ownership of frequency updates is cooperative: whichever CPU ran the
//! most recent aggregation is recorded as the only CPU whose subsequent
//! decision may be submitted. The identity lives in an atomic; there is no
//! lock and no hand-off, losers simply drop their decision.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::pelt::LoadSnapshot;
use crate::pelt::PELT_PERIOD_NS;
use crate::Cpumask;

/// Default headroom applied on top of the raw aggregated utilization.
pub const DEFAULT_HEADROOM: f64 = 1.25;

/// Default minimum interval between submitted frequency changes.
pub const DEFAULT_RATE_LIMIT_NS: u64 = 10_000_000;

const OWNER_NONE: usize = usize::MAX;

/// One member CPU's contribution to an aggregation cycle: the latest
/// tracked snapshot of its run-queue plus its current maximum capacity.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MemberSample {
    pub cpu: usize,
    pub snapshot: LoadSnapshot,
    pub capacity: u64,
}

/// Policy state for a group of CPUs sharing one adjustable clock.
#[derive(Debug)]
pub struct FreqDomain {
    id: usize,
    span: Cpumask,
    online: Cpumask,
    // Available frequency steps in kHz, ascending.
    freq_table: Vec<u64>,
    min_freq: u64,
    max_freq: u64,
    cur_freq: u64,
    rate_limit_ns: u64,
    headroom: f64,
    last_freq_update: u64,
    last_agg_time: u64,
    owner_cpu: AtomicUsize,
    // Last fresh normalized utilization seen per member, substituted when
    // a member's snapshot goes stale.
    last_member_util: BTreeMap<usize, f64>,
}

impl FreqDomain {
    /// Register a frequency domain over the CPUs in `span`.
    ///
    /// `freq_table` lists the available steps in kHz; it is sorted and
    /// deduplicated here. All members start online, the current frequency
    /// starts at the lowest step satisfying `min_freq`.
    pub fn new(
        id: usize,
        span: Cpumask,
        freq_table: Vec<u64>,
        min_freq: u64,
        max_freq: u64,
    ) -> Result<Self> {
        if span.is_empty() {
            bail!("frequency domain {} has no member CPUs", id);
        }
        if freq_table.is_empty() {
            bail!("frequency domain {} has an empty frequency table", id);
        }
        if min_freq > max_freq {
            bail!(
                "frequency domain {}: min {} kHz above max {} kHz",
                id,
                min_freq,
                max_freq
            );
        }

        let mut freq_table = freq_table;
        freq_table.sort_unstable();
        freq_table.dedup();

        let online = span.clone();
        let mut dom = Self {
            id,
            span,
            online,
            freq_table,
            min_freq,
            max_freq,
            cur_freq: 0,
            rate_limit_ns: DEFAULT_RATE_LIMIT_NS,
            headroom: DEFAULT_HEADROOM,
            last_freq_update: 0,
            last_agg_time: 0,
            owner_cpu: AtomicUsize::new(OWNER_NONE),
            last_member_util: BTreeMap::new(),
        };
        dom.cur_freq = dom.next_freq(0.0);
        Ok(dom)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn span(&self) -> &Cpumask {
        &self.span
    }

    pub fn cur_freq(&self) -> u64 {
        self.cur_freq
    }

    pub fn min_freq(&self) -> u64 {
        self.min_freq
    }

    pub fn max_freq(&self) -> u64 {
        self.max_freq
    }

    pub fn rate_limit_ns(&self) -> u64 {
        self.rate_limit_ns
    }

    pub fn last_freq_update(&self) -> u64 {
        self.last_freq_update
    }

    /// The CPU currently permitted to submit frequency changes, if any.
    pub fn owner(&self) -> Option<usize> {
        match self.owner_cpu.load(Ordering::Acquire) {
            OWNER_NONE => None,
            cpu => Some(cpu),
        }
    }

    /// Minimum interval between submitted frequency changes.
    pub fn set_rate_limit_ns(&mut self, ns: u64) {
        self.rate_limit_ns = ns;
    }

    /// Headroom factor applied to the aggregated utilization. Must be at
    /// least 1.0 (no negative slack).
    pub fn set_headroom(&mut self, headroom: f64) -> Result<()> {
        if !(1.0..=4.0).contains(&headroom) {
            bail!("headroom {} out of range 1.0-4.0", headroom);
        }
        self.headroom = headroom;
        Ok(())
    }

    /// Retune the frequency bounds, e.g. on a thermal limit change. The
    /// current frequency is re-clamped into the new range.
    pub fn set_freq_bounds(&mut self, min_freq: u64, max_freq: u64) -> Result<()> {
        if min_freq > max_freq {
            bail!(
                "frequency domain {}: min {} kHz above max {} kHz",
                self.id,
                min_freq,
                max_freq
            );
        }
        self.min_freq = min_freq;
        self.max_freq = max_freq;
        self.cur_freq = self.cur_freq.clamp(min_freq, max_freq);
        Ok(())
    }

    /// Mark a member CPU online or offline. Offline members no longer
    /// contribute to aggregation; an offline update owner loses ownership
    /// until the next aggregation re-derives it.
    pub fn set_cpu_online(&mut self, cpu: usize, online: bool) -> Result<()> {
        if !self.span.test_cpu(cpu) {
            bail!("CPU {} is not a member of frequency domain {}", cpu, self.id);
        }

        if online {
            self.online.set_cpu(cpu)?;
        } else {
            self.online.clear_cpu(cpu)?;
            self.last_member_util.remove(&cpu);
            let _ = self
                .owner_cpu
                .compare_exchange(cpu, OWNER_NONE, Ordering::AcqRel, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fold the member snapshots into one normalized demand figure in
    /// `[0, 1]` and record `cpu` as the domain's update owner.
    ///
    /// A member snapshot trailing `now` by more than one sampling period
    /// is treated as unknown-but-nonzero: its last fresh value stands in,
    /// so a transient stale reading cannot fake idleness in the middle of
    /// a burst.
    pub fn aggregate(&mut self, samples: &[MemberSample], now: u64, cpu: usize) -> f64 {
        let stale_before = now.saturating_sub(PELT_PERIOD_NS);

        let mut utils = Vec::with_capacity(samples.len());
        for sample in samples {
            if !self.online.test_cpu(sample.cpu) {
                continue;
            }

            let measured = if sample.capacity == 0 {
                0.0
            } else {
                sample.snapshot.util_avg / sample.capacity as f64
            };

            if sample.snapshot.last_update_time < stale_before {
                utils.push(*self.last_member_util.get(&sample.cpu).unwrap_or(&measured));
            } else {
                self.last_member_util.insert(sample.cpu, measured);
                utils.push(measured);
            }
        }

        let raw = utils
            .into_iter()
            .max_by_key(|u| OrderedFloat(*u))
            .unwrap_or(0.0);

        if self.span.test_cpu(cpu) {
            self.owner_cpu.store(cpu, Ordering::Release);
        } else {
            debug!(
                "dom {}: aggregation ran on non-member CPU {}, owner unchanged",
                self.id, cpu
            );
        }
        if now > self.last_agg_time {
            self.last_agg_time = now;
        }

        (raw * self.headroom).clamp(0.0, 1.0)
    }

    /// Map a normalized utilization to the smallest available frequency
    /// step that satisfies it, respecting the domain bounds. The mapping
    /// rounds up: under-provisioning risks missed deadlines while
    /// over-provisioning only costs power.
    pub fn next_freq(&self, util: f64) -> u64 {
        let required = (util.clamp(0.0, 1.0) * self.max_freq as f64).ceil() as u64;
        let step = self
            .freq_table
            .iter()
            .copied()
            .find(|&f| f >= required)
            .unwrap_or(*self.freq_table.last().unwrap());
        step.clamp(self.min_freq, self.max_freq)
    }

    pub(crate) fn note_freq_update(&mut self, target: u64, now: u64) {
        self.cur_freq = target;
        self.last_freq_update = now;
    }
}
