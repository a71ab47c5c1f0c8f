// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency Governor
//!
//! Turns a frequency domain's aggregated utilization into frequency
//! requests. Each decision cycle is a short, self-contained computation:
//! no blocking, no retries, no callbacks. Time only enters as comparisons
//! against caller-supplied monotonic timestamps.
//!
//! The governor moves between three states. `Idle` until the domain shows
//! demand, `Active` while it does, and `Boosted` while an iowait boost is
//! live: a task that just unblocked from I/O signals imminent demand the
//! utilization average has not caught up with yet, so the target is
//! floored by an escalating boost fraction that decays back once the
//! condition stops renewing.
//!
//! Submissions are rate limited per domain and gated by the cooperative
//! update-ownership rule: only the CPU recorded by the last aggregation
//! may submit, every other CPU's decision is discarded as a no-op. A
//! decision blocked by the rate limit is reported as deferred rather than
//! silently dropped; the next cycle recomputes from fresh utilization, so
//! no demand is lost.

use log::debug;
use log::trace;
use serde::Serialize;

use crate::domain::FreqDomain;
use crate::stats::Metrics;

/// Boost fraction installed by the first iowait event; successive events
/// double it up to 1.0.
pub const IOWAIT_BOOST_MIN: f64 = 0.125;

/// Default window after which an unrenewed boost expires outright.
pub const DEFAULT_BOOST_WINDOW_NS: u64 = 4_000_000;

/// Governor state for one frequency domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum GovState {
    Idle,
    Active,
    Boosted,
}

/// Outcome of one decision cycle, handed to the driver layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum Decision {
    /// Program `freq` kHz on domain `dom`; `cpu` is the member authorized
    /// to submit.
    Submit { dom: usize, freq: u64, cpu: usize },
    /// Target computed but blocked by the rate limit; re-evaluated with
    /// fresh utilization on the next cycle.
    Deferred { freq: u64 },
    /// Target equals the current frequency.
    Unchanged,
    /// The deciding CPU does not own domain updates; dropped without
    /// retry.
    NotOwner,
}

pub struct Governor {
    state: GovState,
    boost: f64,
    boost_last_event: u64,
    // A boost armed since the last decision exempts that decision from
    // the rate limit.
    boost_armed: bool,
    boost_window_ns: u64,
    zero_util_since: Option<u64>,
    metrics: Metrics,
}

impl Governor {
    pub fn new(dom_id: usize) -> Self {
        Self {
            state: GovState::Idle,
            boost: 0.0,
            boost_last_event: 0,
            boost_armed: false,
            boost_window_ns: DEFAULT_BOOST_WINDOW_NS,
            zero_util_since: None,
            metrics: Metrics::new(dom_id),
        }
    }

    pub fn state(&self) -> GovState {
        self.state
    }

    pub fn iowait_boost_active(&self) -> bool {
        self.boost > 0.0
    }

    pub fn set_boost_window_ns(&mut self, ns: u64) {
        self.boost_window_ns = ns;
    }

    /// Record an iowait wakeup on the domain at time `now`: a task became
    /// runnable after blocking on I/O. Arms the boost at its minimum or
    /// doubles an already-armed one.
    pub fn iowait_boost(&mut self, now: u64) {
        self.boost = if self.boost <= 0.0 {
            IOWAIT_BOOST_MIN
        } else {
            (self.boost * 2.0).min(1.0)
        };
        self.boost_last_event = now;
        self.boost_armed = true;
        trace!("iowait boost armed at {:.3}", self.boost);
    }

    /// Clear the boost, recording the reset time. With `requested_state`
    /// the boost is re-armed at its minimum instead of cleared, covering
    /// the wakeup-from-io-after-long-idle path. Returns whether a boost
    /// was actually active, so a no-op reset is distinguishable from a
    /// real one.
    pub fn reset_iowait_boost(&mut self, now: u64, requested_state: bool) -> bool {
        let was_active = self.boost > 0.0;
        self.boost = if requested_state { IOWAIT_BOOST_MIN } else { 0.0 };
        self.boost_last_event = now;
        self.boost_armed = requested_state;
        if was_active {
            self.metrics.boost_resets.increment(1);
        }
        was_active
    }

    // Consume or decay the boost for one decision cycle and return the
    // fraction to apply. An unrenewed boost halves per cycle and expires
    // outright past the boost window; decaying beats dropping abruptly
    // when I/O completions arrive just slower than decision cycles.
    fn boost_apply(&mut self, now: u64) -> f64 {
        if self.boost <= 0.0 {
            return 0.0;
        }

        if now.saturating_sub(self.boost_last_event) > self.boost_window_ns {
            self.boost = 0.0;
            self.boost_armed = false;
            return 0.0;
        }

        if !self.boost_armed {
            self.boost /= 2.0;
            if self.boost < IOWAIT_BOOST_MIN {
                self.boost = 0.0;
            }
        }
        self.boost
    }

    fn advance_state(&mut self, domain: &FreqDomain, util: f64, boosted: bool, now: u64) {
        if util > 0.0 {
            self.zero_util_since = None;
        }

        self.state = if boosted {
            GovState::Boosted
        } else {
            match self.state {
                GovState::Idle if util > 0.0 => GovState::Active,
                GovState::Idle => GovState::Idle,
                // Boost gone, fall back to plain demand tracking.
                GovState::Boosted | GovState::Active => {
                    if util > 0.0 {
                        GovState::Active
                    } else {
                        let since = *self.zero_util_since.get_or_insert(now);
                        if now.saturating_sub(since) >= domain.rate_limit_ns() {
                            GovState::Idle
                        } else {
                            GovState::Active
                        }
                    }
                }
            }
        };
    }

    /// Run one decision cycle for `domain` at time `now` on CPU `cpu`,
    /// with `util` the aggregated utilization of the current cycle.
    pub fn decide(
        &mut self,
        domain: &mut FreqDomain,
        util: f64,
        now: u64,
        cpu: usize,
    ) -> Decision {
        if domain.owner() != Some(cpu) {
            self.metrics.ownership_discards.increment(1);
            return Decision::NotOwner;
        }

        // The exemption belongs to the cycle that armed the boost, and
        // only if the boost survived until the cycle ran.
        let boost = self.boost_apply(now);
        let rate_limit_exempt = self.boost_armed && boost > 0.0;
        self.boost_armed = false;

        self.advance_state(domain, util, boost > 0.0, now);

        let effective = util.max(boost);
        let target = domain.next_freq(effective);
        self.metrics.domain_util.set(effective);

        if target == domain.cur_freq() {
            self.metrics.unchanged_decisions.increment(1);
            return Decision::Unchanged;
        }

        let elapsed = now.saturating_sub(domain.last_freq_update());
        if elapsed < domain.rate_limit_ns() && !rate_limit_exempt {
            self.metrics.deferred_updates.increment(1);
            trace!(
                "dom {}: target {} kHz deferred, {}ns into rate limit",
                domain.id(),
                target,
                elapsed
            );
            return Decision::Deferred { freq: target };
        }

        domain.note_freq_update(target, now);
        self.metrics.submitted_updates.increment(1);
        self.metrics.cur_freq_khz.set(target as f64);
        debug!(
            "dom {}: {} kHz (util {:.3}, boost {:.3}, {:?})",
            domain.id(),
            target,
            util,
            boost,
            self.state
        );
        Decision::Submit {
            dom: domain.id(),
            freq: target,
            cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pelt::LoadSnapshot;
    use crate::Cpumask;
    use crate::MemberSample;

    const MS: u64 = 1_000_000;

    fn domain() -> FreqDomain {
        let span = Cpumask::from_cpulist("0-1", 2).unwrap();
        let mut dom = FreqDomain::new(
            0,
            span,
            vec![400_000, 800_000, 1_200_000, 1_600_000, 2_000_000],
            400_000,
            2_000_000,
        )
        .unwrap();
        dom.set_rate_limit_ns(10 * MS);
        dom
    }

    fn sample(cpu: usize, util: f64, t: u64) -> MemberSample {
        MemberSample {
            cpu,
            snapshot: LoadSnapshot {
                load_avg: util * 1024.0,
                runnable_avg: util * 1024.0,
                util_avg: util * 1024.0,
                last_update_time: t,
            },
            capacity: 1024,
        }
    }

    // Aggregate on `cpu` so it owns the subsequent decision.
    fn own(dom: &mut FreqDomain, util: f64, now: u64, cpu: usize) -> f64 {
        dom.aggregate(&[sample(cpu, util, now)], now, cpu)
    }

    #[test]
    fn only_the_owner_submits() {
        let mut dom = domain();
        let mut gov = Governor::new(0);

        let util = own(&mut dom, 0.5, 100 * MS, 0);
        assert_eq!(
            gov.decide(&mut dom, util, 100 * MS, 1),
            Decision::NotOwner
        );
        assert!(matches!(
            gov.decide(&mut dom, util, 100 * MS, 0),
            Decision::Submit { cpu: 0, .. }
        ));
    }

    #[test]
    fn rate_limit_defers_then_incorporates_fresh_demand() {
        let mut dom = domain();
        let mut gov = Governor::new(0);
        let t0 = 100 * MS;

        let util = own(&mut dom, 0.3, t0, 0);
        assert!(matches!(
            gov.decide(&mut dom, util, t0, 0),
            Decision::Submit { .. }
        ));

        // Second cycle inside the rate limit: deferred, not dropped.
        let t1 = t0 + 2 * MS;
        let util = own(&mut dom, 0.9, t1, 0);
        assert_eq!(
            gov.decide(&mut dom, util, t1, 0),
            Decision::Deferred { freq: 2_000_000 }
        );
        assert_eq!(dom.cur_freq(), 800_000);

        // Third cycle past the limit uses the latest demand, not a stale
        // cached target.
        let t2 = t0 + 11 * MS;
        let util = own(&mut dom, 0.6, t2, 0);
        assert_eq!(
            gov.decide(&mut dom, util, t2, 0),
            Decision::Submit {
                dom: 0,
                freq: 1_600_000,
                cpu: 0
            }
        );
    }

    #[test]
    fn unchanged_target_is_not_a_submission() {
        let mut dom = domain();
        let mut gov = Governor::new(0);
        let t0 = 100 * MS;

        let util = own(&mut dom, 0.3, t0, 0);
        gov.decide(&mut dom, util, t0, 0);
        let last = dom.last_freq_update();

        let t1 = t0 + 20 * MS;
        let util = own(&mut dom, 0.3, t1, 0);
        assert_eq!(gov.decide(&mut dom, util, t1, 0), Decision::Unchanged);
        // The rate-limit window does not restart on an unchanged target.
        assert_eq!(dom.last_freq_update(), last);
    }

    #[test]
    fn state_machine_transitions() {
        let mut dom = domain();
        let mut gov = Governor::new(0);
        assert_eq!(gov.state(), GovState::Idle);

        let t0 = 100 * MS;
        let util = own(&mut dom, 0.4, t0, 0);
        gov.decide(&mut dom, util, t0, 0);
        assert_eq!(gov.state(), GovState::Active);

        // Iowait boost lifts Active to Boosted.
        gov.iowait_boost(t0 + MS);
        let util = own(&mut dom, 0.4, t0 + MS, 0);
        gov.decide(&mut dom, util, t0 + MS, 0);
        assert_eq!(gov.state(), GovState::Boosted);

        // Window expiry drops back to Active.
        let t1 = t0 + MS + DEFAULT_BOOST_WINDOW_NS + MS;
        let util = own(&mut dom, 0.4, t1, 0);
        gov.decide(&mut dom, util, t1, 0);
        assert_eq!(gov.state(), GovState::Active);

        // Utilization pinned at zero for a full rate-limit interval goes
        // Idle; a shorter gap does not.
        let t2 = t1 + MS;
        let util = own(&mut dom, 0.0, t2, 0);
        gov.decide(&mut dom, util, t2, 0);
        assert_eq!(gov.state(), GovState::Active);

        let t3 = t2 + 10 * MS;
        let util = own(&mut dom, 0.0, t3, 0);
        gov.decide(&mut dom, util, t3, 0);
        assert_eq!(gov.state(), GovState::Idle);
    }

    #[test]
    fn boost_escalates_and_decays() {
        let mut gov = Governor::new(0);
        gov.iowait_boost(0);
        assert_eq!(gov.boost_apply(0), IOWAIT_BOOST_MIN);
        gov.boost_armed = false;

        gov.iowait_boost(MS);
        gov.iowait_boost(2 * MS);
        assert_eq!(gov.boost_apply(2 * MS), 0.5);
        gov.boost_armed = false;

        // Unrenewed cycles halve the fraction, then clear it.
        assert_eq!(gov.boost_apply(2 * MS + MS / 2), 0.25);
        assert_eq!(gov.boost_apply(3 * MS), 0.125);
        assert_eq!(gov.boost_apply(3 * MS + MS / 2), 0.0);
        assert!(!gov.iowait_boost_active());
    }

    #[test]
    fn boost_floors_the_target() {
        let mut dom = domain();
        let mut gov = Governor::new(0);
        let t0 = 100 * MS;

        // A submission at t0 opens a rate-limit window.
        dom.note_freq_update(400_000, t0);

        // Escalate the boost to 0.5; raw demand alone would stay at the
        // lowest step.
        gov.iowait_boost(t0 + MS);
        gov.iowait_boost(t0 + MS);
        gov.iowait_boost(t0 + MS);

        // The arming cycle is floored by the boost and exempt from the
        // still-open rate limit.
        let t1 = t0 + 2 * MS;
        let util = own(&mut dom, 0.05, t1, 0);
        assert_eq!(
            gov.decide(&mut dom, util, t1, 0),
            Decision::Submit {
                dom: 0,
                freq: 1_200_000,
                cpu: 0
            }
        );
    }

    #[test]
    fn boost_reset_reports_previous_state() {
        let mut gov = Governor::new(0);

        // Resetting an unboosted governor reports as a no-op and leaves
        // the state unchanged.
        assert!(!gov.reset_iowait_boost(0, false));
        assert!(!gov.iowait_boost_active());

        gov.iowait_boost(MS);
        assert!(gov.reset_iowait_boost(2 * MS, false));
        assert!(!gov.iowait_boost_active());

        // requested_state re-arms at the minimum.
        gov.iowait_boost(3 * MS);
        assert!(gov.reset_iowait_boost(4 * MS, true));
        assert_eq!(gov.boost_apply(4 * MS), IOWAIT_BOOST_MIN);
    }
}
