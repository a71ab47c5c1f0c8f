// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Diagnostic counters and gauges for the governor, pre-registered
//! against the process-wide `metrics` recorder. Ownership mismatches and
//! rate-limit deferrals are defined no-ops rather than errors, so the
//! counters here are the only place they are observable.

use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

pub struct Metrics {
    pub ownership_discards: Counter,
    pub deferred_updates: Counter,
    pub submitted_updates: Counter,
    pub unchanged_decisions: Counter,
    pub boost_resets: Counter,
    pub cur_freq_khz: Gauge,
    pub domain_util: Gauge,
}

impl Metrics {
    pub fn new(dom_id: usize) -> Self {
        let dom = dom_id.to_string();
        Self {
            ownership_discards: counter!("freq_decisions_total", "dom" => dom.clone(), "result" => "not_owner"),
            deferred_updates: counter!("freq_decisions_total", "dom" => dom.clone(), "result" => "deferred"),
            submitted_updates: counter!("freq_decisions_total", "dom" => dom.clone(), "result" => "submitted"),
            unchanged_decisions: counter!("freq_decisions_total", "dom" => dom.clone(), "result" => "unchanged"),
            boost_resets: counter!("iowait_boost_resets_total", "dom" => dom.clone()),
            cur_freq_khz: gauge!("domain_cur_freq_khz", "dom" => dom.clone()),
            domain_util: gauge!("domain_util", "dom" => dom),
        }
    }
}
