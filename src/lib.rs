// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Load tracking and frequency selection for userspace schedulers
//!
//! This crate is the signal -> decision pipeline a CPU scheduler uses to
//! drive frequency scaling: estimate how busy each scheduling entity and
//! each CPU is, fold those estimates into a per-clock-domain demand
//! figure, and turn that figure into a frequency request.
//!
//! The pipeline has three stages, each a module:
//!
//! ## Load Signal Tracker
//!
//! [`pelt`] maintains per-entity decaying averages of running, runnable
//! and capacity-occupied time over fixed 1024us sampling periods, with a
//! process-wide configurable half-life. Updates are pure state transitions
//! over caller-supplied monotonic timestamps; the tracker never reads a
//! clock, takes no locks and cannot fail.
//!
//! ## Utilization Aggregator
//!
//! [`FreqDomain`] describes a group of CPUs sharing one clock/voltage
//! rail and folds their tracked signals into a single normalized demand
//! figure: the maximum across members (a shared rail must satisfy its
//! busiest CPU), scaled by a headroom factor and clamped to 1.0. Stale
//! member snapshots are substituted with their last known value so a lost
//! update cannot fake idleness.
//!
//! ## Frequency Governor
//!
//! [`Governor`] maps demand to the smallest frequency step that satisfies
//! it, applies iowait boosting and per-domain rate limiting, and enforces
//! the cooperative update-ownership rule: only the CPU that ran the last
//! aggregation may submit, everyone else's decision is a no-op. The
//! outcome is a [`Decision`] for the driver layer that programs hardware.
//!
//! Nothing here blocks, retries or suspends; concurrency reduces to two
//! atomics (the half-life cell and the per-domain owner identity), which
//! is what lets the hot scheduling path call in without heavyweight
//! locking.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

pub mod pelt;
pub use pelt::get_pelt_halflife;
pub use pelt::set_pelt_halflife;
pub use pelt::LoadSnapshot;
pub use pelt::PeltState;

mod domain;
pub use domain::FreqDomain;
pub use domain::MemberSample;
pub use domain::DEFAULT_HEADROOM;
pub use domain::DEFAULT_RATE_LIMIT_NS;

mod governor;
pub use governor::Decision;
pub use governor::GovState;
pub use governor::Governor;
pub use governor::DEFAULT_BOOST_WINDOW_NS;
pub use governor::IOWAIT_BOOST_MIN;

mod stats;
pub use stats::Metrics;
