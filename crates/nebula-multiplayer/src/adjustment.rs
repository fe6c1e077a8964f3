//! Tick adjustment protocol.
//!
//! The server keeps, per connection, a bounded history of *tick diffs*: the
//! tick stamped on a just-received client message minus the server's tick at
//! receipt. Periodically it takes a trimmed mean of the fresh samples and, if
//! the client is outside tolerance of the desired lead, emits a signed
//! one-tick-resolution [`TickAdjustment`] tagged with a new iteration.
//!
//! Samples carry the adjustment iteration the client had applied when it
//! stamped the message, so samples produced before the client saw the last
//! correction are never counted against it a second time.
//!
//! The history is the one structure shared between the receive path and the
//! tick loop. It sits behind a single mutex; readers copy it out and do the
//! math unlocked.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::tick::Tick;

/// Default number of tick-diff samples kept per connection.
pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Tunable thresholds for the adjustment heuristic. Policy, not protocol:
/// any values keep the protocol correct, they only change how eagerly the
/// server corrects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentPolicy {
    /// Samples retained per connection.
    pub history_capacity: usize,
    /// Fresh samples required before an adjustment is considered.
    pub min_fresh_samples: usize,
    /// Fraction trimmed from *each* end of the sorted samples (0.0..0.5).
    pub trim_fraction: f64,
    /// Desired `client_tick - server_tick` at receipt.
    pub target_lead: i32,
    /// Allowed deviation from `target_lead` before correcting.
    pub tolerance: i32,
    /// Ticks between adjustment evaluations.
    pub interval_ticks: u32,
}

impl Default for AdjustmentPolicy {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            min_fresh_samples: 10,
            trim_fraction: 0.2,
            target_lead: 2,
            tolerance: 1,
            interval_ticks: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire type
// ---------------------------------------------------------------------------

/// A correction the client folds into its target tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickAdjustment {
    /// Signed tick count to add to the client's target tick.
    pub adjustment: i32,
    /// Per-connection sequence number of this correction, starting at 1.
    pub iteration: u32,
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// One observation of client-vs-server tick alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickDiffSample {
    /// `client_tick - server_tick` at receipt.
    pub diff: i32,
    /// Adjustment iteration the client had applied when it sent the message.
    pub iteration: u32,
}

#[derive(Debug)]
struct HistoryState {
    samples: VecDeque<TickDiffSample>,
    capacity: usize,
    iteration: u32,
}

/// Per-connection tick-diff history. `Send + Sync`; share it with the
/// receive path through an `Arc`.
#[derive(Debug)]
pub struct TickDiffHistory {
    state: Mutex<HistoryState>,
}

impl TickDiffHistory {
    /// Creates an empty history holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(HistoryState {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                iteration: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sample. Called from the receive path.
    pub fn record(&self, client_tick: Tick, server_tick: Tick, client_iteration: u32) {
        let diff = (i64::from(client_tick) - i64::from(server_tick))
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let mut state = self.lock();
        if state.samples.len() >= state.capacity {
            state.samples.pop_front();
        }
        state.samples.push_back(TickDiffSample {
            diff,
            iteration: client_iteration,
        });
    }

    /// Iteration of the last adjustment emitted (0 before the first).
    pub fn iteration(&self) -> u32 {
        self.lock().iteration
    }

    /// Copies the samples and current iteration out of the lock.
    pub fn snapshot(&self) -> (Vec<TickDiffSample>, u32) {
        let state = self.lock();
        (state.samples.iter().copied().collect(), state.iteration)
    }

    /// Evaluates the fresh samples and, if a correction is due, bumps the
    /// iteration and returns it. Returns `None` when there are too few fresh
    /// samples or the client is within tolerance.
    pub fn compute_adjustment(&self, policy: &AdjustmentPolicy) -> Option<TickAdjustment> {
        let (samples, iteration) = self.snapshot();
        let fresh: Vec<i32> = samples
            .iter()
            .filter(|s| s.iteration == iteration)
            .map(|s| s.diff)
            .collect();
        let adjustment = evaluate(&fresh, policy)?;

        let mut state = self.lock();
        // Another evaluator got there first; its correction is in flight.
        if state.iteration != iteration {
            return None;
        }
        state.iteration += 1;
        Some(TickAdjustment {
            adjustment,
            iteration: state.iteration,
        })
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Returns `true` if no samples are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mean of `values` after discarding `trim_fraction` of the sorted samples
/// from each end. `None` for an empty input.
pub fn trimmed_mean(values: &[i32], trim_fraction: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let trim = ((sorted.len() as f64) * trim_fraction.clamp(0.0, 0.49)).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    let sum: i64 = kept.iter().map(|&v| i64::from(v)).sum();
    Some(sum as f64 / kept.len() as f64)
}

/// Pure adjustment decision over fresh samples.
pub fn evaluate(fresh: &[i32], policy: &AdjustmentPolicy) -> Option<i32> {
    if fresh.len() < policy.min_fresh_samples.max(1) {
        return None;
    }
    let mean = trimmed_mean(fresh, policy.trim_fraction)?;
    let error = mean - f64::from(policy.target_lead);
    if error.abs() <= f64::from(policy.tolerance) {
        return None;
    }
    let correction = -(error.round() as i32);
    (correction != 0).then_some(correction)
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client-side bookkeeping: applies each iteration exactly once.
#[derive(Debug, Clone, Default)]
pub struct AdjustmentTracker {
    last_iteration: u32,
    accumulated: i64,
}

impl AdjustmentTracker {
    /// Creates a tracker that has applied nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Iteration of the last applied adjustment; stamped on outgoing
    /// messages.
    pub fn last_iteration(&self) -> u32 {
        self.last_iteration
    }

    /// Sum of all applied adjustments.
    pub fn accumulated(&self) -> i64 {
        self.accumulated
    }

    /// Returns the adjustment to apply, or `None` for a stale or duplicate
    /// iteration.
    pub fn accept(&mut self, adjustment: TickAdjustment) -> Option<i32> {
        if adjustment.iteration <= self.last_iteration {
            tracing::trace!(
                iteration = adjustment.iteration,
                last = self.last_iteration,
                "ignoring stale tick adjustment"
            );
            return None;
        }
        self.last_iteration = adjustment.iteration;
        self.accumulated += i64::from(adjustment.adjustment);
        Some(adjustment.adjustment)
    }
}

/// Converts a tick adjustment into the change applied to the replication
/// offset. The server's view is stale by the same one-way latency the client
/// runs ahead by, so the correction counts twice and in the other direction.
pub fn replication_offset_delta(adjustment: i32) -> i32 {
    adjustment.saturating_mul(-2)
}
