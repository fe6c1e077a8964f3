//! Replication-tick offset: remote-entity state is applied a few ticks
//! behind the local clock so jitter never stalls local prediction.

use std::collections::VecDeque;

use crate::adjustment::replication_offset_delta;
use crate::error::ProtocolViolation;
use crate::input_history::DEFAULT_INPUT_HISTORY_LENGTH;
use crate::tick::Tick;

/// Default offset in ticks.
pub const DEFAULT_REPLICATION_OFFSET: i32 = offset_for_history(DEFAULT_INPUT_HISTORY_LENGTH);

/// Least negative offset that stays negative after adjustments pulling the
/// client back by a full input history. Each adjustment moves the offset by
/// twice its size, so that takes `2 * history_length + 1` ticks.
pub const fn offset_for_history(history_length: usize) -> i32 {
    let max = (i32::MAX / 2) as usize;
    let len = (if history_length > max { max } else { history_length }) as i32;
    -(2 * len) - 1
}

/// Signed distance between the local tick and the tick whose remote state
/// may be applied. Always strictly negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationOffset {
    offset: i32,
}

impl ReplicationOffset {
    /// Creates an offset, rejecting values that are not negative.
    pub fn new(initial: i32) -> Result<Self, ProtocolViolation> {
        if initial >= 0 {
            return Err(ProtocolViolation::NonNegativeReplicationOffset(initial));
        }
        Ok(Self { offset: initial })
    }

    /// Current offset.
    pub fn get(&self) -> i32 {
        self.offset
    }

    /// Folds a tick adjustment in (doubled and negated). Leaves the offset
    /// untouched on error.
    pub fn apply_adjustment(&mut self, adjustment: i32) -> Result<i32, ProtocolViolation> {
        let next = self.offset.saturating_add(replication_offset_delta(adjustment));
        if next >= 0 {
            return Err(ProtocolViolation::NonNegativeReplicationOffset(next));
        }
        self.offset = next;
        Ok(next)
    }

    /// Highest remote tick that may be applied while the local clock is at
    /// `current`, or `None` before any remote tick is due.
    pub fn desired_apply_tick(&self, current: Tick) -> Option<Tick> {
        let desired = i64::from(current) + i64::from(self.offset);
        (desired >= 0).then_some(desired as Tick)
    }
}

// ---------------------------------------------------------------------------
// TickQueue
// ---------------------------------------------------------------------------

/// A queue of tick-stamped items popped strictly from the front in
/// non-decreasing tick order. Items with equal ticks keep arrival order.
#[derive(Debug, Clone)]
pub struct TickQueue<T> {
    items: VecDeque<(Tick, T)>,
}

impl<T> Default for TickQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> TickQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `item` after every queued item with a tick `<= tick`.
    pub fn push(&mut self, tick: Tick, item: T) {
        if self.items.back().is_none_or(|(last, _)| *last <= tick) {
            self.items.push_back((tick, item));
            return;
        }
        let at = self.items.partition_point(|(t, _)| *t <= tick);
        self.items.insert(at, (tick, item));
    }

    /// Tick of the front item.
    pub fn peek_tick(&self) -> Option<Tick> {
        self.items.front().map(|(t, _)| *t)
    }

    /// Pops the front item if its tick is `<= up_to`.
    pub fn pop_due(&mut self, up_to: Tick) -> Option<(Tick, T)> {
        if self.peek_tick()? <= up_to {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Pops every item with tick `<= up_to`.
    pub fn drain_due(&mut self, up_to: Tick) -> Vec<(Tick, T)> {
        let mut out = Vec::new();
        while let Some(item) = self.pop_due(up_to) {
            out.push(item);
        }
        out
    }

    /// Pops every item with exactly `tick`, assuming nothing older remains.
    pub fn drain_tick(&mut self, tick: Tick) -> Vec<T> {
        let mut out = Vec::new();
        while self.peek_tick() == Some(tick) {
            if let Some((_, item)) = self.items.pop_front() {
                out.push(item);
            }
        }
        out
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every queued item.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
