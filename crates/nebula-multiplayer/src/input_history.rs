//! Fixed-length history of the locally-controlled entity's inputs, indexed
//! by tick age (age 0 is the tick being processed).

use std::collections::VecDeque;

use crate::error::ProtocolViolation;
use crate::movement::InputState;

/// Default history length in ticks; the worst correction latency the client
/// tolerates.
pub const DEFAULT_INPUT_HISTORY_LENGTH: usize = 20;

/// Ring buffer of past inputs. Always holds exactly `capacity` entries;
/// ticks before the session started read as [`InputState::NONE`].
#[derive(Debug, Clone)]
pub struct InputHistory {
    entries: VecDeque<InputState>,
    capacity: usize,
}

impl InputHistory {
    /// Creates a history of `capacity` idle inputs.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: std::iter::repeat_n(InputState::NONE, capacity).collect(),
            capacity,
        }
    }

    /// Number of ticks retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records the input for a new tick; it becomes age 0 and the oldest
    /// entry falls off.
    pub fn push(&mut self, input: InputState) {
        self.entries.push_front(input);
        self.entries.truncate(self.capacity);
    }

    /// Input of the tick being processed.
    pub fn current(&self) -> InputState {
        self.entries.front().copied().unwrap_or_default()
    }

    /// Input recorded `age` ticks ago.
    pub fn get(&self, age: u32) -> Result<InputState, ProtocolViolation> {
        self.entries
            .get(age as usize)
            .copied()
            .ok_or(ProtocolViolation::InputHistoryExceeded {
                age,
                capacity: self.capacity,
            })
    }

    /// Overwrites ages `0..=age` with `input`.
    pub fn overwrite_through(&mut self, age: u32, input: InputState) -> Result<(), ProtocolViolation> {
        if age as usize >= self.capacity {
            return Err(ProtocolViolation::InputHistoryExceeded {
                age,
                capacity: self.capacity,
            });
        }
        for entry in self.entries.iter_mut().take(age as usize + 1) {
            *entry = input;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::InputDirection;

    #[test]
    fn test_age_zero_is_latest_push() {
        let mut history = InputHistory::new(4);
        let left = InputState::NONE.with(InputDirection::XDown);
        history.push(left);
        assert_eq!(history.current(), left);
        assert_eq!(history.get(0).unwrap(), left);
        assert_eq!(history.get(1).unwrap(), InputState::NONE);
    }

    #[test]
    fn test_oldest_entry_falls_off() {
        let mut history = InputHistory::new(3);
        let up = InputState::NONE.with(InputDirection::YUp);
        history.push(up);
        for _ in 0..3 {
            history.push(InputState::NONE);
        }
        for age in 0..3 {
            assert_eq!(history.get(age).unwrap(), InputState::NONE);
        }
    }

    #[test]
    fn test_age_beyond_capacity_is_fatal() {
        let history = InputHistory::new(20);
        assert!(history.get(19).is_ok());
        assert_eq!(
            history.get(25),
            Err(ProtocolViolation::InputHistoryExceeded {
                age: 25,
                capacity: 20
            })
        );
    }

    #[test]
    fn test_overwrite_through_stops_at_age() {
        let mut history = InputHistory::new(5);
        for _ in 0..5 {
            history.push(InputState::NONE);
        }
        let right = InputState::NONE.with(InputDirection::XUp);
        history.overwrite_through(2, right).unwrap();
        assert_eq!(history.get(0).unwrap(), right);
        assert_eq!(history.get(2).unwrap(), right);
        assert_eq!(history.get(3).unwrap(), InputState::NONE);
        assert!(history.overwrite_through(5, right).is_err());
    }
}
