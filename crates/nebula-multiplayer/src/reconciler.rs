//! Client-side prediction and reconciliation for the locally-controlled
//! entity.
//!
//! Every tick the reconciler records the local input, applies any server
//! correction that arrived, replays the inputs newer than the corrected tick
//! and finally simulates the current tick. Corrections bypass the
//! replication offset: the player entity must never lag its own prediction.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;
use crate::input_history::InputHistory;
use crate::movement::{Collision, InputState, MovementResolver, Position, Velocity, step};
use crate::tick::Tick;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Authoritative movement state of an entity after the server processed
/// `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementCorrection {
    /// Server tick this state describes.
    pub tick: Tick,
    /// Position after `tick`.
    pub position: Position,
    /// Velocity applied during `tick`.
    pub velocity: Velocity,
    /// Input the server used for `tick`.
    pub input: InputState,
}

/// Locally predicted movement state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PredictedState {
    /// Position after the last processed tick.
    pub position: Position,
    /// Position before the last processed tick (render interpolation source).
    pub previous_position: Position,
    /// Velocity applied in the last processed tick.
    pub velocity: Velocity,
}

impl PredictedState {
    /// A resting state at `position`.
    pub fn at(position: Position) -> Self {
        Self {
            position,
            previous_position: position,
            velocity: Velocity::default(),
        }
    }
}

/// What happened during one reconciled tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// A server correction was applied.
    pub corrected: bool,
    /// The server's input disagreed with the recorded one.
    pub input_mismatch: bool,
    /// Number of buffered inputs replayed.
    pub replayed: u32,
}

// ---------------------------------------------------------------------------
// PredictionReconciler
// ---------------------------------------------------------------------------

/// Owns the input history and the correction ordering state.
#[derive(Debug, Clone)]
pub struct PredictionReconciler {
    history: InputHistory,
    last_corrected: Option<Tick>,
    speed_per_tick: f32,
}

impl PredictionReconciler {
    /// Creates a reconciler with `history_length` ticks of input history.
    pub fn new(history_length: usize, speed_per_tick: f32) -> Self {
        Self {
            history: InputHistory::new(history_length),
            last_corrected: None,
            speed_per_tick,
        }
    }

    /// The input history.
    pub fn history(&self) -> &InputHistory {
        &self.history
    }

    /// Last server tick a correction was applied for.
    pub fn last_corrected_tick(&self) -> Option<Tick> {
        self.last_corrected
    }

    /// Movement speed used for prediction and replay.
    pub fn speed_per_tick(&self) -> f32 {
        self.speed_per_tick
    }

    /// Validates `corrections` (in arrival order) and returns the newest.
    fn latest_correction<'a>(
        &mut self,
        current_tick: Tick,
        corrections: &'a [MovementCorrection],
    ) -> Result<Option<&'a MovementCorrection>, ProtocolViolation> {
        let mut latest = None;
        for correction in corrections {
            if let Some(last) = self.last_corrected
                && correction.tick <= last
            {
                return Err(ProtocolViolation::OutOfOrderCorrection {
                    received: correction.tick,
                    last,
                });
            }
            if correction.tick > current_tick {
                return Err(ProtocolViolation::CorrectionFromFuture {
                    received: correction.tick,
                    current: current_tick,
                });
            }
            let age = current_tick - correction.tick;
            if age as usize >= self.history.capacity() {
                return Err(ProtocolViolation::InputHistoryExceeded {
                    age,
                    capacity: self.history.capacity(),
                });
            }
            self.last_corrected = Some(correction.tick);
            latest = Some(correction);
        }
        Ok(latest)
    }

    /// Processes `current_tick` for the locally-controlled entity.
    ///
    /// `local_input` is the input held this tick; `corrections` are the
    /// server movement updates for this entity received since the previous
    /// tick, in arrival order.
    pub fn tick(
        &mut self,
        current_tick: Tick,
        state: &mut PredictedState,
        collision: &Collision,
        local_input: InputState,
        corrections: &[MovementCorrection],
        resolver: &dyn MovementResolver,
    ) -> Result<ReconcileReport, ProtocolViolation> {
        self.history.push(local_input);
        state.previous_position = state.position;

        let mut report = ReconcileReport::default();
        let mut simulate_current = true;

        if let Some(correction) = self.latest_correction(current_tick, corrections)? {
            let age = current_tick - correction.tick;
            report.corrected = true;
            state.position = correction.position;
            state.velocity = correction.velocity;

            if self.history.get(age)? != correction.input {
                report.input_mismatch = true;
                self.history.overwrite_through(age, correction.input)?;
                state.previous_position = correction.position;
                tracing::debug!(
                    tick = correction.tick,
                    age,
                    "prediction used the wrong input, adopting the server's"
                );
            }

            for replay_age in (1..age).rev() {
                let input = self.history.get(replay_age)?;
                let (position, velocity) =
                    step(state.position, collision, &input, self.speed_per_tick, resolver);
                state.position = position;
                state.velocity = velocity;
                report.replayed += 1;
            }

            // A correction for the current tick already includes it.
            simulate_current = age > 0;
        }

        if simulate_current {
            let input = self.history.current();
            let (position, velocity) =
                step(state.position, collision, &input, self.speed_per_tick, resolver);
            state.position = position;
            state.velocity = velocity;
        }

        tracing::trace!(
            tick = current_tick,
            corrected = report.corrected,
            replayed = report.replayed,
            "predicted local movement"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{InputDirection, OpenWorld};

    const SPEED: f32 = 1.0;

    fn right() -> InputState {
        InputState::NONE.with(InputDirection::XUp)
    }

    fn run_ticks(
        reconciler: &mut PredictionReconciler,
        state: &mut PredictedState,
        ticks: std::ops::RangeInclusive<Tick>,
        input: InputState,
    ) {
        for tick in ticks {
            reconciler
                .tick(tick, state, &Collision::default(), input, &[], &OpenWorld)
                .unwrap();
        }
    }

    #[test]
    fn test_local_input_applies_immediately() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=1, right());
        assert_eq!(state.position.x, 1.0);
        assert_eq!(state.previous_position.x, 0.0);
    }

    #[test]
    fn test_matching_correction_replays_newer_inputs() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=10, right());
        assert_eq!(state.position.x, 10.0);

        // Server says that after tick 6 we were at x=4 (a wall it knew about).
        let correction = MovementCorrection {
            tick: 6,
            position: Position::new(4.0, 0.0, 0.0),
            velocity: Velocity { x: 1.0, y: 0.0, z: 0.0 },
            input: right(),
        };
        let report = reconciler
            .tick(11, &mut state, &Collision::default(), right(), &[correction], &OpenWorld)
            .unwrap();

        assert!(report.corrected);
        assert!(!report.input_mismatch);
        // Ticks 7..=10 replayed, then tick 11 simulated.
        assert_eq!(report.replayed, 4);
        assert_eq!(state.position.x, 9.0);
        assert_eq!(state.previous_position.x, 10.0);
    }

    #[test]
    fn test_input_mismatch_overwrites_history_and_previous_position() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=5, right());

        // The server never saw the key press: it processed tick 3 idle.
        let correction = MovementCorrection {
            tick: 3,
            position: Position::new(0.0, 0.0, 0.0),
            velocity: Velocity::default(),
            input: InputState::NONE,
        };
        let report = reconciler
            .tick(6, &mut state, &Collision::default(), right(), &[correction], &OpenWorld)
            .unwrap();

        assert!(report.input_mismatch);
        assert_eq!(state.previous_position, Position::new(0.0, 0.0, 0.0));
        for age in 0..=3 {
            assert_eq!(reconciler.history().get(age).unwrap(), InputState::NONE);
        }
        assert_eq!(reconciler.history().get(4).unwrap(), right());
        assert_eq!(state.position.x, 0.0);
    }

    #[test]
    fn test_out_of_order_correction_is_rejected() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=8, InputState::NONE);

        let at = |tick| MovementCorrection {
            tick,
            position: Position::default(),
            velocity: Velocity::default(),
            input: InputState::NONE,
        };
        reconciler
            .tick(9, &mut state, &Collision::default(), InputState::NONE, &[at(5)], &OpenWorld)
            .unwrap();

        let err = reconciler
            .tick(10, &mut state, &Collision::default(), InputState::NONE, &[at(4)], &OpenWorld)
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::OutOfOrderCorrection { received: 4, last: 5 });

        let err = reconciler
            .tick(11, &mut state, &Collision::default(), InputState::NONE, &[at(5)], &OpenWorld)
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::OutOfOrderCorrection { .. }));
    }

    #[test]
    fn test_correction_from_the_future_is_fatal() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        let correction = MovementCorrection {
            tick: 12,
            position: Position::default(),
            velocity: Velocity::default(),
            input: InputState::NONE,
        };
        let err = reconciler
            .tick(10, &mut state, &Collision::default(), InputState::NONE, &[correction], &OpenWorld)
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::CorrectionFromFuture { received: 12, current: 10 });
    }

    #[test]
    fn test_correction_older_than_history_is_fatal() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=29, InputState::NONE);

        let correction = MovementCorrection {
            tick: 5,
            position: Position::default(),
            velocity: Velocity::default(),
            input: InputState::NONE,
        };
        let err = reconciler
            .tick(30, &mut state, &Collision::default(), InputState::NONE, &[correction], &OpenWorld)
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::InputHistoryExceeded { age: 25, capacity: 20 });
    }

    #[test]
    fn test_correction_for_current_tick_is_not_simulated_twice() {
        let mut reconciler = PredictionReconciler::new(20, SPEED);
        let mut state = PredictedState::at(Position::default());
        run_ticks(&mut reconciler, &mut state, 1..=3, right());

        let correction = MovementCorrection {
            tick: 4,
            position: Position::new(7.0, 0.0, 0.0),
            velocity: Velocity { x: 1.0, y: 0.0, z: 0.0 },
            input: right(),
        };
        reconciler
            .tick(4, &mut state, &Collision::default(), right(), &[correction], &OpenWorld)
            .unwrap();
        assert_eq!(state.position.x, 7.0);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let inputs = [right(), InputState::NONE, right(), right(), InputState::NONE];
        let correction = MovementCorrection {
            tick: 3,
            position: Position::new(-2.0, 1.0, 0.0),
            velocity: Velocity::default(),
            input: right(),
        };
        let run = || {
            let mut reconciler = PredictionReconciler::new(20, 0.75);
            let mut state = PredictedState::at(Position::default());
            for (i, input) in inputs.iter().enumerate() {
                reconciler
                    .tick(i as Tick + 1, &mut state, &Collision::default(), *input, &[], &OpenWorld)
                    .unwrap();
            }
            reconciler
                .tick(6, &mut state, &Collision::default(), right(), &[correction], &OpenWorld)
                .unwrap();
            state
        };
        assert_eq!(run(), run());
    }
}
