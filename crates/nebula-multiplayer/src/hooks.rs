//! Host extension points around each phase of a simulation tick.

use bevy_ecs::prelude::*;

use crate::tick::Tick;

/// Major phases of one tick, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickPhase {
    /// Joins, disconnects and (client) entity init/delete.
    Lifecycle,
    /// Movement simulation or prediction.
    Movement,
    /// AOI recomputation (server only).
    Aoi,
    /// Cast state machine.
    Casts,
    /// Outgoing replication.
    Replication,
}

impl TickPhase {
    /// Every phase in execution order.
    pub const ALL: [TickPhase; 5] = [
        TickPhase::Lifecycle,
        TickPhase::Movement,
        TickPhase::Aoi,
        TickPhase::Casts,
        TickPhase::Replication,
    ];
}

/// Host callbacks invoked before and after each [`TickPhase`]. Both default
/// to doing nothing.
pub trait TickHooks: Send {
    /// Runs before `phase` of `tick`.
    fn before(&mut self, _phase: TickPhase, _world: &mut World, _tick: Tick) {}

    /// Runs after `phase` of `tick`.
    fn after(&mut self, _phase: TickPhase, _world: &mut World, _tick: Tick) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl TickHooks for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<(bool, TickPhase)>);

    impl TickHooks for Recorder {
        fn before(&mut self, phase: TickPhase, _world: &mut World, _tick: Tick) {
            self.0.push((true, phase));
        }
        fn after(&mut self, phase: TickPhase, _world: &mut World, _tick: Tick) {
            self.0.push((false, phase));
        }
    }

    #[test]
    fn test_default_methods_are_no_ops() {
        let mut world = World::new();
        let mut hooks = NoHooks;
        hooks.before(TickPhase::Movement, &mut world, 1);
        hooks.after(TickPhase::Movement, &mut world, 1);
        assert_eq!(world.entities().len(), 0);
    }

    #[test]
    fn test_recorder_sees_phases_in_order() {
        let mut world = World::new();
        let mut hooks = Recorder::default();
        for phase in TickPhase::ALL {
            hooks.before(phase, &mut world, 3);
            hooks.after(phase, &mut world, 3);
        }
        assert_eq!(hooks.0.len(), 10);
        assert_eq!(hooks.0[0], (true, TickPhase::Lifecycle));
        assert_eq!(hooks.0[9], (false, TickPhase::Replication));
    }
}
