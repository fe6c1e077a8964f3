//! Fixed-timestep tick clock.
//!
//! The clock owns the side's monotonic tick counter. Wall-clock time is
//! accumulated into a *target* tick; the simulation loop then processes
//! ticks until `current == target`. Tick adjustments move the target only,
//! so the counter itself never runs backwards: a negative adjustment makes
//! the loop hold for a few frames, a positive one makes it catch up.

use std::time::Duration;

/// A simulation tick number.
pub type Tick = u32;

/// Default simulation rate shared by client and server.
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Upper bound on ticks processed in one frame to prevent spiral-of-death.
pub const DEFAULT_MAX_TICKS_PER_FRAME: u32 = 10;

/// Returns the duration of one tick at `tick_rate_hz`.
pub fn tick_duration(tick_rate_hz: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(tick_rate_hz.max(1)))
}

/// Monotonic tick counter driven by an elapsed-time accumulator.
#[derive(Debug, Clone)]
pub struct TickClock {
    current: Tick,
    target: i64,
    tick_duration: Duration,
    accumulator: Duration,
    max_ticks_per_frame: u32,
}

impl TickClock {
    /// Creates a clock at tick 0 running at `tick_rate_hz`.
    pub fn new(tick_rate_hz: u32) -> Self {
        Self {
            current: 0,
            target: 0,
            tick_duration: tick_duration(tick_rate_hz),
            accumulator: Duration::ZERO,
            max_ticks_per_frame: DEFAULT_MAX_TICKS_PER_FRAME,
        }
    }

    /// Overrides the per-frame catch-up limit.
    pub fn with_max_ticks_per_frame(mut self, max: u32) -> Self {
        self.max_ticks_per_frame = max.max(1);
        self
    }

    /// The last tick handed out by [`advance`](Self::advance) (or the
    /// starting tick).
    pub fn current_tick(&self) -> Tick {
        self.current
    }

    /// The tick the loop is converging on. May sit below `current` while a
    /// negative adjustment is being absorbed.
    pub fn target_tick(&self) -> i64 {
        self.target
    }

    /// Duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Jumps forward to `tick` (used once, at handshake). Never moves the
    /// counter backwards.
    pub fn jump_to(&mut self, tick: Tick) {
        if tick > self.current {
            self.current = tick;
        }
        self.target = self.target.max(i64::from(self.current));
    }

    /// Adds elapsed wall-clock time and returns how many ticks the loop
    /// should process this frame.
    pub fn accumulate(&mut self, dt: Duration) -> u32 {
        self.accumulator += dt;
        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.target += 1;
        }
        self.pending_ticks()
    }

    /// Ticks owed right now, capped by the per-frame limit.
    pub fn pending_ticks(&self) -> u32 {
        let behind = self.target - i64::from(self.current);
        behind.clamp(0, i64::from(self.max_ticks_per_frame)) as u32
    }

    /// Folds a signed correction into the target tick.
    pub fn apply_adjustment(&mut self, adjustment: i32) {
        self.target += i64::from(adjustment);
    }

    /// Marks one more tick as processed and returns the new current tick.
    pub fn advance(&mut self) -> Tick {
        self.current = self.current.saturating_add(1);
        self.current
    }

    /// Number of whole ticks covering `duration`, rounded up.
    pub fn ticks_for(&self, duration: Duration) -> u32 {
        ticks_for(duration, self.tick_duration)
    }
}

/// Number of whole ticks of `tick_duration` covering `duration`, rounded up.
pub fn ticks_for(duration: Duration, tick_duration: Duration) -> u32 {
    let step = tick_duration.as_nanos().max(1);
    duration.as_nanos().div_ceil(step) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_yields_whole_ticks() {
        let mut clock = TickClock::new(30);
        let step = clock.tick_duration();
        assert_eq!(clock.accumulate(step / 2), 0);
        assert_eq!(clock.accumulate(step / 2 + step / 10), 1);
        clock.advance();
        assert_eq!(clock.pending_ticks(), 0);
        assert_eq!(clock.current_tick(), 1);
    }

    #[test]
    fn test_negative_adjustment_holds_without_rewinding() {
        let mut clock = TickClock::new(30);
        let step = clock.tick_duration();
        for _ in 0..10 {
            let n = clock.accumulate(step);
            for _ in 0..n {
                clock.advance();
            }
        }
        assert_eq!(clock.current_tick(), 10);

        clock.apply_adjustment(-3);
        assert_eq!(clock.current_tick(), 10);

        // Three frames of holding before the loop resumes.
        for _ in 0..3 {
            assert_eq!(clock.accumulate(step), 0);
        }
        assert_eq!(clock.accumulate(step), 1);
    }

    #[test]
    fn test_positive_adjustment_catches_up_in_one_frame() {
        let mut clock = TickClock::new(30);
        clock.apply_adjustment(4);
        assert_eq!(clock.accumulate(clock.tick_duration()), 5);
    }

    #[test]
    fn test_catch_up_is_capped_per_frame() {
        let mut clock = TickClock::new(60).with_max_ticks_per_frame(4);
        let owed = clock.accumulate(Duration::from_secs(1));
        assert_eq!(owed, 4);
        for _ in 0..owed {
            clock.advance();
        }
        // The remainder is still owed on the next frame.
        assert_eq!(clock.pending_ticks(), 4);
    }

    #[test]
    fn test_tick_is_monotonic_under_any_adjustments() {
        let mut clock = TickClock::new(30);
        let step = clock.tick_duration();
        let adjustments = [0, -3, 5, -7, 1, 0, -1, 12, -20, 2];
        let mut previous = clock.current_tick();

        for frame in 0..500usize {
            if frame % 17 == 0 {
                clock.apply_adjustment(adjustments[(frame / 17) % adjustments.len()]);
            }
            let owed = clock.accumulate(step);
            for _ in 0..owed {
                let now = clock.advance();
                assert!(now > previous, "tick must strictly increase on advance");
                previous = now;
            }
            assert!(clock.current_tick() >= previous);
        }
    }

    #[test]
    fn test_jump_to_never_rewinds() {
        let mut clock = TickClock::new(30);
        clock.jump_to(100);
        assert_eq!(clock.current_tick(), 100);
        clock.jump_to(40);
        assert_eq!(clock.current_tick(), 100);
        assert_eq!(clock.pending_ticks(), 0);
    }

    #[test]
    fn test_ticks_for_rounds_up() {
        let clock = TickClock::new(10);
        assert_eq!(clock.ticks_for(Duration::ZERO), 0);
        assert_eq!(clock.ticks_for(Duration::from_millis(100)), 1);
        assert_eq!(clock.ticks_for(Duration::from_millis(101)), 2);
        assert_eq!(clock.ticks_for(Duration::from_millis(1500)), 15);
    }
}
