//! Deterministic movement shared by server simulation, client prediction and
//! reconciliation replay.
//!
//! [`step`] is the only function that turns an input into displacement. Both
//! sides must call it with identical arguments for prediction to hold; it
//! performs no I/O and depends on nothing but its parameters.

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Spatial primitives
// ---------------------------------------------------------------------------

/// World-space position in world units.
#[derive(Component, Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
}

impl Position {
    /// Creates a new position.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared euclidean distance to `other`.
    pub fn distance_squared(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Position) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Returns `true` if `other` lies within `radius` (inclusive).
    pub fn within(&self, other: &Position, radius: f32) -> bool {
        self.distance_squared(other) <= radius * radius
    }
}

/// Per-tick displacement last applied to an entity.
#[derive(Component, Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    /// X displacement per tick.
    pub x: f32,
    /// Y displacement per tick.
    pub y: f32,
    /// Z displacement per tick.
    pub z: f32,
}

impl Velocity {
    /// Returns `true` if the entity is not moving.
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum corner.
    pub min: Position,
    /// Maximum corner.
    pub max: Position,
}

impl BoundingBox {
    /// A box of the given half extents centred on `center`.
    pub fn centered(center: Position, half_extents: [f32; 3]) -> Self {
        Self {
            min: Position::new(
                center.x - half_extents[0],
                center.y - half_extents[1],
                center.z - half_extents[2],
            ),
            max: Position::new(
                center.x + half_extents[0],
                center.y + half_extents[1],
                center.z + half_extents[2],
            ),
        }
    }

    /// Centre of the box.
    pub fn center(&self) -> Position {
        Position::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// The box moved by `velocity`.
    pub fn translated(&self, velocity: &Velocity) -> Self {
        Self {
            min: Position::new(
                self.min.x + velocity.x,
                self.min.y + velocity.y,
                self.min.z + velocity.z,
            ),
            max: Position::new(
                self.max.x + velocity.x,
                self.max.y + velocity.y,
                self.max.z + velocity.z,
            ),
        }
    }
}

/// Collision volume of an entity, expressed as half extents around its
/// [`Position`].
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    /// Half extents along x, y, z.
    pub half_extents: [f32; 3],
}

impl Default for Collision {
    fn default() -> Self {
        Self {
            half_extents: [0.5, 0.5, 0.5],
        }
    }
}

impl Collision {
    /// Bounding box of this volume at `position`.
    pub fn bounds_at(&self, position: Position) -> BoundingBox {
        BoundingBox::centered(position, self.half_extents)
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One movement key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InputDirection {
    /// +X.
    XUp = 1 << 0,
    /// -X.
    XDown = 1 << 1,
    /// +Y.
    YUp = 1 << 2,
    /// -Y.
    YDown = 1 << 3,
    /// +Z.
    ZUp = 1 << 4,
    /// -Z.
    ZDown = 1 << 5,
}

/// Held movement keys for one tick.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InputState {
    bits: u8,
}

impl InputState {
    /// No keys held.
    pub const NONE: InputState = InputState { bits: 0 };

    /// Returns a copy with `direction` pressed.
    pub fn with(mut self, direction: InputDirection) -> Self {
        self.set(direction, true);
        self
    }

    /// Presses or releases `direction`.
    pub fn set(&mut self, direction: InputDirection, pressed: bool) {
        if pressed {
            self.bits |= direction as u8;
        } else {
            self.bits &= !(direction as u8);
        }
    }

    /// Returns `true` if `direction` is held.
    pub fn is_pressed(&self, direction: InputDirection) -> bool {
        self.bits & direction as u8 != 0
    }

    fn axis(&self, up: InputDirection, down: InputDirection) -> f32 {
        match (self.is_pressed(up), self.is_pressed(down)) {
            (true, false) => 1.0,
            (false, true) => -1.0,
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Collision resolution
// ---------------------------------------------------------------------------

/// Resolves a desired move against the world. Must be pure: identical
/// arguments always produce identical results.
pub trait MovementResolver {
    /// Returns where an entity occupying `current` ends up when it tries to
    /// occupy `desired`.
    fn resolve(&self, current: &BoundingBox, desired: &BoundingBox) -> BoundingBox;
}

/// No obstacles.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWorld;

impl MovementResolver for OpenWorld {
    fn resolve(&self, _current: &BoundingBox, desired: &BoundingBox) -> BoundingBox {
        *desired
    }
}

/// A world bounded by axis-aligned walls: movement slides along them.
#[derive(Debug, Clone, Copy)]
pub struct BoundedWorld {
    /// Minimum world corner.
    pub min: Position,
    /// Maximum world corner.
    pub max: Position,
}

impl MovementResolver for BoundedWorld {
    fn resolve(&self, _current: &BoundingBox, desired: &BoundingBox) -> BoundingBox {
        let shift = |lo: f32, hi: f32, world_lo: f32, world_hi: f32| -> f32 {
            if lo < world_lo {
                world_lo - lo
            } else if hi > world_hi {
                world_hi - hi
            } else {
                0.0
            }
        };
        let correction = Velocity {
            x: shift(desired.min.x, desired.max.x, self.min.x, self.max.x),
            y: shift(desired.min.y, desired.max.y, self.min.y, self.max.y),
            z: shift(desired.min.z, desired.max.z, self.min.z, self.max.z),
        };
        desired.translated(&correction)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Displacement for `input` at `speed_per_tick`.
pub fn velocity_for(input: &InputState, speed_per_tick: f32) -> Velocity {
    Velocity {
        x: input.axis(InputDirection::XUp, InputDirection::XDown) * speed_per_tick,
        y: input.axis(InputDirection::YUp, InputDirection::YDown) * speed_per_tick,
        z: input.axis(InputDirection::ZUp, InputDirection::ZDown) * speed_per_tick,
    }
}

/// Advances one entity by one tick of `input`.
pub fn step(
    position: Position,
    collision: &Collision,
    input: &InputState,
    speed_per_tick: f32,
    resolver: &dyn MovementResolver,
) -> (Position, Velocity) {
    let velocity = velocity_for(input, speed_per_tick);
    if velocity.is_zero() {
        return (position, velocity);
    }
    let current = collision.bounds_at(position);
    let desired = current.translated(&velocity);
    let resolved = resolver.resolve(&current, &desired);
    (resolved.center(), velocity)
}
