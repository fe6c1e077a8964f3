//! Replicated identity components and the handle types shared by server and
//! client.

use bevy_ecs::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cast::{CastLifecycle, CastState, CastableId};
use crate::movement::{Collision, InputState, Position, Velocity};
use crate::tick::Tick;

// ---------------------------------------------------------------------------
// NetworkId
// ---------------------------------------------------------------------------

/// Unique network identifier for a replicated entity. Allocated by the server
/// from a monotonically increasing counter and never reused within a
/// session. Clients reference entities exclusively by `NetworkId`.
#[derive(
    Component, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct NetworkId(pub u64);

/// Monotonic [`NetworkId`] allocator.
#[derive(Debug, Default)]
pub struct NetworkIdAllocator {
    next: u64,
}

impl NetworkIdAllocator {
    /// Creates an allocator whose first id is `NetworkId(1)`.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hands out the next id.
    pub fn allocate(&mut self) -> NetworkId {
        let id = NetworkId(self.next.max(1));
        self.next = id.0 + 1;
        id
    }
}

/// Resolves replicated handles to world entities.
pub trait EntityLookup {
    /// World entity for `id`, if it is currently known.
    fn lookup(&self, id: NetworkId) -> Option<Entity>;
}

impl EntityLookup for FxHashMap<NetworkId, Entity> {
    fn lookup(&self, id: NetworkId) -> Option<Entity> {
        self.get(&id).copied()
    }
}

/// Server-side handle of one client connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Display name of an entity.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityName(pub String);

/// Marks an entity driven by a client connection. Such entities are
/// AOI-tracked on the server.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientControlled {
    /// Owning connection.
    pub connection: ConnectionId,
}

/// Input the owning client last reported for an entity.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerInput(pub InputState);

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One replicated component value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ReplicatedComponent {
    /// [`Position`].
    Position(Position),
    /// [`Velocity`].
    Velocity(Velocity),
    /// [`PlayerInput`].
    Input(InputState),
    /// [`Collision`].
    Collision(Collision),
    /// [`EntityName`].
    Name(String),
    /// [`CastState`] of a cast in progress.
    Cast(ActiveCast),
}

/// Replicated view of a cast in progress. `end_tick` is on the sender's
/// clock; receivers rebase it with [`mirror`](Self::mirror).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ActiveCast {
    /// What is being cast.
    pub castable: CastableId,
    /// Target entity, if any.
    pub target_entity: Option<NetworkId>,
    /// Target position, if any.
    pub target_position: Option<Position>,
    /// Current stage.
    pub state: CastLifecycle,
    /// Tick the current stage ends on.
    pub end_tick: Tick,
    /// Caster position when the cast began.
    pub start_position: Position,
}

impl ActiveCast {
    /// Replicated view of `cast`.
    pub fn of(cast: &CastState) -> Self {
        Self {
            castable: cast.castable,
            target_entity: cast.target_entity,
            target_position: cast.target_position,
            state: cast.state,
            end_tick: cast.end_tick,
            start_position: cast.start_position,
        }
    }

    /// Non-predicted mirror on the receiver. The view was captured on tick
    /// `sent_at` and is applied on local tick `now`; the remaining ticks of
    /// the current stage carry over.
    pub fn mirror(&self, caster: NetworkId, sent_at: Tick, now: Tick) -> CastState {
        CastState {
            castable: self.castable,
            caster,
            target_entity: self.target_entity,
            target_position: self.target_position,
            state: self.state,
            end_tick: now.saturating_add(self.end_tick.saturating_sub(sent_at)),
            start_position: self.start_position,
            request_id: None,
            predicted: false,
        }
    }
}

/// Full replicated state of one entity, sent with an init.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    /// Entity handle.
    pub entity: NetworkId,
    /// Every replicated component the entity carries.
    pub components: Vec<ReplicatedComponent>,
}

impl EntitySnapshot {
    /// Captures the replicated components of `entity`.
    pub fn capture(world: &World, id: NetworkId, entity: Entity) -> Self {
        let mut components = Vec::new();
        if let Some(position) = world.get::<Position>(entity) {
            components.push(ReplicatedComponent::Position(*position));
        }
        if let Some(velocity) = world.get::<Velocity>(entity) {
            components.push(ReplicatedComponent::Velocity(*velocity));
        }
        if let Some(input) = world.get::<PlayerInput>(entity) {
            components.push(ReplicatedComponent::Input(input.0));
        }
        if let Some(collision) = world.get::<Collision>(entity) {
            components.push(ReplicatedComponent::Collision(*collision));
        }
        if let Some(name) = world.get::<EntityName>(entity) {
            components.push(ReplicatedComponent::Name(name.0.clone()));
        }
        if let Some(cast) = world.get::<CastState>(entity) {
            components.push(ReplicatedComponent::Cast(ActiveCast::of(cast)));
        }
        Self {
            entity: id,
            components,
        }
    }

    /// Position carried by the snapshot, if any.
    pub fn position(&self) -> Option<Position> {
        self.components.iter().find_map(|c| match c {
            ReplicatedComponent::Position(p) => Some(*p),
            _ => None,
        })
    }
}

/// Inserts (or overwrites) one replicated component on `entity`. Casts are
/// skipped: mirroring one needs the receiver's clock.
pub fn apply_component(world: &mut World, entity: Entity, component: &ReplicatedComponent) {
    let Ok(mut entity_mut) = world.get_entity_mut(entity) else {
        return;
    };
    match component {
        ReplicatedComponent::Position(p) => {
            entity_mut.insert(*p);
        }
        ReplicatedComponent::Velocity(v) => {
            entity_mut.insert(*v);
        }
        ReplicatedComponent::Input(i) => {
            entity_mut.insert(PlayerInput(*i));
        }
        ReplicatedComponent::Collision(c) => {
            entity_mut.insert(*c);
        }
        ReplicatedComponent::Name(n) => {
            entity_mut.insert(EntityName(n.clone()));
        }
        ReplicatedComponent::Cast(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_monotonic() {
        let mut alloc = NetworkIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!(a, NetworkId(1));
        assert!(b > a);
    }

    #[test]
    fn test_snapshot_captures_replicated_components() {
        let mut world = World::new();
        let entity = world
            .spawn((
                Position::new(1.0, 2.0, 3.0),
                EntityName("bot".into()),
                Collision::default(),
            ))
            .id();
        let snapshot = EntitySnapshot::capture(&world, NetworkId(7), entity);
        assert_eq!(snapshot.entity, NetworkId(7));
        assert_eq!(snapshot.components.len(), 3);
        assert_eq!(snapshot.position(), Some(Position::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_snapshot_carries_cast_in_progress() {
        let mut world = World::new();
        let entity = world
            .spawn((
                Position::new(4.0, 0.0, 0.0),
                CastState {
                    castable: CastableId(3),
                    caster: NetworkId(7),
                    target_entity: None,
                    target_position: Some(Position::new(9.0, 0.0, 0.0)),
                    state: CastLifecycle::Casting,
                    end_tick: 140,
                    start_position: Position::new(4.0, 0.0, 0.0),
                    request_id: Some(2),
                    predicted: false,
                },
            ))
            .id();
        let snapshot = EntitySnapshot::capture(&world, NetworkId(7), entity);
        let active = snapshot
            .components
            .iter()
            .find_map(|c| match c {
                ReplicatedComponent::Cast(active) => Some(*active),
                _ => None,
            })
            .unwrap();
        assert_eq!(active.castable, CastableId(3));
        assert_eq!(active.end_tick, 140);

        // Captured on server tick 100, applied on local tick 20: 40 ticks left.
        let mirror = active.mirror(NetworkId(7), 100, 20);
        assert_eq!(mirror.end_tick, 60);
        assert_eq!(mirror.state, CastLifecycle::Casting);
        assert_eq!(mirror.request_id, None);
        assert!(!mirror.predicted);
        assert_eq!(active.mirror(NetworkId(7), 150, 20).end_tick, 20);
    }

    #[test]
    fn test_apply_component_overwrites() {
        let mut world = World::new();
        let entity = world.spawn(Position::default()).id();
        apply_component(
            &mut world,
            entity,
            &ReplicatedComponent::Position(Position::new(5.0, 0.0, 0.0)),
        );
        apply_component(&mut world, entity, &ReplicatedComponent::Name("x".into()));
        assert_eq!(world.get::<Position>(entity).unwrap().x, 5.0);
        assert_eq!(world.get::<EntityName>(entity).unwrap().0, "x");
    }

    #[test]
    fn test_snapshot_json_uses_variant_names() {
        let snapshot = EntitySnapshot {
            entity: NetworkId(3),
            components: vec![ReplicatedComponent::Name("a".into())],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"Name\""));
        let back: EntitySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
