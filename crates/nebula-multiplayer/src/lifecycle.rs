//! Entity lifecycle replication.
//!
//! Server side, [`lifecycle_messages`] turns a tick's [`AoiDiff`] into
//! per-recipient `EntityDelete` then `EntityInit` messages. Client side,
//! [`RemoteRegistry`] mirrors those notifications into the local world and
//! rejects any that break the init-before-use ordering.

use bevy_ecs::prelude::*;
use rustc_hash::FxHashMap;

use crate::aoi::{AoiDiff, AoiEvent};
use crate::error::ProtocolViolation;
use crate::messages::ServerMessage;
use crate::movement::{InputState, Position, Velocity};
use crate::tick::Tick;
use crate::world::{
    EntityLookup, EntitySnapshot, NetworkId, PlayerInput, ReplicatedComponent, apply_component,
};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Builds the lifecycle messages for one tick, deletes first.
///
/// `entities` maps replicated handles to their world entity. Inits whose
/// subject is gone from the world are skipped: a same-tick removal already
/// cancelled or superseded them.
pub fn lifecycle_messages(
    diff: AoiDiff,
    tick: Tick,
    world: &World,
    entities: &FxHashMap<NetworkId, Entity>,
) -> Vec<(NetworkId, ServerMessage)> {
    let mut out = Vec::with_capacity(diff.len());
    for event in diff.into_events() {
        match event {
            AoiEvent::Delete(pair) => out.push((
                pair.recipient,
                ServerMessage::EntityDelete {
                    tick,
                    entity: pair.subject,
                },
            )),
            AoiEvent::Init(pair) => {
                let Some(entity) = entities.get(&pair.subject) else {
                    tracing::warn!(subject = pair.subject.0, "init for an entity with no world entry");
                    continue;
                };
                out.push((
                    pair.recipient,
                    ServerMessage::EntityInit {
                        tick,
                        snapshot: EntitySnapshot::capture(world, pair.subject, *entity),
                    },
                ));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client-side map from replicated handles to local world entities.
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    entities: FxHashMap<NetworkId, Entity>,
}

impl RemoteRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the locally-controlled entity, which never receives an init.
    pub fn register_local(&mut self, id: NetworkId, entity: Entity) {
        self.entities.insert(id, entity);
    }

    /// Local entity for `id`.
    pub fn entity(&self, id: NetworkId) -> Option<Entity> {
        self.entities.get(&id).copied()
    }

    /// Returns `true` if `id` is currently part of the locally-known world.
    pub fn is_known(&self, id: NetworkId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of known entities, including the local one.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns `true` if nothing is known.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Every known handle, sorted.
    pub fn ids(&self) -> Vec<NetworkId> {
        let mut ids: Vec<_> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Spawns the entity described by `snapshot`.
    pub fn apply_init(
        &mut self,
        world: &mut World,
        snapshot: &EntitySnapshot,
    ) -> Result<Entity, ProtocolViolation> {
        if self.entities.contains_key(&snapshot.entity) {
            return Err(ProtocolViolation::InitForLiveEntity(snapshot.entity));
        }
        let entity = world.spawn(snapshot.entity).id();
        for component in &snapshot.components {
            apply_component(world, entity, component);
        }
        self.entities.insert(snapshot.entity, entity);
        tracing::trace!(entity = snapshot.entity.0, "remote entity initialised");
        Ok(entity)
    }

    /// Despawns `id`.
    pub fn apply_delete(&mut self, world: &mut World, id: NetworkId) -> Result<(), ProtocolViolation> {
        let entity = self
            .entities
            .remove(&id)
            .ok_or(ProtocolViolation::DeleteForUnknownEntity(id))?;
        world.despawn(entity);
        tracing::trace!(entity = id.0, "remote entity deleted");
        Ok(())
    }

    /// Overwrites replicated components of `id`.
    pub fn apply_components(
        &self,
        world: &mut World,
        id: NetworkId,
        components: &[ReplicatedComponent],
    ) -> Result<(), ProtocolViolation> {
        let entity = self
            .entity(id)
            .ok_or(ProtocolViolation::UpdateForUnknownEntity(id))?;
        for component in components {
            apply_component(world, entity, component);
        }
        Ok(())
    }

    /// Overwrites the movement state of `id`.
    pub fn apply_movement(
        &self,
        world: &mut World,
        id: NetworkId,
        position: Position,
        velocity: Velocity,
        input: InputState,
    ) -> Result<(), ProtocolViolation> {
        let entity = self
            .entity(id)
            .ok_or(ProtocolViolation::UpdateForUnknownEntity(id))?;
        if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
            entity_mut.insert((position, velocity, PlayerInput(input)));
        }
        Ok(())
    }

    /// Despawns every remote entity and forgets all handles.
    pub fn clear(&mut self, world: &mut World) {
        for (_, entity) in self.entities.drain() {
            world.despawn(entity);
        }
    }
}

impl EntityLookup for RemoteRegistry {
    fn lookup(&self, id: NetworkId) -> Option<Entity> {
        self.entity(id)
    }
}
