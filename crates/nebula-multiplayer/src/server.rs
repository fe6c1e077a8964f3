//! Authoritative replication server.
//!
//! One [`ReplicationServer`] owns the world, the spatial index and every AOI
//! set, and is the sole mutator of all of them. Each tick runs the phases of
//! [`TickPhase`] in order:
//!
//! 1. **Lifecycle**: accept connections, drain inbound messages (recording
//!    tick diffs), spawn joining players and clean up dropped connections.
//! 2. **Movement**: apply due inputs and step every movable entity.
//! 3. **Aoi**: recompute AOI sets of entities that moved.
//! 4. **Casts**: validate due cast requests and advance every cast.
//! 5. **Replication**: emit deletes, inits, component and movement updates,
//!    periodic tick adjustments, then flush the outbox.

use std::sync::Arc;
use std::time::Duration;

use bevy_ecs::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::adjustment::TickDiffHistory;
use crate::aoi::{AoiDiff, AoiTracker};
use crate::cast::{
    CastCooldowns, CastContext, CastEffects, CastEvent, CastFailure, CastLifecycle, CastTarget,
    CastableRegistry, ClearSight, LineOfSight, NoEffects, begin_cast, cancel_cast, update_casts,
    validate_cast,
};
use crate::error::{ProtocolViolation, ReplicationError};
use crate::hooks::{NoHooks, TickHooks, TickPhase};
use crate::lifecycle::lifecycle_messages;
use crate::messages::{CastRequest, ClientMessage, ServerMessage};
use crate::movement::{Collision, InputState, MovementResolver, OpenWorld, Position, Velocity, step};
use crate::offset::TickQueue;
use crate::settings::SimulationSettings;
use crate::spatial::{GridSpatialIndex, SpatialIndex};
use crate::tick::{Tick, TickClock};
use crate::transport::{ServerTransport, TransportError};
use crate::world::{
    ClientControlled, ConnectionId, EntityName, NetworkId, NetworkIdAllocator, PlayerInput,
    ReplicatedComponent,
};

/// Picks the spawn position of a new entity.
pub type Spawner = Box<dyn FnMut(NetworkId) -> Position + Send>;

/// Spreads spawns over a 40x40 square around the origin.
pub fn default_spawn(id: NetworkId) -> Position {
    let i = id.0 as f32;
    Position::new((i * 7.0) % 40.0 - 20.0, (i * 13.0) % 40.0 - 20.0, 0.0)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// `EntityInit`s sent.
    pub inits_sent: u64,
    /// `EntityDelete`s sent.
    pub deletes_sent: u64,
    /// `MovementUpdate`s sent.
    pub movement_updates_sent: u64,
    /// Tick adjustments sent.
    pub adjustments_sent: u64,
    /// Cast requests accepted.
    pub casts_accepted: u64,
    /// Cast requests rejected.
    pub casts_rejected: u64,
}

/// Server-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Ticks processed.
    pub ticks: u64,
    /// Connections accepted.
    pub connections_accepted: u64,
    /// Connections dropped for any reason.
    pub connections_dropped: u64,
    /// Connections dropped for a protocol violation.
    pub protocol_violations: u64,
    /// Casts that completed.
    pub casts_completed: u64,
    /// Casts canceled while in progress.
    pub casts_canceled: u64,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    entity: Option<NetworkId>,
    tick_diffs: Arc<TickDiffHistory>,
    inputs: TickQueue<InputState>,
    casts: TickQueue<CastRequest>,
    stats: ConnectionStats,
}

impl Connection {
    fn new(history_capacity: usize) -> Self {
        Self {
            entity: None,
            tick_diffs: Arc::new(TickDiffHistory::new(history_capacity)),
            inputs: TickQueue::new(),
            casts: TickQueue::new(),
            stats: ConnectionStats::default(),
        }
    }
}

/// Movement state that changed during a tick.
#[derive(Debug, Clone, Copy)]
struct MovementChange {
    id: NetworkId,
    moved: bool,
    position: Position,
    velocity: Velocity,
    input: InputState,
    collision: Collision,
}

// ---------------------------------------------------------------------------
// ReplicationServer
// ---------------------------------------------------------------------------

/// Authoritative simulation and replication for every connected client.
pub struct ReplicationServer<T: ServerTransport> {
    settings: SimulationSettings,
    transport: T,
    world: World,
    clock: TickClock,
    ids: NetworkIdAllocator,
    entities: FxHashMap<NetworkId, Entity>,
    owners: FxHashMap<NetworkId, ConnectionId>,
    connections: FxHashMap<ConnectionId, Connection>,
    spatial: Box<dyn SpatialIndex + Send>,
    aoi: AoiTracker,
    resolver: Box<dyn MovementResolver + Send>,
    castables: CastableRegistry,
    line_of_sight: Box<dyn LineOfSight + Send>,
    effects: Box<dyn CastEffects + Send>,
    hooks: Box<dyn TickHooks>,
    spawner: Spawner,
    joined: Vec<NetworkId>,
    spawned: Vec<NetworkId>,
    pending_drops: Vec<ConnectionId>,
    pending_components: Vec<(NetworkId, Vec<ReplicatedComponent>)>,
    outbox: Vec<(ConnectionId, ServerMessage)>,
    extensions: Vec<(ConnectionId, u16, Vec<u8>)>,
    stats: ServerStats,
}

impl<T: ServerTransport> ReplicationServer<T> {
    /// Creates a server over `transport`. Fails on invalid settings.
    pub fn new(settings: SimulationSettings, transport: T) -> Result<Self, ReplicationError> {
        settings.validate()?;
        let clock = TickClock::new(settings.tick_rate_hz)
            .with_max_ticks_per_frame(settings.max_ticks_per_frame);
        Ok(Self {
            spatial: Box::new(GridSpatialIndex::new(settings.spatial_cell_size)),
            aoi: AoiTracker::new(settings.aoi_radius),
            castables: CastableRegistry::new(settings.global_cooldown()),
            settings,
            transport,
            world: World::new(),
            clock,
            ids: NetworkIdAllocator::new(),
            entities: FxHashMap::default(),
            owners: FxHashMap::default(),
            connections: FxHashMap::default(),
            resolver: Box::new(OpenWorld),
            line_of_sight: Box::new(ClearSight),
            effects: Box::new(NoEffects),
            hooks: Box::new(NoHooks),
            spawner: Box::new(default_spawn),
            joined: Vec::new(),
            spawned: Vec::new(),
            pending_drops: Vec::new(),
            pending_components: Vec::new(),
            outbox: Vec::new(),
            extensions: Vec::new(),
            stats: ServerStats::default(),
        })
    }

    /// Replaces the collision resolver.
    pub fn with_resolver(mut self, resolver: impl MovementResolver + Send + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replaces the castable definitions.
    pub fn with_castables(mut self, castables: CastableRegistry) -> Self {
        self.castables = castables;
        self
    }

    /// Replaces the line-of-sight test.
    pub fn with_line_of_sight(mut self, los: impl LineOfSight + Send + 'static) -> Self {
        self.line_of_sight = Box::new(los);
        self
    }

    /// Replaces the cast effects callback.
    pub fn with_effects(mut self, effects: impl CastEffects + Send + 'static) -> Self {
        self.effects = Box::new(effects);
        self
    }

    /// Installs per-phase hooks.
    pub fn with_hooks(mut self, hooks: impl TickHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Replaces the spawn position picker.
    pub fn with_spawner(mut self, spawner: impl FnMut(NetworkId) -> Position + Send + 'static) -> Self {
        self.spawner = Box::new(spawner);
        self
    }

    // -- Accessors ----------------------------------------------------------

    /// Last processed tick.
    pub fn current_tick(&self) -> Tick {
        self.clock.current_tick()
    }

    /// The authoritative world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the authoritative world.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// AOI sets.
    pub fn aoi(&self) -> &AoiTracker {
        &self.aoi
    }

    /// Server-wide counters.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Counters of `connection`.
    pub fn connection_stats(&self, connection: ConnectionId) -> Option<ConnectionStats> {
        self.connections.get(&connection).map(|c| c.stats)
    }

    /// Open connections, sorted.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Player entity of `connection`, once handshaken.
    pub fn entity_of(&self, connection: ConnectionId) -> Option<NetworkId> {
        self.connections.get(&connection)?.entity
    }

    /// World entity of `id`.
    pub fn world_entity(&self, id: NetworkId) -> Option<Entity> {
        self.entities.get(&id).copied()
    }

    /// Tick-diff history of `connection`, for a receive path running on
    /// another thread.
    pub fn tick_diff_history(&self, connection: ConnectionId) -> Option<Arc<TickDiffHistory>> {
        self.connections
            .get(&connection)
            .map(|c| Arc::clone(&c.tick_diffs))
    }

    /// Takes every extension message received so far.
    pub fn take_extensions(&mut self) -> Vec<(ConnectionId, u16, Vec<u8>)> {
        std::mem::take(&mut self.extensions)
    }

    // -- Host operations ----------------------------------------------------

    /// Queues an extension message for `connection`.
    pub fn send_extension(&mut self, connection: ConnectionId, kind: u16, payload: Vec<u8>) {
        self.outbox
            .push((connection, ServerMessage::Extension { kind, payload }));
    }

    /// Spawns a server-driven entity. It becomes visible to nearby clients
    /// on the next tick.
    pub fn spawn_npc(&mut self, name: &str, position: Position) -> NetworkId {
        let id = self.ids.allocate();
        let collision = Collision::default();
        let entity = self
            .world
            .spawn((
                id,
                position,
                Velocity::default(),
                collision,
                PlayerInput::default(),
                EntityName(name.to_owned()),
                CastCooldowns::default(),
            ))
            .id();
        self.entities.insert(id, entity);
        self.spatial.update(id, collision.bounds_at(position));
        self.spawned.push(id);
        id
    }

    /// Overwrites components of `id` and replicates them on the next tick.
    pub fn update_components(&mut self, id: NetworkId, components: Vec<ReplicatedComponent>) {
        let Some(entity) = self.entities.get(&id).copied() else {
            return;
        };
        for component in &components {
            crate::world::apply_component(&mut self.world, entity, component);
        }
        self.pending_components.push((id, components));
    }

    /// Drops `connection` at the start of the next tick.
    pub fn disconnect(&mut self, connection: ConnectionId) {
        self.pending_drops.push(connection);
    }

    // -- Tick loop ----------------------------------------------------------

    /// Adds `dt` of wall-clock time and runs every tick it makes due.
    pub fn frame(&mut self, dt: Duration) -> Result<u32, ReplicationError> {
        let owed = self.clock.accumulate(dt);
        for _ in 0..owed {
            self.process_tick()?;
        }
        Ok(owed)
    }

    /// Runs exactly one tick. An error means server state can no longer be
    /// trusted; faults attributable to one peer only drop that peer.
    pub fn process_tick(&mut self) -> Result<Tick, ReplicationError> {
        let tick = self.clock.advance();
        let mut diff = AoiDiff::new();

        self.hooks.before(TickPhase::Lifecycle, &mut self.world, tick);
        self.run_lifecycle(tick, &mut diff)?;
        self.hooks.after(TickPhase::Lifecycle, &mut self.world, tick);

        self.hooks.before(TickPhase::Movement, &mut self.world, tick);
        let changes = self.run_movement(tick);
        self.hooks.after(TickPhase::Movement, &mut self.world, tick);

        self.hooks.before(TickPhase::Aoi, &mut self.world, tick);
        for change in changes.iter().filter(|c| c.moved) {
            self.aoi
                .entity_moved(change.id, self.spatial.as_ref(), &mut diff)?;
        }
        for id in std::mem::take(&mut self.spawned) {
            self.aoi.entity_moved(id, self.spatial.as_ref(), &mut diff)?;
        }
        self.hooks.after(TickPhase::Aoi, &mut self.world, tick);

        self.hooks.before(TickPhase::Casts, &mut self.world, tick);
        self.run_casts(tick);
        self.hooks.after(TickPhase::Casts, &mut self.world, tick);

        self.hooks.before(TickPhase::Replication, &mut self.world, tick);
        self.run_replication(tick, diff, &changes);
        self.hooks.after(TickPhase::Replication, &mut self.world, tick);

        self.flush();
        self.stats.ticks += 1;
        Ok(tick)
    }

    // -- Lifecycle ----------------------------------------------------------

    fn run_lifecycle(&mut self, tick: Tick, diff: &mut AoiDiff) -> Result<(), ReplicationError> {
        while let Some(connection) = self.transport.accept() {
            self.connections.insert(
                connection,
                Connection::new(self.settings.adjustment.history_capacity),
            );
            self.stats.connections_accepted += 1;
            tracing::debug!(connection = connection.0, "connection accepted");
        }

        let mut drops = std::mem::take(&mut self.pending_drops);
        for connection in self.connections() {
            loop {
                match self.transport.try_receive(connection) {
                    Ok(Some(message)) => {
                        if let Err(violation) = self.handle_message(connection, message, tick) {
                            tracing::warn!(connection = connection.0, %violation, "protocol violation");
                            self.stats.protocol_violations += 1;
                            drops.push(connection);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(TransportError::Disconnected) => {
                        drops.push(connection);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(connection = connection.0, %err, "dropping connection");
                        self.stats.protocol_violations += 1;
                        drops.push(connection);
                        break;
                    }
                }
            }
        }

        for id in std::mem::take(&mut self.joined) {
            self.aoi.add_tracked(id, self.spatial.as_ref(), diff)?;
        }

        drops.sort_unstable();
        drops.dedup();
        for connection in drops {
            self.drop_connection(connection, tick, diff)?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        connection: ConnectionId,
        message: ClientMessage,
        tick: Tick,
    ) -> Result<(), ProtocolViolation> {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return Ok(());
        };
        if let Some((client_tick, iteration)) = message.tick_stamp() {
            if conn.entity.is_none() {
                return Err(ProtocolViolation::NotHandshaken);
            }
            conn.tick_diffs.record(client_tick, tick, iteration);
        }

        match message {
            ClientMessage::ConnectionRequest { player_name } => {
                if conn.entity.is_some() {
                    tracing::warn!(connection = connection.0, "duplicate connection request ignored");
                    return Ok(());
                }
                let players = self.owners.len();
                if players >= self.settings.max_players {
                    tracing::warn!(connection = connection.0, players, "server full");
                    self.pending_drops.push(connection);
                    return Ok(());
                }
                self.spawn_player(connection, player_name, tick);
            }
            ClientMessage::InputChange {
                tick: input_tick,
                input,
                ..
            } => conn.inputs.push(input_tick, input),
            ClientMessage::CastRequest(request) => conn.casts.push(request.tick, request),
            ClientMessage::Heartbeat { .. } => {}
            ClientMessage::Extension { kind, payload } => {
                self.extensions.push((connection, kind, payload));
            }
        }
        Ok(())
    }

    fn spawn_player(&mut self, connection: ConnectionId, name: String, tick: Tick) {
        let id = self.ids.allocate();
        let position = (self.spawner)(id);
        let collision = Collision::default();
        let entity = self
            .world
            .spawn((
                id,
                position,
                Velocity::default(),
                collision,
                PlayerInput::default(),
                EntityName(name.clone()),
                ClientControlled { connection },
                CastCooldowns::default(),
            ))
            .id();
        self.entities.insert(id, entity);
        self.owners.insert(id, connection);
        self.spatial.update(id, collision.bounds_at(position));
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.entity = Some(id);
        }
        self.joined.push(id);
        self.outbox.push((
            connection,
            ServerMessage::ConnectionResponse {
                entity: id,
                tick,
                position,
            },
        ));
        tracing::info!(connection = connection.0, entity = id.0, %name, "player joined");
    }

    fn drop_connection(
        &mut self,
        connection: ConnectionId,
        tick: Tick,
        diff: &mut AoiDiff,
    ) -> Result<(), ReplicationError> {
        let Some(conn) = self.connections.remove(&connection) else {
            return Ok(());
        };
        self.transport.disconnect(connection);
        self.stats.connections_dropped += 1;
        tracing::info!(connection = connection.0, entity = ?conn.entity.map(|e| e.0), "connection dropped");
        if let Some(id) = conn.entity {
            self.remove_entity(id, tick, diff)?;
        }
        Ok(())
    }

    fn remove_entity(&mut self, id: NetworkId, tick: Tick, diff: &mut AoiDiff) -> Result<(), ReplicationError> {
        let observers = self.aoi.observers_of(id);
        if let Some(entity) = self.entities.remove(&id) {
            if let Some(cast) = cancel_cast(&mut self.world, entity)
                && cast.state != CastLifecycle::CastComplete
            {
                self.stats.casts_canceled += 1;
                for observer in &observers {
                    if let Some(conn) = self.owners.get(observer) {
                        self.outbox.push((
                            *conn,
                            ServerMessage::CastFailed {
                                tick,
                                caster: id,
                                castable: cast.castable,
                                request_id: None,
                                reason: CastFailure::InvalidCaster,
                            },
                        ));
                    }
                }
            }
            self.world.despawn(entity);
        }
        self.aoi.remove_entity(id, diff)?;
        self.spatial.remove(id);
        self.owners.remove(&id);
        Ok(())
    }

    // -- Movement -----------------------------------------------------------

    fn run_movement(&mut self, tick: Tick) -> Vec<MovementChange> {
        let mut input_changed = FxHashSet::default();
        for conn in self.connections.values_mut() {
            let Some(id) = conn.entity else {
                continue;
            };
            let Some((_, input)) = conn.inputs.drain_due(tick).pop() else {
                continue;
            };
            let Some(entity) = self.entities.get(&id) else {
                continue;
            };
            if let Some(mut current) = self.world.get_mut::<PlayerInput>(*entity)
                && current.0 != input
            {
                current.0 = input;
                input_changed.insert(id);
            }
        }

        let speed = self.settings.speed_per_tick();
        let resolver = self.resolver.as_ref();
        let mut query = self
            .world
            .query::<(&NetworkId, &mut Position, &mut Velocity, &Collision, &PlayerInput)>();
        let mut changes = Vec::new();
        for (id, mut position, mut velocity, collision, input) in query.iter_mut(&mut self.world) {
            let (next, next_velocity) = step(*position, collision, &input.0, speed, resolver);
            let moved = next != *position;
            let velocity_changed = next_velocity != *velocity;
            if moved {
                *position = next;
            }
            if velocity_changed {
                *velocity = next_velocity;
            }
            if moved || velocity_changed || input_changed.contains(id) {
                changes.push(MovementChange {
                    id: *id,
                    moved,
                    position: next,
                    velocity: next_velocity,
                    input: input.0,
                    collision: *collision,
                });
            }
        }
        changes.sort_by_key(|c| c.id);

        for change in changes.iter().filter(|c| c.moved) {
            self.spatial
                .update(change.id, change.collision.bounds_at(change.position));
        }
        changes
    }

    // -- Casts --------------------------------------------------------------

    fn run_casts(&mut self, tick: Tick) {
        let mut requests = Vec::new();
        for (connection, conn) in &mut self.connections {
            let Some(id) = conn.entity else {
                continue;
            };
            for (_, request) in conn.casts.drain_due(tick) {
                requests.push((*connection, id, request));
            }
        }
        requests.sort_by_key(|(connection, _, request)| (*connection, request.request_id));

        let ctx = CastContext {
            registry: &self.castables,
            lookup: &self.entities,
            line_of_sight: self.line_of_sight.as_ref(),
            tick_duration: self.settings.tick_duration(),
        };

        for (connection, caster, request) in requests {
            let target = CastTarget {
                entity: request.target_entity,
                position: request.target_position,
            };
            let result = validate_cast(&self.world, &ctx, caster, request.castable, &target, tick)
                .and_then(|_| {
                    begin_cast(
                        &mut self.world,
                        &self.entities,
                        caster,
                        request.castable,
                        &target,
                        Some(request.request_id),
                        false,
                    )
                });
            let conn = self.connections.get_mut(&connection);
            match result {
                Ok(()) => {
                    if let Some(conn) = conn {
                        conn.stats.casts_accepted += 1;
                    }
                }
                Err(reason) => {
                    tracing::debug!(
                        connection = connection.0,
                        request = request.request_id,
                        %reason,
                        "cast request rejected"
                    );
                    if let Some(conn) = conn {
                        conn.stats.casts_rejected += 1;
                    }
                    self.outbox.push((
                        connection,
                        ServerMessage::CastFailed {
                            tick,
                            caster,
                            castable: request.castable,
                            request_id: Some(request.request_id),
                            reason,
                        },
                    ));
                }
            }
        }

        let events = update_casts(&mut self.world, &ctx, self.effects.as_mut(), tick);
        for event in events {
            match event {
                CastEvent::Started(cast) => {
                    let visible = self
                        .castables
                        .get(cast.castable)
                        .is_some_and(|c| c.visible_effects);
                    if !visible {
                        continue;
                    }
                    for observer in self.aoi.observers_of(cast.caster) {
                        if let Some(conn) = self.owners.get(&observer) {
                            self.outbox.push((
                                *conn,
                                ServerMessage::CastStarted {
                                    tick,
                                    caster: cast.caster,
                                    castable: cast.castable,
                                    target_entity: cast.target_entity,
                                    target_position: cast.target_position,
                                },
                            ));
                        }
                    }
                }
                CastEvent::Canceled { cast, reason } => {
                    self.stats.casts_canceled += 1;
                    if reason == CastFailure::AlreadyCasting {
                        continue;
                    }
                    for observer in self.aoi.observers_of(cast.caster) {
                        if let Some(conn) = self.owners.get(&observer) {
                            self.outbox.push((
                                *conn,
                                ServerMessage::CastFailed {
                                    tick,
                                    caster: cast.caster,
                                    castable: cast.castable,
                                    request_id: None,
                                    reason,
                                },
                            ));
                        }
                    }
                }
                CastEvent::Completed(_) => self.stats.casts_completed += 1,
                CastEvent::Removed(_) => {}
            }
        }
    }

    // -- Replication --------------------------------------------------------

    fn recipients(&self, id: NetworkId) -> Vec<ConnectionId> {
        let mut recipients: Vec<ConnectionId> = self.owners.get(&id).copied().into_iter().collect();
        recipients.extend(
            self.aoi
                .observers_of(id)
                .into_iter()
                .filter_map(|observer| self.owners.get(&observer).copied()),
        );
        recipients
    }

    fn run_replication(&mut self, tick: Tick, diff: AoiDiff, changes: &[MovementChange]) {
        for (recipient, message) in lifecycle_messages(diff, tick, &self.world, &self.entities) {
            let Some(connection) = self.owners.get(&recipient).copied() else {
                continue;
            };
            if let Some(conn) = self.connections.get_mut(&connection) {
                match message {
                    ServerMessage::EntityInit { .. } => conn.stats.inits_sent += 1,
                    ServerMessage::EntityDelete { .. } => conn.stats.deletes_sent += 1,
                    _ => {}
                }
            }
            self.outbox.push((connection, message));
        }

        for (id, components) in std::mem::take(&mut self.pending_components) {
            if !self.entities.contains_key(&id) {
                continue;
            }
            for connection in self.recipients(id) {
                self.outbox.push((
                    connection,
                    ServerMessage::ComponentUpdate {
                        tick,
                        entity: id,
                        components: components.clone(),
                    },
                ));
            }
        }

        for change in changes {
            for connection in self.recipients(change.id) {
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.stats.movement_updates_sent += 1;
                }
                self.outbox.push((
                    connection,
                    ServerMessage::MovementUpdate {
                        tick,
                        entity: change.id,
                        position: change.position,
                        velocity: change.velocity,
                        input: change.input,
                    },
                ));
            }
        }

        if tick % self.settings.adjustment.interval_ticks == 0 {
            for (connection, conn) in &mut self.connections {
                if conn.entity.is_none() {
                    continue;
                }
                if let Some(adjustment) = conn.tick_diffs.compute_adjustment(&self.settings.adjustment) {
                    tracing::debug!(
                        connection = connection.0,
                        adjustment = adjustment.adjustment,
                        iteration = adjustment.iteration,
                        "tick adjustment"
                    );
                    conn.stats.adjustments_sent += 1;
                    self.outbox
                        .push((*connection, ServerMessage::TickAdjustment(adjustment)));
                }
            }
        }
    }

    fn flush(&mut self) {
        for (connection, message) in std::mem::take(&mut self.outbox) {
            if !self.connections.contains_key(&connection) {
                continue;
            }
            if let Err(err) = self.transport.send(connection, &message) {
                tracing::debug!(connection = connection.0, %err, "send failed, dropping next tick");
                if !self.pending_drops.contains(&connection) {
                    self.pending_drops.push(connection);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
