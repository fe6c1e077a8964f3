//! Predicting replication client.
//!
//! The client runs its own tick clock a few ticks ahead of the server. The
//! locally-controlled entity is predicted every tick and reconciled against
//! the server's movement updates as they arrive. Every other entity is
//! applied from tick-ordered queues, lagging the local clock by the
//! replication offset.
//!
//! Each tick runs [`TickPhase::Lifecycle`] (remote state due under the
//! offset, server cast rejections), [`TickPhase::Movement`] (prediction),
//! [`TickPhase::Casts`] and [`TickPhase::Replication`] (outgoing input, cast
//! requests or a heartbeat). The client has no AOI phase.

use std::time::Duration;

use bevy_ecs::prelude::*;

use crate::adjustment::{AdjustmentTracker, TickAdjustment};
use crate::cast::{
    CastContext, CastCooldowns, CastEffects, CastEvent, CastFailure, CastState,
    CastTarget, CastableId, CastableRegistry, ClearSight, LineOfSight, NoEffects, begin_cast,
    cancel_cast, update_casts, validate_cast,
};
use crate::error::{ProtocolViolation, ReplicationError};
use crate::hooks::{NoHooks, TickHooks, TickPhase};
use crate::lifecycle::RemoteRegistry;
use crate::messages::{CastRequest, ClientMessage, ServerMessage};
use crate::movement::{Collision, InputState, MovementResolver, OpenWorld, Position, Velocity};
use crate::offset::{ReplicationOffset, TickQueue};
use crate::reconciler::{MovementCorrection, PredictedState, PredictionReconciler};
use crate::settings::SimulationSettings;
use crate::tick::{Tick, TickClock};
use crate::transport::ClientTransport;
use crate::world::{
    EntityName, EntitySnapshot, NetworkId, PlayerInput, ReplicatedComponent, apply_component,
};

/// Client-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Ticks processed.
    pub ticks: u64,
    /// Remote entities initialised.
    pub inits_applied: u64,
    /// Remote entities deleted.
    pub deletes_applied: u64,
    /// Remote movement updates applied.
    pub movement_updates_applied: u64,
    /// Server corrections applied to the local entity.
    pub corrections_applied: u64,
    /// Corrections whose input disagreed with the prediction.
    pub input_mismatches: u64,
    /// Inputs replayed after corrections.
    pub inputs_replayed: u64,
    /// Tick adjustments applied.
    pub adjustments_applied: u64,
    /// Casts started locally.
    pub casts_predicted: u64,
    /// Local casts that completed.
    pub casts_completed: u64,
    /// Local casts canceled by local simulation.
    pub casts_canceled: u64,
    /// Local casts torn down by a server rejection.
    pub casts_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    id: NetworkId,
    entity: Entity,
}

#[derive(Debug, Clone, Copy)]
struct RemoteMovement {
    entity: NetworkId,
    position: Position,
    velocity: Velocity,
    input: InputState,
}

#[derive(Debug, Clone, Copy)]
enum RemoteCast {
    Started {
        caster: NetworkId,
        castable: CastableId,
        target: CastTarget,
    },
    Failed {
        caster: NetworkId,
        castable: CastableId,
    },
}

#[derive(Debug, Clone, Copy)]
struct CastRejection {
    castable: CastableId,
    request_id: Option<u32>,
    reason: CastFailure,
}

/// Mirrors a replicated cast in progress onto a remote entity, rebasing its
/// end tick from `sent_at` on the server's clock to local tick `now`.
fn mirror_cast(
    world: &mut World,
    entity: Entity,
    caster: NetworkId,
    components: &[ReplicatedComponent],
    sent_at: Tick,
    now: Tick,
) {
    let Some(active) = components.iter().find_map(|c| match c {
        ReplicatedComponent::Cast(active) => Some(active),
        _ => None,
    }) else {
        return;
    };
    if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
        entity_mut.insert(active.mirror(caster, sent_at, now));
    }
}

/// One client connection: prediction for the local entity, offset-delayed
/// replication for everything else.
pub struct ReplicationClient<T: ClientTransport> {
    settings: SimulationSettings,
    transport: T,
    world: World,
    clock: TickClock,
    player_name: String,
    session: Option<Session>,
    registry: RemoteRegistry,
    reconciler: PredictionReconciler,
    predicted: PredictedState,
    tracker: AdjustmentTracker,
    offset: ReplicationOffset,
    last_applied: Option<Tick>,
    deletes: TickQueue<NetworkId>,
    inits: TickQueue<EntitySnapshot>,
    components: TickQueue<(NetworkId, Vec<ReplicatedComponent>)>,
    movement: TickQueue<RemoteMovement>,
    casts: TickQueue<RemoteCast>,
    corrections: Vec<MovementCorrection>,
    rejections: Vec<CastRejection>,
    input: InputState,
    last_sent_input: InputState,
    outgoing_casts: Vec<CastRequest>,
    next_request_id: u32,
    castables: CastableRegistry,
    resolver: Box<dyn MovementResolver + Send>,
    line_of_sight: Box<dyn LineOfSight + Send>,
    effects: Box<dyn CastEffects + Send>,
    hooks: Box<dyn TickHooks>,
    extensions: Vec<(u16, Vec<u8>)>,
    stats: ClientStats,
}

impl<T: ClientTransport> ReplicationClient<T> {
    /// Sends the connection request. The client starts ticking once the
    /// server's response arrives through [`frame`](Self::frame).
    pub fn connect(
        settings: SimulationSettings,
        mut transport: T,
        player_name: &str,
    ) -> Result<Self, ReplicationError> {
        settings.validate()?;
        transport.send(&ClientMessage::ConnectionRequest {
            player_name: player_name.to_owned(),
        })?;
        let clock = TickClock::new(settings.tick_rate_hz)
            .with_max_ticks_per_frame(settings.max_ticks_per_frame);
        let offset = ReplicationOffset::new(settings.initial_replication_offset)?;
        Ok(Self {
            reconciler: PredictionReconciler::new(
                settings.input_history_length,
                settings.speed_per_tick(),
            ),
            castables: CastableRegistry::new(settings.global_cooldown()),
            settings,
            transport,
            world: World::new(),
            clock,
            player_name: player_name.to_owned(),
            session: None,
            registry: RemoteRegistry::new(),
            predicted: PredictedState::default(),
            tracker: AdjustmentTracker::new(),
            offset,
            last_applied: None,
            deletes: TickQueue::new(),
            inits: TickQueue::new(),
            components: TickQueue::new(),
            movement: TickQueue::new(),
            casts: TickQueue::new(),
            corrections: Vec::new(),
            rejections: Vec::new(),
            input: InputState::NONE,
            last_sent_input: InputState::NONE,
            outgoing_casts: Vec::new(),
            next_request_id: 0,
            resolver: Box::new(OpenWorld),
            line_of_sight: Box::new(ClearSight),
            effects: Box::new(NoEffects),
            hooks: Box::new(NoHooks),
            extensions: Vec::new(),
            stats: ClientStats::default(),
        })
    }

    /// Replaces the collision resolver. Must match the server's.
    pub fn with_resolver(mut self, resolver: impl MovementResolver + Send + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replaces the castable definitions. Must match the server's.
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

    // -- Accessors ----------------------------------------------------------

    /// Whether the handshake completed.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Handle of the local entity, once connected.
    pub fn entity(&self) -> Option<NetworkId> {
        self.session.map(|s| s.id)
    }

    /// Last processed tick.
    pub fn current_tick(&self) -> Tick {
        self.clock.current_tick()
    }

    /// Last remote tick applied, if any.
    pub fn last_applied_tick(&self) -> Option<Tick> {
        self.last_applied
    }

    /// Current replication offset.
    pub fn replication_offset(&self) -> i32 {
        self.offset.get()
    }

    /// Estimated ticks the client runs ahead of the server.
    pub fn lead(&self) -> i64 {
        i64::from(self.settings.initial_tick_lead) + self.tracker.accumulated()
    }

    /// Predicted state of the local entity.
    pub fn predicted(&self) -> &PredictedState {
        &self.predicted
    }

    /// Input held for upcoming ticks.
    pub fn input(&self) -> InputState {
        self.input
    }

    /// Whether a remote entity is currently known.
    pub fn is_known(&self, id: NetworkId) -> bool {
        self.registry.is_known(id)
    }

    /// Local world entity of a known handle.
    pub fn local_entity(&self, id: NetworkId) -> Option<Entity> {
        self.registry.entity(id)
    }

    /// Every known handle, the local entity included, sorted.
    pub fn known_entities(&self) -> Vec<NetworkId> {
        self.registry.ids()
    }

    /// The local world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the local world.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Client counters.
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Cast state of the local entity.
    pub fn local_cast(&self) -> Option<&CastState> {
        self.world.get::<CastState>(self.session?.entity)
    }

    /// Takes every extension message received so far.
    pub fn take_extensions(&mut self) -> Vec<(u16, Vec<u8>)> {
        std::mem::take(&mut self.extensions)
    }

    // -- Host operations ----------------------------------------------------

    /// Sets the input held from the next tick on.
    pub fn set_input(&mut self, input: InputState) {
        self.input = input;
    }

    /// Sends an extension message right away.
    pub fn send_extension(&mut self, kind: u16, payload: Vec<u8>) -> Result<(), ReplicationError> {
        self.transport
            .send(&ClientMessage::Extension { kind, payload })?;
        Ok(())
    }

    /// Starts a predicted cast on the next tick and returns its request id.
    /// The request goes out with that tick's messages.
    pub fn request_cast(&mut self, castable: CastableId, target: CastTarget) -> Result<u32, CastFailure> {
        let session = self.session.ok_or(CastFailure::InvalidCaster)?;
        let tick = self.clock.current_tick() + 1;
        let ctx = CastContext {
            registry: &self.castables,
            lookup: &self.registry,
            line_of_sight: self.line_of_sight.as_ref(),
            tick_duration: self.settings.tick_duration(),
        };
        validate_cast(&self.world, &ctx, session.id, castable, &target, tick)?;

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        begin_cast(
            &mut self.world,
            &self.registry,
            session.id,
            castable,
            &target,
            Some(request_id),
            true,
        )?;
        self.outgoing_casts.push(CastRequest {
            tick,
            request_id,
            castable,
            target_entity: target.entity,
            target_position: target.position,
            adjustment_iteration: 0,
        });
        self.stats.casts_predicted += 1;
        tracing::debug!(castable = castable.0, request_id, tick, "cast predicted");
        Ok(request_id)
    }

    // -- Tick loop ----------------------------------------------------------

    /// Drains the transport, then runs every tick `dt` makes due. Before the
    /// handshake completes no ticks run.
    pub fn frame(&mut self, dt: Duration) -> Result<u32, ReplicationError> {
        self.receive()?;
        if self.session.is_none() {
            return Ok(0);
        }
        let owed = self.clock.accumulate(dt);
        for _ in 0..owed {
            self.process_tick()?;
        }
        Ok(owed)
    }

    /// Drains every message waiting on the transport.
    pub fn receive(&mut self) -> Result<(), ReplicationError> {
        while let Some(message) = self.transport.try_receive()? {
            self.handle_message(message)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), ReplicationError> {
        let Some(session) = self.session else {
            return match message {
                ServerMessage::ConnectionResponse {
                    entity,
                    tick,
                    position,
                } => {
                    self.handshake(entity, tick, position);
                    Ok(())
                }
                _ => Err(ProtocolViolation::NotHandshaken.into()),
            };
        };

        match message {
            ServerMessage::ConnectionResponse { .. } => {
                tracing::warn!("duplicate connection response ignored");
            }
            ServerMessage::TickAdjustment(adjustment) => self.apply_tick_adjustment(adjustment)?,
            ServerMessage::EntityInit { tick, snapshot } => {
                if snapshot.entity == session.id {
                    return Err(ProtocolViolation::InitForLiveEntity(session.id).into());
                }
                self.inits.push(tick, snapshot);
            }
            ServerMessage::EntityDelete { tick, entity } => self.deletes.push(tick, entity),
            ServerMessage::ComponentUpdate {
                tick,
                entity,
                components,
            } => {
                if entity == session.id {
                    for component in &components {
                        apply_component(&mut self.world, session.entity, component);
                    }
                } else {
                    self.components.push(tick, (entity, components));
                }
            }
            ServerMessage::MovementUpdate {
                tick,
                entity,
                position,
                velocity,
                input,
            } => {
                if entity == session.id {
                    self.corrections.push(MovementCorrection {
                        tick,
                        position,
                        velocity,
                        input,
                    });
                } else {
                    self.movement.push(
                        tick,
                        RemoteMovement {
                            entity,
                            position,
                            velocity,
                            input,
                        },
                    );
                }
            }
            ServerMessage::CastStarted {
                tick,
                caster,
                castable,
                target_entity,
                target_position,
            } => {
                if caster != session.id {
                    self.casts.push(
                        tick,
                        RemoteCast::Started {
                            caster,
                            castable,
                            target: CastTarget {
                                entity: target_entity,
                                position: target_position,
                            },
                        },
                    );
                }
            }
            ServerMessage::CastFailed {
                tick,
                caster,
                castable,
                request_id,
                reason,
            } => {
                if caster == session.id {
                    self.rejections.push(CastRejection {
                        castable,
                        request_id,
                        reason,
                    });
                } else {
                    self.casts.push(tick, RemoteCast::Failed { caster, castable });
                }
            }
            ServerMessage::Extension { kind, payload } => self.extensions.push((kind, payload)),
        }
        Ok(())
    }

    fn handshake(&mut self, id: NetworkId, tick: Tick, position: Position) {
        let entity = self
            .world
            .spawn((
                id,
                position,
                Velocity::default(),
                Collision::default(),
                PlayerInput::default(),
                EntityName(self.player_name.clone()),
                CastCooldowns::default(),
            ))
            .id();
        self.registry.register_local(id, entity);
        self.predicted = PredictedState::at(position);
        self.clock
            .jump_to(tick.saturating_add(self.settings.initial_tick_lead));
        self.session = Some(Session { id, entity });
        tracing::info!(
            entity = id.0,
            server_tick = tick,
            local_tick = self.clock.current_tick(),
            "connected"
        );
    }

    fn apply_tick_adjustment(&mut self, adjustment: TickAdjustment) -> Result<(), ReplicationError> {
        let Some(delta) = self.tracker.accept(adjustment) else {
            return Ok(());
        };
        let offset = self.offset.apply_adjustment(delta)?;
        self.clock.apply_adjustment(delta);
        self.stats.adjustments_applied += 1;
        tracing::debug!(
            adjustment = delta,
            iteration = adjustment.iteration,
            offset,
            lead = self.lead(),
            "tick adjustment applied"
        );
        self.check_lead()
    }

    fn check_lead(&self) -> Result<(), ReplicationError> {
        let lead = self.lead();
        let capacity = self.reconciler.history().capacity();
        if lead >= capacity as i64 {
            return Err(ReplicationError::LatencyExhausted { lead, capacity });
        }
        Ok(())
    }

    /// Runs exactly one tick.
    pub fn process_tick(&mut self) -> Result<Tick, ReplicationError> {
        let session = self.session.ok_or(ReplicationError::NotConnected)?;
        let tick = self.clock.advance();

        self.hooks.before(TickPhase::Lifecycle, &mut self.world, tick);
        self.apply_remote(tick)?;
        self.apply_rejections(session);
        self.hooks.after(TickPhase::Lifecycle, &mut self.world, tick);

        self.hooks.before(TickPhase::Movement, &mut self.world, tick);
        self.predict(tick, session)?;
        self.hooks.after(TickPhase::Movement, &mut self.world, tick);

        self.hooks.before(TickPhase::Casts, &mut self.world, tick);
        self.run_casts(tick, session);
        self.hooks.after(TickPhase::Casts, &mut self.world, tick);

        self.hooks.before(TickPhase::Replication, &mut self.world, tick);
        self.send_tick(tick)?;
        self.hooks.after(TickPhase::Replication, &mut self.world, tick);

        self.stats.ticks += 1;
        Ok(tick)
    }

    fn apply_remote(&mut self, tick: Tick) -> Result<(), ReplicationError> {
        let Some(desired) = self.offset.desired_apply_tick(tick) else {
            return Ok(());
        };
        loop {
            let next = [
                self.deletes.peek_tick(),
                self.inits.peek_tick(),
                self.components.peek_tick(),
                self.movement.peek_tick(),
                self.casts.peek_tick(),
            ]
            .into_iter()
            .flatten()
            .min();
            let Some(next) = next.filter(|t| *t <= desired) else {
                break;
            };

            for id in self.deletes.drain_tick(next) {
                self.registry.apply_delete(&mut self.world, id)?;
                self.stats.deletes_applied += 1;
            }
            for snapshot in self.inits.drain_tick(next) {
                let entity = self.registry.apply_init(&mut self.world, &snapshot)?;
                mirror_cast(&mut self.world, entity, snapshot.entity, &snapshot.components, next, tick);
                self.stats.inits_applied += 1;
            }
            for (id, components) in self.components.drain_tick(next) {
                self.registry
                    .apply_components(&mut self.world, id, &components)?;
                if let Some(entity) = self.registry.entity(id) {
                    mirror_cast(&mut self.world, entity, id, &components, next, tick);
                }
            }
            for update in self.movement.drain_tick(next) {
                self.registry.apply_movement(
                    &mut self.world,
                    update.entity,
                    update.position,
                    update.velocity,
                    update.input,
                )?;
                self.stats.movement_updates_applied += 1;
            }
            for cast in self.casts.drain_tick(next) {
                self.apply_remote_cast(cast);
            }
            self.last_applied = Some(next);
        }
        Ok(())
    }

    fn apply_remote_cast(&mut self, cast: RemoteCast) {
        match cast {
            RemoteCast::Started {
                caster,
                castable,
                target,
            } => {
                if let Err(reason) = begin_cast(
                    &mut self.world,
                    &self.registry,
                    caster,
                    castable,
                    &target,
                    None,
                    false,
                ) {
                    tracing::trace!(caster = caster.0, %reason, "remote cast not mirrored");
                }
            }
            RemoteCast::Failed { caster, castable } => {
                let Some(entity) = self.registry.entity(caster) else {
                    return;
                };
                let matches = self
                    .world
                    .get::<CastState>(entity)
                    .is_some_and(|cast| cast.castable == castable);
                if matches {
                    cancel_cast(&mut self.world, entity);
                }
            }
        }
    }

    /// Tears down local casts the server rejected. A rejection only applies
    /// to the request it answers; anything else already ended locally.
    fn apply_rejections(&mut self, session: Session) {
        for rejection in std::mem::take(&mut self.rejections) {
            let matches = self.world.get::<CastState>(session.entity).is_some_and(|cast| {
                cast.castable == rejection.castable
                    && rejection.request_id.is_some()
                    && cast.request_id == rejection.request_id
            });
            if matches {
                cancel_cast(&mut self.world, session.entity);
                self.stats.casts_rejected += 1;
                tracing::debug!(
                    castable = rejection.castable.0,
                    request_id = ?rejection.request_id,
                    reason = %rejection.reason,
                    "server rejected predicted cast"
                );
            }
        }
    }

    fn predict(&mut self, tick: Tick, session: Session) -> Result<(), ReplicationError> {
        let collision = self
            .world
            .get::<Collision>(session.entity)
            .copied()
            .unwrap_or_default();
        let corrections = std::mem::take(&mut self.corrections);
        let report = self.reconciler.tick(
            tick,
            &mut self.predicted,
            &collision,
            self.input,
            &corrections,
            self.resolver.as_ref(),
        )?;
        if report.corrected {
            self.stats.corrections_applied += 1;
        }
        if report.input_mismatch {
            self.stats.input_mismatches += 1;
        }
        self.stats.inputs_replayed += u64::from(report.replayed);

        let current_input = self.reconciler.history().current();
        if let Ok(mut entity_mut) = self.world.get_entity_mut(session.entity) {
            entity_mut.insert((
                self.predicted.position,
                self.predicted.velocity,
                PlayerInput(current_input),
            ));
        }
        self.check_lead()
    }

    fn run_casts(&mut self, tick: Tick, session: Session) {
        let ctx = CastContext {
            registry: &self.castables,
            lookup: &self.registry,
            line_of_sight: self.line_of_sight.as_ref(),
            tick_duration: self.settings.tick_duration(),
        };
        for event in update_casts(&mut self.world, &ctx, self.effects.as_mut(), tick) {
            match event {
                CastEvent::Completed(cast) if cast.caster == session.id => {
                    self.stats.casts_completed += 1;
                }
                CastEvent::Canceled { cast, reason } if cast.caster == session.id => {
                    self.stats.casts_canceled += 1;
                    tracing::debug!(castable = cast.castable.0, %reason, "predicted cast canceled");
                }
                _ => {}
            }
        }
    }

    fn send_tick(&mut self, tick: Tick) -> Result<(), ReplicationError> {
        let adjustment_iteration = self.tracker.last_iteration();
        let mut sent = false;

        if self.input != self.last_sent_input {
            self.transport.send(&ClientMessage::InputChange {
                tick,
                input: self.input,
                adjustment_iteration,
            })?;
            self.last_sent_input = self.input;
            sent = true;
        }

        for mut request in std::mem::take(&mut self.outgoing_casts) {
            request.tick = tick;
            request.adjustment_iteration = adjustment_iteration;
            self.transport.send(&ClientMessage::CastRequest(request))?;
            sent = true;
        }

        if !sent {
            self.transport.send(&ClientMessage::Heartbeat {
                tick,
                adjustment_iteration,
            })?;
        }
        Ok(())
    }
}
