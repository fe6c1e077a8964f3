//! Timed-action ("cast") state machine.
//!
//! The same validation and the same per-tick update run on both sides. The
//! client runs them optimistically for its own entity and mirrors casts of
//! observed entities; the server runs them authoritatively.
//!
//! ```text
//! Unstarted ──first update──▶ Casting ──end tick, re-check ok──▶ CastComplete ──graphic done──▶ removed
//!                                │                                   (skipped when there is no graphic)
//!                                └──moved / target gone / re-check fails / effects reject──▶ removed
//! ```

use std::time::Duration;

use bevy_ecs::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::movement::{Position, Velocity};
use crate::tick::{Tick, ticks_for};
use crate::world::{EntityLookup, NetworkId};

/// Default global cooldown.
pub const DEFAULT_GLOBAL_COOLDOWN: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Identifies a castable definition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CastableId(pub u32);

/// What a castable acts on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastableKind {
    /// Using an item.
    ItemInteraction,
    /// Interacting with another entity.
    EntityInteraction,
    /// A spell.
    Spell,
}

/// Target a castable requires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// No target.
    None,
    /// Another entity.
    Entity,
    /// A world position.
    Position,
}

/// Static definition of a timed action.
#[derive(Debug, Clone, PartialEq)]
pub struct Castable {
    /// Definition id.
    pub id: CastableId,
    /// Display name.
    pub name: String,
    /// Category.
    pub kind: CastableKind,
    /// Required target.
    pub target: TargetKind,
    /// Time from start to completion. Zero means instant.
    pub cast_time: Duration,
    /// Maximum caster-to-target distance, if limited.
    pub range: Option<f32>,
    /// Whether the target must be visible from the caster.
    pub requires_line_of_sight: bool,
    /// Per-castable cooldown, started when casting begins.
    pub cooldown: Duration,
    /// Whether starting this cast triggers the global cooldown.
    pub triggers_gcd: bool,
    /// Whether observers are told the cast started.
    pub visible_effects: bool,
    /// Duration of the post-cast graphic, if any.
    pub complete_graphic: Option<Duration>,
}

impl Castable {
    /// A spell with the given cast time and no other restrictions.
    pub fn spell(id: u32, name: &str, cast_time: Duration) -> Self {
        Self {
            id: CastableId(id),
            name: name.to_owned(),
            kind: CastableKind::Spell,
            target: TargetKind::None,
            cast_time,
            range: None,
            requires_line_of_sight: false,
            cooldown: Duration::ZERO,
            triggers_gcd: true,
            visible_effects: true,
            complete_graphic: None,
        }
    }

    /// Returns `true` if the cast completes on the tick it starts.
    pub fn is_instant(&self) -> bool {
        self.cast_time.is_zero()
    }
}

/// Every castable known to one side.
#[derive(Debug, Clone)]
pub struct CastableRegistry {
    castables: FxHashMap<CastableId, Castable>,
    global_cooldown: Duration,
}

impl Default for CastableRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_COOLDOWN)
    }
}

impl CastableRegistry {
    /// Creates an empty registry.
    pub fn new(global_cooldown: Duration) -> Self {
        Self {
            castables: FxHashMap::default(),
            global_cooldown,
        }
    }

    /// Adds or replaces a definition.
    pub fn register(&mut self, castable: Castable) {
        self.castables.insert(castable.id, castable);
    }

    /// Looks up a definition.
    pub fn get(&self, id: CastableId) -> Option<&Castable> {
        self.castables.get(&id)
    }

    /// Global cooldown duration.
    pub fn global_cooldown(&self) -> Duration {
        self.global_cooldown
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.castables.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.castables.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Failures and collaborators
// ---------------------------------------------------------------------------

/// Why a cast could not start or was canceled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CastFailure {
    /// No such castable.
    #[error("unknown castable")]
    UnknownCastable,
    /// The caster is not a valid entity.
    #[error("invalid caster")]
    InvalidCaster,
    /// The caster is already casting.
    #[error("already casting")]
    AlreadyCasting,
    /// This castable is cooling down.
    #[error("castable on cooldown")]
    OnCooldown,
    /// The global cooldown is running.
    #[error("global cooldown")]
    OnGlobalCooldown,
    /// Missing or vanished target.
    #[error("invalid target")]
    InvalidTarget,
    /// Target is too far away.
    #[error("target out of range")]
    OutOfRange,
    /// Target is not visible.
    #[error("no line of sight")]
    NoLineOfSight,
    /// The caster moved during a non-instant cast.
    #[error("caster is moving")]
    Moving,
    /// The effects callback declined the cast.
    #[error("rejected")]
    Rejected,
}

/// Line-of-sight test between two points.
pub trait LineOfSight {
    /// Returns `true` if `to` is visible from `from`.
    fn has_line_of_sight(&self, world: &World, from: Position, to: Position) -> bool;
}

/// Everything is visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearSight;

impl LineOfSight for ClearSight {
    fn has_line_of_sight(&self, _world: &World, _from: Position, _to: Position) -> bool {
        true
    }
}

/// Host callback applying a cast's consequences when it completes.
pub trait CastEffects {
    /// Applies the cast. Returning an error cancels it instead.
    fn on_complete(&mut self, world: &mut World, cast: &CastState) -> Result<(), CastFailure>;
}

/// Effects that always succeed and do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEffects;

impl CastEffects for NoEffects {
    fn on_complete(&mut self, _world: &mut World, _cast: &CastState) -> Result<(), CastFailure> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Lifecycle stage of a cast.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastLifecycle {
    /// Validated, not processed by a tick yet.
    Unstarted,
    /// In progress until `end_tick`.
    Casting,
    /// Completed; the post-cast graphic plays until `end_tick`.
    CastComplete,
}

/// Cast in progress on an entity. At most one per entity.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct CastState {
    /// What is being cast.
    pub castable: CastableId,
    /// Casting entity.
    pub caster: NetworkId,
    /// Target entity, if any.
    pub target_entity: Option<NetworkId>,
    /// Target position, if any.
    pub target_position: Option<Position>,
    /// Current stage.
    pub state: CastLifecycle,
    /// Tick the current stage ends on (unset while unstarted).
    pub end_tick: Tick,
    /// Caster position when the cast was requested.
    pub start_position: Position,
    /// Client request this cast answers.
    pub request_id: Option<u32>,
    /// `true` on the client for its own optimistic casts.
    pub predicted: bool,
}

/// Target of a cast request.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CastTarget {
    /// Target entity.
    pub entity: Option<NetworkId>,
    /// Target position.
    pub position: Option<Position>,
}

impl CastTarget {
    /// No target.
    pub const NONE: CastTarget = CastTarget {
        entity: None,
        position: None,
    };

    /// Targets an entity.
    pub fn entity(id: NetworkId) -> Self {
        Self {
            entity: Some(id),
            position: None,
        }
    }

    /// Targets a position.
    pub fn position(position: Position) -> Self {
        Self {
            entity: None,
            position: Some(position),
        }
    }
}

/// Per-entity cooldown bookkeeping.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct CastCooldowns {
    ready_at: FxHashMap<CastableId, Tick>,
    gcd_ready_at: Tick,
}

impl CastCooldowns {
    /// Returns `true` if `castable` may start on `tick`.
    pub fn is_ready(&self, castable: CastableId, tick: Tick) -> bool {
        self.ready_at.get(&castable).is_none_or(|ready| tick >= *ready)
    }

    /// Returns `true` if the global cooldown has elapsed on `tick`.
    pub fn gcd_ready(&self, tick: Tick) -> bool {
        tick >= self.gcd_ready_at
    }

    /// Starts the cooldowns triggered by `castable` on `tick`.
    pub fn stamp(&mut self, castable: &Castable, tick: Tick, tick_duration: Duration, gcd: Duration) {
        if !castable.cooldown.is_zero() {
            self.ready_at
                .insert(castable.id, tick + ticks_for(castable.cooldown, tick_duration));
        }
        if castable.triggers_gcd && !gcd.is_zero() {
            self.gcd_ready_at = self.gcd_ready_at.max(tick + ticks_for(gcd, tick_duration));
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn target_position(
    world: &World,
    lookup: &dyn EntityLookup,
    castable: &Castable,
    target: &CastTarget,
) -> Result<Option<Position>, CastFailure> {
    match castable.target {
        TargetKind::None => Ok(None),
        TargetKind::Entity => {
            let id = target.entity.ok_or(CastFailure::InvalidTarget)?;
            let entity = lookup.lookup(id).ok_or(CastFailure::InvalidTarget)?;
            let position = world
                .get::<Position>(entity)
                .ok_or(CastFailure::InvalidTarget)?;
            Ok(Some(*position))
        }
        TargetKind::Position => target.position.map(Some).ok_or(CastFailure::InvalidTarget),
    }
}

fn check_reach(
    world: &World,
    los: &dyn LineOfSight,
    castable: &Castable,
    from: Position,
    to: Option<Position>,
) -> Result<(), CastFailure> {
    let Some(to) = to else {
        return Ok(());
    };
    if let Some(range) = castable.range
        && !from.within(&to, range)
    {
        return Err(CastFailure::OutOfRange);
    }
    if castable.requires_line_of_sight && !los.has_line_of_sight(world, from, to) {
        return Err(CastFailure::NoLineOfSight);
    }
    Ok(())
}

/// Borrowed collaborators shared by validation and the per-tick update.
pub struct CastContext<'a> {
    /// Castable definitions.
    pub registry: &'a CastableRegistry,
    /// Handle resolution.
    pub lookup: &'a dyn EntityLookup,
    /// Line-of-sight test.
    pub line_of_sight: &'a dyn LineOfSight,
    /// Duration of one tick.
    pub tick_duration: Duration,
}

/// Checks whether `caster` may start `castable` on `tick`. Client and
/// server run this same predicate.
pub fn validate_cast<'r>(
    world: &World,
    ctx: &CastContext<'r>,
    caster: NetworkId,
    castable: CastableId,
    target: &CastTarget,
    tick: Tick,
) -> Result<&'r Castable, CastFailure> {
    let castable = ctx
        .registry
        .get(castable)
        .ok_or(CastFailure::UnknownCastable)?;
    let entity = ctx.lookup.lookup(caster).ok_or(CastFailure::InvalidCaster)?;
    let position = *world
        .get::<Position>(entity)
        .ok_or(CastFailure::InvalidCaster)?;

    if let Some(existing) = world.get::<CastState>(entity)
        && existing.state != CastLifecycle::CastComplete
    {
        return Err(CastFailure::AlreadyCasting);
    }
    if let Some(cooldowns) = world.get::<CastCooldowns>(entity) {
        if castable.triggers_gcd && !cooldowns.gcd_ready(tick) {
            return Err(CastFailure::OnGlobalCooldown);
        }
        if !cooldowns.is_ready(castable.id, tick) {
            return Err(CastFailure::OnCooldown);
        }
    }

    let to = target_position(world, ctx.lookup, castable, target)?;
    check_reach(world, ctx.line_of_sight, castable, position, to)?;

    if !castable.is_instant()
        && world
            .get::<Velocity>(entity)
            .is_some_and(|velocity| !velocity.is_zero())
    {
        return Err(CastFailure::Moving);
    }
    Ok(castable)
}

/// Attaches a new, unstarted cast to `caster`, replacing a completed one.
pub fn begin_cast(
    world: &mut World,
    lookup: &dyn EntityLookup,
    caster: NetworkId,
    castable: CastableId,
    target: &CastTarget,
    request_id: Option<u32>,
    predicted: bool,
) -> Result<(), CastFailure> {
    let entity = lookup.lookup(caster).ok_or(CastFailure::InvalidCaster)?;
    let start_position = world
        .get::<Position>(entity)
        .copied()
        .ok_or(CastFailure::InvalidCaster)?;
    let mut entity_mut = world
        .get_entity_mut(entity)
        .map_err(|_| CastFailure::InvalidCaster)?;
    entity_mut.insert(CastState {
        castable,
        caster,
        target_entity: target.entity,
        target_position: target.position,
        state: CastLifecycle::Unstarted,
        end_tick: 0,
        start_position,
        request_id,
        predicted,
    });
    Ok(())
}

/// Removes the cast on `entity`, returning it.
pub fn cancel_cast(world: &mut World, entity: Entity) -> Option<CastState> {
    world.get_entity_mut(entity).ok()?.take::<CastState>()
}

// ---------------------------------------------------------------------------
// Per-tick update
// ---------------------------------------------------------------------------

/// Observable outcome of one cast update.
#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    /// The cast entered `Casting`.
    Started(CastState),
    /// The cast completed and its effects were applied.
    Completed(CastState),
    /// The cast was canceled and removed.
    Canceled {
        /// The removed state.
        cast: CastState,
        /// Why.
        reason: CastFailure,
    },
    /// The cast state was removed after completing.
    Removed(CastState),
}

fn finish(world: &mut World, entity: Entity, cast: CastState, events: &mut Vec<CastEvent>) {
    if cancel_cast(world, entity).is_some() {
        events.push(CastEvent::Removed(cast));
    }
}

fn cancel(
    world: &mut World,
    entity: Entity,
    cast: CastState,
    reason: CastFailure,
    events: &mut Vec<CastEvent>,
) {
    if cancel_cast(world, entity).is_some() {
        tracing::debug!(caster = cast.caster.0, castable = cast.castable.0, %reason, "cast canceled");
        events.push(CastEvent::Canceled { cast, reason });
    }
}

/// Advances every cast in `world` by one tick.
pub fn update_casts(
    world: &mut World,
    ctx: &CastContext<'_>,
    effects: &mut dyn CastEffects,
    tick: Tick,
) -> Vec<CastEvent> {
    let mut query = world.query::<(Entity, &CastState)>();
    let mut casts: Vec<(Entity, CastState)> = query
        .iter(world)
        .map(|(entity, cast)| (entity, cast.clone()))
        .collect();
    casts.sort_by_key(|(_, cast)| cast.caster);

    let mut events = Vec::new();
    for (entity, mut cast) in casts {
        let Some(castable) = ctx.registry.get(cast.castable) else {
            cancel(world, entity, cast, CastFailure::UnknownCastable, &mut events);
            continue;
        };

        if cast.state == CastLifecycle::Unstarted {
            cast.state = CastLifecycle::Casting;
            cast.end_tick = tick + ticks_for(castable.cast_time, ctx.tick_duration);
            let gcd = ctx.registry.global_cooldown();
            if let Some(mut cooldowns) = world.get_mut::<CastCooldowns>(entity) {
                cooldowns.stamp(castable, tick, ctx.tick_duration, gcd);
            } else if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                let mut cooldowns = CastCooldowns::default();
                cooldowns.stamp(castable, tick, ctx.tick_duration, gcd);
                entity_mut.insert(cooldowns);
            }
            events.push(CastEvent::Started(cast.clone()));
        }

        match cast.state {
            CastLifecycle::Unstarted => {}
            CastLifecycle::Casting => {
                let Some(position) = world.get::<Position>(entity).copied() else {
                    cancel(world, entity, cast, CastFailure::InvalidCaster, &mut events);
                    continue;
                };
                if !castable.is_instant() && position != cast.start_position {
                    cancel(world, entity, cast, CastFailure::Moving, &mut events);
                    continue;
                }
                let target = CastTarget {
                    entity: cast.target_entity,
                    position: cast.target_position,
                };
                let to = match target_position(world, ctx.lookup, castable, &target) {
                    Ok(to) => to,
                    Err(reason) => {
                        cancel(world, entity, cast, reason, &mut events);
                        continue;
                    }
                };

                if tick < cast.end_tick {
                    if let Some(mut stored) = world.get_mut::<CastState>(entity) {
                        *stored = cast;
                    }
                    continue;
                }

                if let Err(reason) = check_reach(world, ctx.line_of_sight, castable, position, to) {
                    cancel(world, entity, cast, reason, &mut events);
                    continue;
                }
                if let Err(reason) = effects.on_complete(world, &cast) {
                    cancel(world, entity, cast, reason, &mut events);
                    continue;
                }

                events.push(CastEvent::Completed(cast.clone()));
                match castable.complete_graphic {
                    Some(graphic) if !graphic.is_zero() => {
                        cast.state = CastLifecycle::CastComplete;
                        cast.end_tick = tick + ticks_for(graphic, ctx.tick_duration);
                        if let Some(mut stored) = world.get_mut::<CastState>(entity) {
                            *stored = cast;
                        }
                    }
                    _ => finish(world, entity, cast, &mut events),
                }
            }
            CastLifecycle::CastComplete => {
                if tick >= cast.end_tick {
                    finish(world, entity, cast, &mut events);
                }
            }
        }
    }
    events
}

#[cfg(test)]
#[path = "cast_tests.rs"]
mod tests;
