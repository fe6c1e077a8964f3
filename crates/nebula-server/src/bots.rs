//! Scripted loopback clients.

use std::time::Duration;

use nebula_multiplayer::{
    CastTarget, Castable, CastableId, CastableKind, CastableRegistry, ClientStats, InputDirection,
    InputState, LoopbackClientTransport, NetworkId, Position, ReplicationClient, ReplicationError,
    TargetKind, Tick,
};

/// Instant position-targeted blink.
pub const SPARK: CastableId = CastableId(1);
/// One-second channel that must be cast standing still.
pub const MEDITATE: CastableId = CastableId(2);

/// Ticks per walking segment.
const SEGMENT_TICKS: Tick = 40;

/// Castables known to the host's server and every bot.
pub fn host_castables(global_cooldown: Duration) -> CastableRegistry {
    let mut registry = CastableRegistry::new(global_cooldown);
    registry.register(Castable {
        target: TargetKind::Position,
        range: Some(20.0),
        triggers_gcd: false,
        ..Castable::spell(SPARK.0, "spark", Duration::ZERO)
    });
    registry.register(Castable {
        kind: CastableKind::Spell,
        cooldown: Duration::from_secs(3),
        complete_graphic: Some(Duration::from_millis(500)),
        ..Castable::spell(MEDITATE.0, "meditate", Duration::from_secs(1))
    });
    registry
}

/// Input a bot holds on `tick`: walk a square, then rest one segment.
pub fn scripted_input(bot: u32, tick: Tick) -> InputState {
    let segment = (tick / SEGMENT_TICKS + bot) % 5;
    let direction = match segment {
        0 => InputDirection::XUp,
        1 => InputDirection::YUp,
        2 => InputDirection::XDown,
        3 => InputDirection::YDown,
        _ => return InputState::NONE,
    };
    InputState::NONE.with(direction)
}

/// What a bot casts on `tick`, if anything.
pub fn scripted_cast(bot: u32, tick: Tick, position: Position) -> Option<(CastableId, CastTarget)> {
    let segment = (tick / SEGMENT_TICKS + bot) % 5;
    match (segment, tick % SEGMENT_TICKS) {
        // Velocity of the last walking tick is still set on the first rest
        // tick, so wait one more.
        (4, 2) => Some((MEDITATE, CastTarget::NONE)),
        (0, 10) => Some((
            SPARK,
            CastTarget::position(Position::new(position.x + 5.0, position.y, position.z)),
        )),
        _ => None,
    }
}

/// One scripted client.
pub struct Bot {
    /// Index used to desynchronise scripts.
    pub index: u32,
    /// Display name.
    pub name: String,
    /// The client.
    pub client: ReplicationClient<LoopbackClientTransport>,
    /// Why the session ended, if it did.
    pub ended: Option<ReplicationError>,
    /// Casts refused locally before being sent.
    pub casts_refused: u64,
}

impl Bot {
    /// Wraps a connecting client.
    pub fn new(index: u32, client: ReplicationClient<LoopbackClientTransport>) -> Self {
        Self {
            index,
            name: format!("bot-{index}"),
            client,
            ended: None,
            casts_refused: 0,
        }
    }

    /// Whether the session is still running.
    pub fn is_active(&self) -> bool {
        self.ended.is_none()
    }

    /// Local entity handle, once connected.
    pub fn entity(&self) -> Option<NetworkId> {
        self.client.entity()
    }

    /// Client counters.
    pub fn stats(&self) -> ClientStats {
        self.client.stats()
    }

    /// Feeds the script for the next tick, then advances the client by `dt`.
    pub fn drive(&mut self, dt: Duration) {
        if !self.is_active() {
            return;
        }
        if self.client.is_connected() {
            let next = self.client.current_tick() + 1;
            self.client.set_input(scripted_input(self.index, next));
            let position = self.client.predicted().position;
            if let Some((castable, target)) = scripted_cast(self.index, next, position) {
                match self.client.request_cast(castable, target) {
                    Ok(request_id) => {
                        tracing::trace!(bot = %self.name, castable = castable.0, request_id, "cast requested");
                    }
                    Err(reason) => {
                        self.casts_refused += 1;
                        tracing::trace!(bot = %self.name, castable = castable.0, %reason, "cast refused locally");
                    }
                }
            }
        }
        if let Err(err) = self.client.frame(dt) {
            tracing::warn!(bot = %self.name, %err, "bot session ended");
            self.ended = Some(err);
        }
    }
}
