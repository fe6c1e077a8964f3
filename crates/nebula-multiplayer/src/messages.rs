//! Wire message types.
//!
//! Each direction is a closed sum type matched exhaustively by its receiver.
//! The `Extension` arm carries host-defined payloads that the replication
//! core forwards untouched.

use serde::{Deserialize, Serialize};

use crate::adjustment::TickAdjustment;
use crate::cast::{CastFailure, CastableId};
use crate::movement::{InputState, Position, Velocity};
use crate::tick::Tick;
use crate::world::{EntitySnapshot, NetworkId, ReplicatedComponent};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Messages sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    /// First message of a session.
    ConnectionRequest {
        /// Display name for the player entity.
        player_name: String,
    },
    /// The held movement keys changed.
    InputChange {
        /// Client tick the input applies to.
        tick: Tick,
        /// New input.
        input: InputState,
        /// Last adjustment iteration the client applied.
        adjustment_iteration: u32,
    },
    /// Request to start a cast.
    CastRequest(CastRequest),
    /// Sent on ticks with no other traffic so tick diffs stay fresh.
    Heartbeat {
        /// Client tick at send time.
        tick: Tick,
        /// Last adjustment iteration the client applied.
        adjustment_iteration: u32,
    },
    /// Host-defined message.
    Extension {
        /// Host-defined discriminant.
        kind: u16,
        /// Opaque payload.
        payload: Vec<u8>,
    },
}

impl ClientMessage {
    /// Client tick and adjustment iteration carried by the message.
    pub fn tick_stamp(&self) -> Option<(Tick, u32)> {
        match self {
            ClientMessage::InputChange {
                tick,
                adjustment_iteration,
                ..
            }
            | ClientMessage::Heartbeat {
                tick,
                adjustment_iteration,
            } => Some((*tick, *adjustment_iteration)),
            ClientMessage::CastRequest(request) => {
                Some((request.tick, request.adjustment_iteration))
            }
            ClientMessage::ConnectionRequest { .. } | ClientMessage::Extension { .. } => None,
        }
    }
}

/// A cast request. Retries after a rejection carry a fresh `request_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CastRequest {
    /// Client tick the cast was started on.
    pub tick: Tick,
    /// Client-unique, monotonically increasing request id.
    pub request_id: u32,
    /// What is being cast.
    pub castable: CastableId,
    /// Target entity, for entity-targeted castables.
    pub target_entity: Option<NetworkId>,
    /// Target position, for position-targeted castables.
    pub target_position: Option<Position>,
    /// Last adjustment iteration the client applied.
    pub adjustment_iteration: u32,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    /// Reply to [`ClientMessage::ConnectionRequest`].
    ConnectionResponse {
        /// Handle of the player's own entity.
        entity: NetworkId,
        /// Server tick at the time of the reply.
        tick: Tick,
        /// Spawn position.
        position: Position,
    },
    /// Clock correction for the client.
    TickAdjustment(TickAdjustment),
    /// An entity entered the client's AOI.
    EntityInit {
        /// Server tick the snapshot describes.
        tick: Tick,
        /// Full replicated state.
        snapshot: EntitySnapshot,
    },
    /// An entity left the client's AOI or was destroyed.
    EntityDelete {
        /// Server tick of the removal.
        tick: Tick,
        /// Removed handle.
        entity: NetworkId,
    },
    /// Non-movement components changed.
    ComponentUpdate {
        /// Server tick of the change.
        tick: Tick,
        /// Changed entity.
        entity: NetworkId,
        /// New values.
        components: Vec<ReplicatedComponent>,
    },
    /// Authoritative movement state after `tick`.
    MovementUpdate {
        /// Server tick the state describes.
        tick: Tick,
        /// Moved entity.
        entity: NetworkId,
        /// Position after the tick.
        position: Position,
        /// Velocity applied during the tick.
        velocity: Velocity,
        /// Input used for the tick.
        input: InputState,
    },
    /// Another entity started a cast with visible effects.
    CastStarted {
        /// Server tick the cast started on.
        tick: Tick,
        /// Casting entity.
        caster: NetworkId,
        /// What is being cast.
        castable: CastableId,
        /// Target entity, if any.
        target_entity: Option<NetworkId>,
        /// Target position, if any.
        target_position: Option<Position>,
    },
    /// A cast was rejected or canceled.
    CastFailed {
        /// Server tick of the failure.
        tick: Tick,
        /// Casting entity.
        caster: NetworkId,
        /// What was being cast.
        castable: CastableId,
        /// Request the failure answers, when sent to the requester.
        request_id: Option<u32>,
        /// Why it failed.
        reason: CastFailure,
    },
    /// Host-defined message.
    Extension {
        /// Host-defined discriminant.
        kind: u16,
        /// Opaque payload.
        payload: Vec<u8>,
    },
}

impl ServerMessage {
    /// Server tick the message describes, if it is tick-stamped.
    pub fn tick(&self) -> Option<Tick> {
        match self {
            ServerMessage::ConnectionResponse { tick, .. }
            | ServerMessage::EntityInit { tick, .. }
            | ServerMessage::EntityDelete { tick, .. }
            | ServerMessage::ComponentUpdate { tick, .. }
            | ServerMessage::MovementUpdate { tick, .. }
            | ServerMessage::CastStarted { tick, .. }
            | ServerMessage::CastFailed { tick, .. } => Some(*tick),
            ServerMessage::TickAdjustment(_) | ServerMessage::Extension { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_stamp_of_client_messages() {
        let heartbeat = ClientMessage::Heartbeat {
            tick: 40,
            adjustment_iteration: 2,
        };
        assert_eq!(heartbeat.tick_stamp(), Some((40, 2)));
        let hello = ClientMessage::ConnectionRequest {
            player_name: "a".into(),
        };
        assert_eq!(hello.tick_stamp(), None);
    }

    #[test]
    fn test_cast_failed_json_shape() {
        let msg = ServerMessage::CastFailed {
            tick: 9,
            caster: NetworkId(4),
            castable: CastableId(2),
            request_id: Some(17),
            reason: CastFailure::OutOfRange,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["CastFailed"]["reason"], "OutOfRange");
        assert_eq!(json["CastFailed"]["request_id"], 17);
        assert_eq!(msg.tick(), Some(9));
    }
}
