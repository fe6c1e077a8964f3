//! Server-authoritative multiplayer: a fixed-tick clock kept in step by tick
//! adjustments, client-side movement prediction with reconciliation, AOI
//! driven entity replication applied behind a replication offset, and a
//! predicted cast state machine.

pub mod adjustment;
pub mod aoi;
pub mod cast;
pub mod client;
pub mod codec;
pub mod error;
pub mod hooks;
pub mod input_history;
pub mod lifecycle;
pub mod messages;
pub mod movement;
pub mod offset;
pub mod reconciler;
pub mod server;
pub mod settings;
pub mod spatial;
pub mod tick;
pub mod transport;
pub mod world;

pub use adjustment::{AdjustmentPolicy, AdjustmentTracker, TickAdjustment, TickDiffHistory};
pub use aoi::{AoiDiff, AoiEvent, AoiTracker};
pub use cast::{
    CastEffects, CastFailure, CastLifecycle, CastState, CastTarget, Castable, CastableId,
    CastableKind, CastableRegistry, LineOfSight, TargetKind,
};
pub use client::{ClientStats, ReplicationClient};
pub use codec::{CodecError, CompressionConfig};
pub use error::{ProtocolViolation, ReplicationError};
pub use hooks::{NoHooks, TickHooks, TickPhase};
pub use input_history::InputHistory;
pub use messages::{CastRequest, ClientMessage, ServerMessage};
pub use movement::{
    BoundedWorld, Collision, InputDirection, InputState, MovementResolver, OpenWorld, Position,
    Velocity,
};
pub use offset::{ReplicationOffset, TickQueue};
pub use reconciler::{MovementCorrection, PredictedState, PredictionReconciler};
pub use server::{ConnectionStats, ReplicationServer, ServerStats};
pub use settings::SimulationSettings;
pub use spatial::{GridSpatialIndex, SpatialIndex};
pub use tick::{Tick, TickClock};
pub use transport::{
    ClientTransport, LoopbackClientTransport, LoopbackConnector, LoopbackServerTransport,
    ServerTransport, TransportError, loopback,
};
pub use world::{
    ActiveCast, ConnectionId, EntityName, EntitySnapshot, NetworkId, PlayerInput,
    ReplicatedComponent,
};
