//! Error taxonomy for the replication core.
//!
//! [`ProtocolViolation`]s are fatal for the connection (server) or session
//! (client) they are raised on. [`CastFailure`](crate::cast::CastFailure) is
//! the recoverable counterpart and lives next to the cast state machine.

use crate::tick::Tick;
use crate::transport::TransportError;
use crate::world::NetworkId;

/// A broken ordering or consistency invariant. Never patched over.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// A movement correction arrived for a tick at or before the last one
    /// already reconciled.
    #[error("correction for tick {received} arrived after tick {last} was already reconciled")]
    OutOfOrderCorrection {
        /// Tick carried by the offending correction.
        received: Tick,
        /// Last tick that was reconciled.
        last: Tick,
    },

    /// The server described a tick the client has not simulated yet.
    #[error("correction for tick {received} is ahead of the local tick {current}")]
    CorrectionFromFuture {
        /// Tick carried by the correction.
        received: Tick,
        /// Local tick at the time of processing.
        current: Tick,
    },

    /// A correction is older than the input history can replay.
    #[error("input history exceeded: age {age} >= capacity {capacity}")]
    InputHistoryExceeded {
        /// Age of the correction in ticks.
        age: u32,
        /// Length of the input history.
        capacity: usize,
    },

    /// An init was received for a handle the registry already holds.
    #[error("init received for live entity {0:?}")]
    InitForLiveEntity(NetworkId),

    /// A delete was received for a handle the registry does not hold.
    #[error("delete received for unknown entity {0:?}")]
    DeleteForUnknownEntity(NetworkId),

    /// A component or movement update targeted an unknown handle.
    #[error("update received for unknown entity {0:?}")]
    UpdateForUnknownEntity(NetworkId),

    /// An AOI set is out of step with the spatial index.
    #[error("AOI desync: {subject:?} {detail} in the set of {observer:?}")]
    AoiDesync {
        /// Entity whose AOI set was being edited.
        observer: NetworkId,
        /// Member that was expected (or not expected).
        subject: NetworkId,
        /// `"missing"` or `"already present"`.
        detail: &'static str,
    },

    /// The replication offset reached zero or above.
    #[error("replication offset must stay negative, got {0}")]
    NonNegativeReplicationOffset(i32),

    /// A message that requires a completed handshake arrived before it.
    #[error("message received before the connection handshake completed")]
    NotHandshaken,
}

/// Top-level error for server and client operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Fatal ordering/consistency violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// Accumulated tick lead outgrew the input history.
    #[error("latency exhausted: tick lead {lead} needs more than {capacity} ticks of input history")]
    LatencyExhausted {
        /// Ticks the client is running ahead of the server.
        lead: i64,
        /// Input history length.
        capacity: usize,
    },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Settings rejected at construction.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// An operation that needs a live session was called without one.
    #[error("not connected")]
    NotConnected,
}
