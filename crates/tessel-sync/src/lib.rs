// SPDX-License-Identifier: Apache-2.0
//! Real-time collaborative synchronization core for tessel puzzle sessions.
//!
//! Several participants manipulate a shared set of puzzle pieces until every
//! piece sits in its slot. Participants never talk to each other directly;
//! all coordination goes through a [`tessel_store::SharedStore`]. This crate
//! provides the protocol on top of that substrate:
//!
//! * [`locks::LockManager`] — per-piece exclusive manipulation rights
//!   (CAS-arbitrated, TTL-evicted)
//! * [`pieces::PieceSync`] — position streaming with per-piece sequence
//!   numbers, placement validation and snapping
//! * [`progress::ProgressCoordinator`] — placement aggregation, scoring,
//!   and the exactly-once completion transition
//! * [`presence::PresenceManager`] — heartbeats, liveness, join/leave
//! * [`session::SessionControl`] — the waiting/playing/paused/completed
//!   state machine and host-only controls
//!
//! [`SyncEngine`] composes the five components behind the per-participant
//! facade consumed by the rendering/input layer.
//!
//! Conflict resolution is deliberately coarse: one lock per piece, no
//! per-field merging. Time never comes from ambient clocks inside the
//! protocol; operations take an explicit `now_ms` so behavior is
//! deterministic under test.

use tessel_proto::{CompletionRecord, ParticipantId, PieceId, SessionState};
use thiserror::Error;

pub mod engine;
pub mod locks;
pub mod pieces;
pub mod presence;
pub mod progress;
pub mod session;

pub use engine::{ConnectionState, PieceView, SyncEngine};

/// Error type for synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Substrate failure.
    #[error(transparent)]
    Store(#[from] tessel_store::StoreError),
    /// A stored record failed to decode.
    #[error("codec error at {path}: {reason}")]
    Codec {
        /// Store path of the undecodable record.
        path: String,
        /// Decoder failure description.
        reason: String,
    },
    /// Piece interaction attempted outside the `Playing` state.
    #[error("interaction requires a playing session (state: {0:?})")]
    NotPlaying(SessionState),
    /// A host-only operation was attempted by a non-host participant.
    #[error("only the host may {0}")]
    HostOnly(&'static str),
    /// The requested state change is not a legal transition.
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
    /// The session does not exist in the store.
    #[error("unknown session {0}")]
    UnknownSession(String),
    /// The piece does not exist in the session.
    #[error("unknown piece {0}")]
    UnknownPiece(PieceId),
}

/// Tunable protocol timings and retry budgets.
///
/// The defaults are reasonable rather than sacred; deployments tune them.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Idle window after which a lock with no position update is treated as
    /// abandoned and may be evicted by any observer.
    pub lock_ttl_ms: u64,
    /// Window within which consecutive correct placements by one
    /// participant chain into a combo.
    pub combo_window_ms: u64,
    /// Drag duration below which a placement earns the speed bonus.
    pub speed_bonus_window_ms: u64,
    /// Heartbeat silence after which a participant counts as offline.
    pub offline_threshold_ms: u64,
    /// Suggested interval between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Retry budget for transactional store updates.
    pub txn_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 5_000,
            combo_window_ms: 3_000,
            speed_bonus_window_ms: 5_000,
            offline_threshold_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            txn_attempts: 8,
        }
    }
}

/// Events surfaced to the rendering layer and external collaborators.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A piece was snapped to its target.
    PiecePlaced {
        /// The placed piece.
        piece_id: PieceId,
        /// Participant whose drop placed it.
        by: Option<ParticipantId>,
    },
    /// Global progress changed.
    ProgressChanged {
        /// Pieces placed so far.
        completed: u32,
        /// Total pieces.
        total: u32,
    },
    /// The session reached 100%; carries the finalized completion record.
    /// Observed exactly once per session per engine.
    SessionCompleted(CompletionRecord),
    /// A participant appeared or came back online.
    ParticipantJoined(ParticipantId),
    /// A participant left or went offline.
    ParticipantLeft(ParticipantId),
    /// A transactional write exhausted its retries; local optimistic state
    /// is kept and the user may retry.
    SyncDegraded,
    /// Connectivity to the substrate changed.
    ConnectionChanged(ConnectionState),
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(
    path: &str,
    value: &serde_json::Value,
) -> Result<T, SyncError> {
    serde_json::from_value(value.clone()).map_err(|e| SyncError::Codec {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
