// SPDX-License-Identifier: Apache-2.0
//! Shared schema for tessel puzzle sessions.
//!
//! Everything that crosses a process boundary lives here: the puzzle data
//! model stored in the shared store, the slash-segmented store paths that
//! address it, and the CBOR wire framing used between store clients and the
//! hub service. The synchronization logic itself lives in `tessel-sync`.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod wire;

/// Logical session identifier (opaque, unique per shared store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Build a session id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Participant identifier (opaque, unique per session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Build a participant id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Piece identifier, derived from the grid coordinate as `row * cols + col`.
pub type PieceId = u32;

/// Difficulty tier. Each tier fixes the snap distance and whether a piece
/// must also be rotated back to its target orientation before it counts as
/// placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Large snap radius, rotation ignored.
    Easy,
    /// Medium snap radius, rotation ignored.
    Medium,
    /// Tight snap radius, rotation must match.
    Hard,
    /// Tightest snap radius, rotation must match.
    Expert,
}

impl Difficulty {
    /// Snap-distance threshold in workspace units. A drop is a placement
    /// only when the distance to the target is strictly below this value.
    pub fn snap_distance(self) -> f64 {
        match self {
            Self::Easy => 40.0,
            Self::Medium => 30.0,
            Self::Hard => 20.0,
            Self::Expert => 12.0,
        }
    }

    /// Whether placement additionally requires the piece rotation to sit
    /// within [`ROTATION_EPSILON_DEG`] of a full turn.
    pub fn rotation_required(self) -> bool {
        matches!(self, Self::Hard | Self::Expert)
    }
}

/// Tolerance, in degrees, around a multiple of 360° within which a rotation
/// counts as "back at the target orientation".
pub const ROTATION_EPSILON_DEG: f64 = 5.0;

/// A piece transform: position in workspace units plus rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Depth/stacking position (cosmetic; not part of placement checks).
    pub z: f64,
    /// Rotation in degrees.
    pub rot_deg: f64,
}

impl Transform {
    /// Position-only constructor with zero depth and rotation.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: 0.0,
            rot_deg: 0.0,
        }
    }

    /// Euclidean distance between this transform's position and `other`'s,
    /// ignoring depth and rotation.
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Whether the rotation sits within `epsilon_deg` of a multiple of 360°.
    pub fn rotation_aligned(&self, epsilon_deg: f64) -> bool {
        let r = self.rot_deg.rem_euclid(360.0);
        r <= epsilon_deg || (360.0 - r) <= epsilon_deg
    }
}

/// Immutable puzzle description, written once at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleSpec {
    /// Opaque puzzle id.
    pub id: String,
    /// Source image location; opaque to the sync core.
    pub image_url: String,
    /// Natural image width in pixels.
    pub image_width: u32,
    /// Natural image height in pixels.
    pub image_height: u32,
    /// Grid columns.
    pub cols: u32,
    /// Grid rows.
    pub rows: u32,
    /// Difficulty tier.
    pub difficulty: Difficulty,
}

impl PuzzleSpec {
    /// Total number of pieces in the grid.
    pub fn piece_count(&self) -> u32 {
        self.cols * self.rows
    }

    /// Width of one piece in workspace units.
    pub fn piece_width(&self) -> f64 {
        f64::from(self.image_width) / f64::from(self.cols)
    }

    /// Height of one piece in workspace units.
    pub fn piece_height(&self) -> f64 {
        f64::from(self.image_height) / f64::from(self.rows)
    }

    /// Grid coordinate of a piece id as `(col, row)`.
    pub fn grid_coord(&self, piece: PieceId) -> (u32, u32) {
        (piece % self.cols, piece / self.cols)
    }

    /// Target transform for a piece: the center of its grid cell, unrotated.
    pub fn target_transform(&self, piece: PieceId) -> Transform {
        let (col, row) = self.grid_coord(piece);
        Transform::at(
            (f64::from(col) + 0.5) * self.piece_width(),
            (f64::from(row) + 0.5) * self.piece_height(),
        )
    }

    /// Iterator over all piece ids in row-major order.
    pub fn piece_ids(&self) -> impl Iterator<Item = PieceId> {
        0..self.piece_count()
    }
}

/// One piece as stored in the shared store and mirrored in each local view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceRecord {
    /// Piece id (grid-derived).
    pub piece_id: PieceId,
    /// Correct final transform.
    pub target: Transform,
    /// Current transform (last-writer-wins while unlocked).
    pub current: Transform,
    /// Whether the piece has been snapped to its target this epoch.
    pub is_placed: bool,
    /// Participant whose drop placed the piece, set together with
    /// `is_placed`.
    pub placed_by: Option<ParticipantId>,
    /// Exclusive manipulation right holder, if any.
    pub lock_owner: Option<ParticipantId>,
    /// Unix-millisecond timestamp of the last lock-relevant write; used for
    /// idle-lock TTL eviction.
    pub lock_ms: u64,
    /// Per-piece monotonically increasing update sequence number.
    pub seq: u64,
    /// Play-through epoch this record belongs to; bumped on reset.
    pub epoch: u64,
}

impl PieceRecord {
    /// Fresh unplaced piece at `start`, belonging to `epoch`.
    pub fn scrambled(piece_id: PieceId, target: Transform, start: Transform, epoch: u64) -> Self {
        Self {
            piece_id,
            target,
            current: start,
            is_placed: false,
            placed_by: None,
            lock_owner: None,
            lock_ms: 0,
            seq: 0,
            epoch,
        }
    }
}

/// One participant as stored in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Participant id.
    pub participant_id: ParticipantId,
    /// Display name shown to other participants.
    pub display_name: String,
    /// Whether this participant is the session host. Exactly one per session.
    pub is_host: bool,
    /// Liveness flag maintained by presence sweeps and disconnect cleanup.
    pub online: bool,
    /// Unix-millisecond timestamp of the last heartbeat.
    pub last_heartbeat_ms: u64,
    /// Total drop attempts this epoch.
    pub moves: u32,
    /// Drops that resulted in a placement this epoch.
    pub accurate_drops: u32,
    /// Accumulated placement points this epoch.
    pub points: u64,
}

impl ParticipantRecord {
    /// Fresh online participant with zeroed counters.
    pub fn joined(
        participant_id: ParticipantId,
        display_name: impl Into<String>,
        is_host: bool,
        now_ms: u64,
    ) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            is_host,
            online: true,
            last_heartbeat_ms: now_ms,
            moves: 0,
            accurate_drops: 0,
            points: 0,
        }
    }

    /// Placement accuracy in percent (0–100). Zero when no moves were made.
    pub fn accuracy_percent(&self) -> f64 {
        if self.moves == 0 {
            0.0
        } else {
            f64::from(self.accurate_drops) * 100.0 / f64::from(self.moves)
        }
    }
}

/// Ephemeral cursor broadcast. Best-effort, never durable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Unix-millisecond timestamp of the broadcast.
    pub at_ms: u64,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Host is configuring; no piece interaction.
    Waiting,
    /// Pieces may be locked and moved.
    Playing,
    /// Temporarily frozen; no piece interaction.
    Paused,
    /// Terminal; reached exactly once from `Playing`.
    Completed,
}

/// Session metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub session_id: SessionId,
    /// Host participant id.
    pub host: ParticipantId,
    /// Lifecycle state.
    pub state: SessionState,
    /// Unix-millisecond creation timestamp.
    pub created_ms: u64,
    /// Unix-millisecond timestamp of the `Waiting → Playing` transition, if
    /// it has happened.
    pub started_ms: Option<u64>,
    /// Current play-through epoch; bumped on reset.
    pub epoch: u64,
    /// Completion record, present only in the `Completed` state.
    pub completion: Option<CompletionRecord>,
}

/// Finalized completion record, written exactly once per session by the
/// participant whose state transition wins the completion race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Session this record belongs to.
    pub session_id: SessionId,
    /// Participant that placed the final piece.
    pub participant_id: ParticipantId,
    /// Wall time from start to completion in milliseconds.
    pub completion_time_ms: u64,
    /// Total drop attempts by the finishing participant.
    pub move_count: u32,
    /// Placement accuracy of the finishing participant in percent.
    pub accuracy: f64,
    /// Final points of the finishing participant, bonuses included.
    pub points: u64,
}

/// Global progress counter, incremented once per placed piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Pieces placed so far this epoch.
    pub completed_count: u32,
    /// Total pieces in the puzzle.
    pub total: u32,
    /// Epoch this counter belongs to.
    pub epoch: u64,
}

impl ProgressRecord {
    /// Progress as a percentage in 0–100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.completed_count) * 100.0 / f64::from(self.total)
        }
    }

    /// True when every piece is placed.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed_count >= self.total
    }
}

/// A store value plus the version counter the substrate assigned to it.
///
/// Versions increase by one on every successful write to a path and back the
/// compare-and-swap primitive used for lock arbitration and the completion
/// transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    /// The JSON value currently stored at the path.
    pub value: serde_json::Value,
    /// Monotonic per-path version counter.
    pub version: u64,
}

/// Server-side cleanup action registered against a connection, applied by
/// the substrate when that connection drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op", content = "value")]
pub enum DisconnectAction {
    /// Overwrite the path with the given value.
    Set(serde_json::Value),
    /// Shallow-merge the given fields into the object at the path.
    Merge(serde_json::Map<String, serde_json::Value>),
    /// Remove the path.
    Remove,
}

/// Store path helpers for the per-session tree.
///
/// Layout under `sessions/<sid>`:
/// `meta`, `puzzle`, `progress`, `pieces/<pid>`, `participants/<uid>`,
/// `cursors/<uid>`.
pub mod paths {
    use super::{ParticipantId, PieceId, SessionId};

    /// Root of a session subtree.
    pub fn session(sid: &SessionId) -> String {
        format!("sessions/{sid}")
    }

    /// Session metadata (state machine, host, completion record).
    pub fn meta(sid: &SessionId) -> String {
        format!("sessions/{sid}/meta")
    }

    /// Immutable puzzle description.
    pub fn puzzle(sid: &SessionId) -> String {
        format!("sessions/{sid}/puzzle")
    }

    /// Global progress counter.
    pub fn progress(sid: &SessionId) -> String {
        format!("sessions/{sid}/progress")
    }

    /// Subtree holding every piece record.
    pub fn pieces(sid: &SessionId) -> String {
        format!("sessions/{sid}/pieces")
    }

    /// One piece record.
    pub fn piece(sid: &SessionId, piece: PieceId) -> String {
        format!("sessions/{sid}/pieces/{piece}")
    }

    /// Subtree holding every participant record.
    pub fn participants(sid: &SessionId) -> String {
        format!("sessions/{sid}/participants")
    }

    /// One participant record.
    pub fn participant(sid: &SessionId, uid: &ParticipantId) -> String {
        format!("sessions/{sid}/participants/{uid}")
    }

    /// One participant's ephemeral cursor slot.
    pub fn cursor(sid: &SessionId, uid: &ParticipantId) -> String {
        format!("sessions/{sid}/cursors/{uid}")
    }
}
