// SPDX-License-Identifier: Apache-2.0
//! Placement aggregation, scoring, and the exactly-once completion race.
//!
//! Each placement bumps a shared counter with a transactional increment
//! (cheaper than a recount on every drop); a periodic [`reconcile`] pass
//! recounts from the authoritative piece scan and repairs any missed-event
//! drift. When the counter reaches the total, every observer races a
//! `Playing → Completed` CAS on the session record; only the winner writes
//! the completion record, so the terminal event fires exactly once no
//! matter how many clients see the threshold crossing.
//!
//! [`reconcile`]: ProgressCoordinator::reconcile

use crate::{from_json, to_json, SyncConfig, SyncError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tessel_proto::{
    paths, CompletionRecord, ParticipantRecord, PieceId, PieceRecord, ProgressRecord, SessionId,
    SessionRecord, SessionState,
};
use tessel_store::{transactional_update, SharedStore, TxnResult};
use tracing::{debug, warn};

/// Points for any correct placement.
pub const BASE_PLACEMENT_POINTS: u64 = 100;
/// Extra points when the drag that placed the piece took under the speed
/// window (5 s by default).
pub const SPEED_BONUS_POINTS: u64 = 25;
/// Extra points per combo step for placements chained within the combo
/// window.
pub const COMBO_BONUS_POINTS: u64 = 10;

/// Points for one placement:
/// `base + speedBonus(move < window) + comboBonus * comboCount`.
pub fn placement_points(move_duration_ms: u64, combo_count: u32, cfg: &SyncConfig) -> u64 {
    let speed = if move_duration_ms < cfg.speed_bonus_window_ms {
        SPEED_BONUS_POINTS
    } else {
        0
    };
    BASE_PLACEMENT_POINTS + speed + COMBO_BONUS_POINTS * u64::from(combo_count)
}

/// Completion-time bonus: `max(0, 1000 - floor(seconds)) * 2`.
pub fn time_bonus(completion_time_ms: u64) -> u64 {
    let secs = completion_time_ms / 1_000;
    1_000u64.saturating_sub(secs) * 2
}

/// Accuracy bonus: `floor(accuracy%) * 10`.
pub fn accuracy_bonus(accuracy_percent: f64) -> u64 {
    (accuracy_percent.clamp(0.0, 100.0).floor() as u64) * 10
}

/// Aggregates placements into global progress and arbitrates completion.
pub struct ProgressCoordinator {
    store: Arc<dyn SharedStore>,
    session: SessionId,
    cfg: SyncConfig,
    // Placements already counted by this process, keyed by epoch so a reset
    // reopens every piece.
    seen: Mutex<HashSet<(u64, PieceId)>>,
}

impl ProgressCoordinator {
    /// New coordinator for one session.
    pub fn new(store: Arc<dyn SharedStore>, session: SessionId, cfg: SyncConfig) -> Self {
        Self {
            store,
            session,
            cfg,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Count one placed piece toward global progress.
    ///
    /// Idempotent per `(epoch, piece)`: replaying the same placement event
    /// returns `Ok(None)` without touching the counter. Returns the updated
    /// progress record when the increment landed.
    pub async fn record_placed(
        &self,
        piece: PieceId,
        epoch: u64,
    ) -> Result<Option<ProgressRecord>, SyncError> {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert((epoch, piece)) {
                return Ok(None);
            }
        }

        let path = paths::progress(&self.session);
        let mut updated = None;
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            |current| {
                let mut rec: ProgressRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.epoch != epoch {
                    return None;
                }
                rec.completed_count = (rec.completed_count + 1).min(rec.total);
                updated = Some(rec);
                to_json(&rec)
            },
        )
        .await?;

        match result {
            TxnResult::Applied { .. } => Ok(updated),
            TxnResult::Aborted => Ok(None),
        }
    }

    /// Race the `Playing → Completed` transition.
    ///
    /// Returns the completion record when this caller won (and therefore
    /// wrote it); `None` when another participant got there first or the
    /// session was not in `Playing`.
    pub async fn complete_if_won(
        &self,
        stats: &ParticipantRecord,
        now_ms: u64,
    ) -> Result<Option<CompletionRecord>, SyncError> {
        let path = paths::meta(&self.session);
        let session = self.session.clone();
        let mut written = None;
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            |current| {
                let mut meta: SessionRecord = serde_json::from_value(current?.clone()).ok()?;
                if meta.state != SessionState::Playing {
                    return None;
                }
                let started = meta.started_ms.unwrap_or(meta.created_ms);
                let completion_time_ms = now_ms.saturating_sub(started);
                let accuracy = stats.accuracy_percent();
                let record = CompletionRecord {
                    session_id: session.clone(),
                    participant_id: stats.participant_id.clone(),
                    completion_time_ms,
                    move_count: stats.moves,
                    accuracy,
                    points: stats.points
                        + time_bonus(completion_time_ms)
                        + accuracy_bonus(accuracy),
                };
                meta.state = SessionState::Completed;
                meta.completion = Some(record.clone());
                written = Some(record);
                to_json(&meta)
            },
        )
        .await?;

        match result {
            TxnResult::Applied { .. } => {
                debug!(session = %self.session, "completion transition won");
                Ok(written)
            }
            TxnResult::Aborted => Ok(None),
        }
    }

    /// Recount placed pieces from an authoritative scan and repair the
    /// counter if it drifted (missed events, lost increments).
    pub async fn reconcile(&self) -> Result<ProgressRecord, SyncError> {
        let pieces_prefix = paths::pieces(&self.session);
        let progress_path = paths::progress(&self.session);

        let current = self
            .store
            .read(&progress_path)
            .await?
            .ok_or_else(|| SyncError::UnknownSession(self.session.to_string()))?;
        let progress: ProgressRecord = from_json(&progress_path, &current.value)?;

        let mut counted = 0u32;
        for (path, versioned) in self.store.read_tree(&pieces_prefix).await? {
            let rec: PieceRecord = from_json(&path, &versioned.value)?;
            if rec.is_placed && rec.epoch == progress.epoch {
                counted += 1;
            }
        }

        if counted == progress.completed_count {
            return Ok(progress);
        }
        warn!(
            session = %self.session,
            counter = progress.completed_count,
            scanned = counted,
            "progress counter drifted; repairing"
        );

        let epoch = progress.epoch;
        let mut repaired = progress;
        let result = transactional_update(
            self.store.as_ref(),
            &progress_path,
            self.cfg.txn_attempts,
            |current| {
                let mut rec: ProgressRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.epoch != epoch || rec.completed_count == counted {
                    return None;
                }
                rec.completed_count = counted.min(rec.total);
                repaired = rec;
                to_json(&rec)
            },
        )
        .await?;
        let _ = result;
        Ok(repaired)
    }
}
