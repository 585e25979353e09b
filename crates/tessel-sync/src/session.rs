// SPDX-License-Identifier: Apache-2.0
//! Session lifecycle: creation, the state machine, and host controls.
//!
//! `waiting → playing ⇄ paused`, with `completed` terminal and reachable
//! only from `playing` (and only via the completion race in
//! [`crate::progress`]). Lock acquisition — and therefore all piece
//! interaction — is rejected whenever the state is not `playing`. A reset
//! starts a new epoch: every piece is rescrambled and unplaced, and the old
//! epoch's placements can never resurrect.

use crate::{from_json, to_json, SyncConfig, SyncError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use tessel_proto::{
    paths, ParticipantId, PieceRecord, ProgressRecord, PuzzleSpec, SessionId, SessionRecord,
    SessionState, Transform,
};
use tessel_store::{transactional_update, SharedStore, TxnResult};
use tracing::info;

/// How far beyond the image footprint scrambled pieces may scatter.
const WORKSPACE_SPREAD: f64 = 1.5;

/// Legal state-machine edges. Completion is listed here but is only ever
/// driven by the progress coordinator's CAS, never by a host command.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    matches!(
        (from, to),
        (SessionState::Waiting, SessionState::Playing)
            | (SessionState::Playing, SessionState::Paused)
            | (SessionState::Paused, SessionState::Playing)
            | (SessionState::Playing, SessionState::Completed)
    )
}

/// Deterministic scatter of every piece over the workspace rectangle.
///
/// Rotation-required difficulties also randomize orientation in 90° steps
/// so a scrambled board never starts pre-aligned.
pub fn scramble_positions(puzzle: &PuzzleSpec, seed: u64) -> Vec<Transform> {
    let mut rng = StdRng::seed_from_u64(seed);
    let span_x = f64::from(puzzle.image_width) * WORKSPACE_SPREAD;
    let span_y = f64::from(puzzle.image_height) * WORKSPACE_SPREAD;
    puzzle
        .piece_ids()
        .map(|_| {
            let mut t = Transform::at(rng.gen::<f64>() * span_x, rng.gen::<f64>() * span_y);
            if puzzle.difficulty.rotation_required() {
                t.rot_deg = f64::from(rng.gen_range(0u32..4) * 90);
            }
            t
        })
        .collect()
}

/// Write the full session tree in `Waiting` state: metadata, the immutable
/// puzzle record, one scrambled piece per grid cell, and a zeroed progress
/// counter at epoch 1.
pub async fn create_session(
    store: &dyn SharedStore,
    session_id: &SessionId,
    host: &ParticipantId,
    puzzle: &PuzzleSpec,
    now_ms: u64,
    scramble_seed: u64,
) -> Result<(), SyncError> {
    let epoch = 1;
    let meta = SessionRecord {
        session_id: session_id.clone(),
        host: host.clone(),
        state: SessionState::Waiting,
        created_ms: now_ms,
        started_ms: None,
        epoch,
        completion: None,
    };
    write_record(store, &paths::meta(session_id), &meta).await?;
    write_record(store, &paths::puzzle(session_id), puzzle).await?;

    for (piece, start) in puzzle
        .piece_ids()
        .zip(scramble_positions(puzzle, scramble_seed))
    {
        let rec = PieceRecord::scrambled(piece, puzzle.target_transform(piece), start, epoch);
        write_record(store, &paths::piece(session_id, piece), &rec).await?;
    }

    let progress = ProgressRecord {
        completed_count: 0,
        total: puzzle.piece_count(),
        epoch,
    };
    write_record(store, &paths::progress(session_id), &progress).await?;
    info!(session = %session_id, pieces = puzzle.piece_count(), "session created");
    Ok(())
}

async fn write_record<T: serde::Serialize>(
    store: &dyn SharedStore,
    path: &str,
    record: &T,
) -> Result<(), SyncError> {
    let value = serde_json::to_value(record).map_err(|e| SyncError::Codec {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    store.write(path, value).await?;
    Ok(())
}

/// Host-gated session lifecycle commands.
pub struct SessionControl {
    store: Arc<dyn SharedStore>,
    session: SessionId,
    cfg: SyncConfig,
}

impl SessionControl {
    /// New control handle for one session.
    pub fn new(store: Arc<dyn SharedStore>, session: SessionId, cfg: SyncConfig) -> Self {
        Self {
            store,
            session,
            cfg,
        }
    }

    /// Read the current session record.
    pub async fn current(&self) -> Result<SessionRecord, SyncError> {
        let path = paths::meta(&self.session);
        let versioned = self
            .store
            .read(&path)
            .await?
            .ok_or_else(|| SyncError::UnknownSession(self.session.to_string()))?;
        from_json(&path, &versioned.value)
    }

    /// `Waiting → Playing`; stamps the start time the elapsed clock and the
    /// completion time bonus are measured from.
    pub async fn start(&self, me: &ParticipantId, now_ms: u64) -> Result<(), SyncError> {
        self.host_transition(me, SessionState::Playing, "start the session", move |meta| {
            meta.started_ms = Some(now_ms);
        })
        .await
    }

    /// `Playing → Paused`.
    pub async fn pause(&self, me: &ParticipantId) -> Result<(), SyncError> {
        self.host_transition(me, SessionState::Paused, "pause the session", |_| {})
            .await
    }

    /// `Paused → Playing`.
    pub async fn resume(&self, me: &ParticipantId) -> Result<(), SyncError> {
        self.host_transition(me, SessionState::Playing, "resume the session", |_| {})
            .await
    }

    /// Start a new epoch: bump the epoch counter, rescramble every piece,
    /// zero progress and per-participant score counters, and drop back into
    /// `Playing`. The only path by which `is_placed` ever reverts.
    pub async fn reset(
        &self,
        me: &ParticipantId,
        puzzle: &PuzzleSpec,
        now_ms: u64,
        scramble_seed: u64,
    ) -> Result<u64, SyncError> {
        let path = paths::meta(&self.session);
        let caller = me.clone();
        let mut denial = None;
        let mut new_epoch = 0;
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            |current| {
                let mut meta: SessionRecord = serde_json::from_value(current?.clone()).ok()?;
                if meta.host != caller {
                    denial = Some(SyncError::HostOnly("reset the session"));
                    return None;
                }
                if meta.state == SessionState::Waiting {
                    denial = Some(SyncError::InvalidTransition {
                        from: meta.state,
                        to: SessionState::Playing,
                    });
                    return None;
                }
                meta.epoch += 1;
                meta.state = SessionState::Playing;
                meta.started_ms = Some(now_ms);
                meta.completion = None;
                new_epoch = meta.epoch;
                to_json(&meta)
            },
        )
        .await?;
        if let TxnResult::Aborted = result {
            return Err(denial.unwrap_or_else(|| SyncError::UnknownSession(self.session.to_string())));
        }

        for (piece, start) in puzzle
            .piece_ids()
            .zip(scramble_positions(puzzle, scramble_seed))
        {
            let rec =
                PieceRecord::scrambled(piece, puzzle.target_transform(piece), start, new_epoch);
            write_record(self.store.as_ref(), &paths::piece(&self.session, piece), &rec).await?;
        }
        let progress = ProgressRecord {
            completed_count: 0,
            total: puzzle.piece_count(),
            epoch: new_epoch,
        };
        write_record(
            self.store.as_ref(),
            &paths::progress(&self.session),
            &progress,
        )
        .await?;

        // Score counters are per-epoch.
        let roster_prefix = paths::participants(&self.session);
        for (participant_path, _) in self.store.read_tree(&roster_prefix).await? {
            let mut fields = serde_json::Map::new();
            fields.insert("moves".into(), serde_json::Value::from(0u32));
            fields.insert("accurate_drops".into(), serde_json::Value::from(0u32));
            fields.insert("points".into(), serde_json::Value::from(0u64));
            self.store.update(&participant_path, fields).await?;
        }

        info!(session = %self.session, epoch = new_epoch, "session reset");
        Ok(new_epoch)
    }

    /// Explicit host teardown: removes the whole session subtree. The only
    /// way a session ends other than completion; host *disconnect* never
    /// does this.
    pub async fn end(&self, me: &ParticipantId) -> Result<(), SyncError> {
        let meta = self.current().await?;
        if meta.host != *me {
            return Err(SyncError::HostOnly("end the session"));
        }
        self.store
            .write(&paths::session(&self.session), serde_json::Value::Null)
            .await?;
        info!(session = %self.session, "session ended by host");
        Ok(())
    }

    async fn host_transition<F>(
        &self,
        me: &ParticipantId,
        to: SessionState,
        action: &'static str,
        mutate: F,
    ) -> Result<(), SyncError>
    where
        F: Fn(&mut SessionRecord),
    {
        let path = paths::meta(&self.session);
        let caller = me.clone();
        let mut denial = None;
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            |current| {
                let mut meta: SessionRecord = serde_json::from_value(current?.clone()).ok()?;
                if meta.host != caller {
                    denial = Some(SyncError::HostOnly(action));
                    return None;
                }
                if !can_transition(meta.state, to) {
                    denial = Some(SyncError::InvalidTransition {
                        from: meta.state,
                        to,
                    });
                    return None;
                }
                meta.state = to;
                mutate(&mut meta);
                to_json(&meta)
            },
        )
        .await?;
        match result {
            TxnResult::Applied { .. } => Ok(()),
            TxnResult::Aborted => Err(denial
                .unwrap_or_else(|| SyncError::UnknownSession(self.session.to_string()))),
        }
    }
}
