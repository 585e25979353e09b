// SPDX-License-Identifier: Apache-2.0
//! Piece position streaming and placement validation.
//!
//! While a participant holds a piece's lock, in-progress transforms are
//! streamed as plain last-writer-wins field merges tagged with a per-piece
//! monotonically increasing sequence number (receivers drop out-of-order
//! frames). Releasing the piece runs placement validation: close enough to
//! the target — strictly inside the difficulty's snap distance, rotation
//! aligned where required — and the piece snaps to its exact target and
//! becomes immutable for the rest of the epoch.

use crate::{to_json, SyncConfig, SyncError};
use std::sync::Arc;
use tessel_proto::{
    paths, Difficulty, ParticipantId, PieceId, PieceRecord, SessionId, Transform,
    ROTATION_EPSILON_DEG,
};
use tessel_store::{transactional_update, SharedStore, StoreError, TxnResult};

/// Result of dropping a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// The drop was within tolerance: the piece snapped to its target and is
    /// now placed.
    Placed,
    /// The drop missed: the piece stays where it was dropped, unlocked.
    Left,
    /// The caller no longer held the lock (evicted or stolen); no change.
    NotOwner,
    /// The store was too contended to decide within the retry budget.
    Busy,
}

/// Pure placement predicate: strict `<` on the snap distance, rotation
/// within [`ROTATION_EPSILON_DEG`] of a full turn when the difficulty
/// demands it.
pub fn placement_check(dropped: &Transform, target: &Transform, difficulty: Difficulty) -> bool {
    dropped.distance_to(target) < difficulty.snap_distance()
        && (!difficulty.rotation_required() || dropped.rotation_aligned(ROTATION_EPSILON_DEG))
}

/// Streams piece transforms and applies placement on release.
pub struct PieceSync {
    store: Arc<dyn SharedStore>,
    session: SessionId,
    cfg: SyncConfig,
}

impl PieceSync {
    /// New synchronizer for one session.
    pub fn new(store: Arc<dyn SharedStore>, session: SessionId, cfg: SyncConfig) -> Self {
        Self {
            store,
            session,
            cfg,
        }
    }

    /// Stream an in-progress transform for a locked piece.
    ///
    /// Fire-and-forget, last-writer-wins: no CAS, no retries. The write also
    /// refreshes `lock_ms` so an active drag never trips the idle-lock TTL.
    pub async fn stream_move(
        &self,
        piece: PieceId,
        pos: Transform,
        seq: u64,
        now_ms: u64,
    ) -> Result<(), SyncError> {
        let path = paths::piece(&self.session, piece);
        let mut fields = serde_json::Map::new();
        fields.insert(
            "current".into(),
            to_json(&pos).unwrap_or(serde_json::Value::Null),
        );
        fields.insert("seq".into(), serde_json::Value::from(seq));
        fields.insert("lock_ms".into(), serde_json::Value::from(now_ms));
        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Drop the piece at `dropped_at` and release the lock.
    ///
    /// Placement, snap, lock release, and the `is_placed` flip happen in one
    /// transactional update so a concurrent eviction or duplicate release
    /// can never double-place a piece.
    pub async fn release(
        &self,
        piece: PieceId,
        me: &ParticipantId,
        dropped_at: Transform,
        difficulty: Difficulty,
        now_ms: u64,
    ) -> Result<DropOutcome, SyncError> {
        let path = paths::piece(&self.session, piece);
        let owner = me.clone();
        let mut placed = false;
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            |current| {
                let mut rec: PieceRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.lock_owner.as_ref() != Some(&owner) {
                    return None;
                }
                placed = !rec.is_placed && placement_check(&dropped_at, &rec.target, difficulty);
                if placed {
                    rec.current = rec.target;
                    rec.is_placed = true;
                    rec.placed_by = Some(owner.clone());
                } else {
                    rec.current = dropped_at;
                }
                rec.lock_owner = None;
                rec.lock_ms = now_ms;
                rec.seq += 1;
                to_json(&rec)
            },
        )
        .await;

        match result {
            Ok(TxnResult::Applied { .. }) => Ok(if placed {
                DropOutcome::Placed
            } else {
                DropOutcome::Left
            }),
            Ok(TxnResult::Aborted) => Ok(DropOutcome::NotOwner),
            Err(StoreError::Busy { .. }) => Ok(DropOutcome::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{LockManager, LockOutcome};
    use tessel_store::MemoryStore;

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    async fn seed_piece(store: &MemoryStore, piece: PieceId, target: Transform) {
        let rec = PieceRecord::scrambled(piece, target, Transform::at(500.0, 500.0), 1);
        store
            .client()
            .write(
                &paths::piece(&sid(), piece),
                serde_json::to_value(&rec).unwrap(),
            )
            .await
            .unwrap();
    }

    async fn read_piece(store: &MemoryStore, piece: PieceId) -> PieceRecord {
        let v = store
            .client()
            .read(&paths::piece(&sid(), piece))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_value(v.value).unwrap()
    }

    fn rig(store: &MemoryStore) -> (LockManager, PieceSync) {
        let cfg = SyncConfig::default();
        (
            LockManager::new(Arc::new(store.client()), sid(), cfg.clone()),
            PieceSync::new(Arc::new(store.client()), sid(), cfg),
        )
    }

    #[test]
    fn snap_threshold_is_strictly_exclusive() {
        let target = Transform::at(100.0, 100.0);
        let snap = Difficulty::Easy.snap_distance();

        // Exactly at the threshold: not placed.
        let at = Transform::at(100.0 + snap, 100.0);
        assert!(!placement_check(&at, &target, Difficulty::Easy));

        // Epsilon inside: placed.
        let inside = Transform::at(100.0 + snap - 1e-6, 100.0);
        assert!(placement_check(&inside, &target, Difficulty::Easy));
    }

    #[test]
    fn rotation_gate_applies_only_where_required() {
        let target = Transform::at(0.0, 0.0);
        let mut dropped = Transform::at(1.0, 1.0);
        dropped.rot_deg = 90.0;

        assert!(placement_check(&dropped, &target, Difficulty::Easy));
        assert!(!placement_check(&dropped, &target, Difficulty::Expert));

        dropped.rot_deg = 356.0; // within 5° of a full turn
        assert!(placement_check(&dropped, &target, Difficulty::Expert));
    }

    #[tokio::test]
    async fn successful_release_snaps_to_exact_target_and_unlocks() {
        let store = MemoryStore::new();
        let target = Transform::at(100.0, 100.0);
        seed_piece(&store, 0, target).await;
        let (locks, pieces) = rig(&store);
        let ada = ParticipantId::new("ada");

        assert_eq!(locks.acquire(0, &ada, 0).await.unwrap(), LockOutcome::Granted);
        let near = Transform::at(110.0, 95.0);
        let outcome = pieces
            .release(0, &ada, near, Difficulty::Easy, 100)
            .await
            .unwrap();
        assert_eq!(outcome, DropOutcome::Placed);

        let rec = read_piece(&store, 0).await;
        assert!(rec.is_placed);
        assert_eq!(rec.current, target);
        assert_eq!(rec.placed_by, Some(ada));
        assert!(rec.lock_owner.is_none());
    }

    #[tokio::test]
    async fn missed_release_leaves_piece_where_dropped() {
        let store = MemoryStore::new();
        seed_piece(&store, 0, Transform::at(100.0, 100.0)).await;
        let (locks, pieces) = rig(&store);
        let ada = ParticipantId::new("ada");

        locks.acquire(0, &ada, 0).await.unwrap();
        let far = Transform::at(300.0, 300.0);
        let outcome = pieces
            .release(0, &ada, far, Difficulty::Easy, 100)
            .await
            .unwrap();
        assert_eq!(outcome, DropOutcome::Left);

        let rec = read_piece(&store, 0).await;
        assert!(!rec.is_placed);
        assert_eq!(rec.current, far);
        assert!(rec.lock_owner.is_none());
    }

    #[tokio::test]
    async fn release_without_lock_is_a_noop() {
        let store = MemoryStore::new();
        seed_piece(&store, 0, Transform::at(100.0, 100.0)).await;
        let (_, pieces) = rig(&store);
        let ada = ParticipantId::new("ada");

        let outcome = pieces
            .release(0, &ada, Transform::at(100.0, 100.0), Difficulty::Easy, 0)
            .await
            .unwrap();
        assert_eq!(outcome, DropOutcome::NotOwner);
        assert!(!read_piece(&store, 0).await.is_placed);
    }

    #[tokio::test]
    async fn placed_piece_cannot_be_placed_again_or_relocked() {
        let store = MemoryStore::new();
        let target = Transform::at(100.0, 100.0);
        seed_piece(&store, 0, target).await;
        let (locks, pieces) = rig(&store);
        let ada = ParticipantId::new("ada");

        locks.acquire(0, &ada, 0).await.unwrap();
        pieces
            .release(0, &ada, target, Difficulty::Easy, 10)
            .await
            .unwrap();
        assert_eq!(locks.acquire(0, &ada, 20).await.unwrap(), LockOutcome::Denied);
    }

    #[tokio::test]
    async fn stream_move_updates_transform_seq_and_lock_freshness() {
        let store = MemoryStore::new();
        seed_piece(&store, 0, Transform::at(100.0, 100.0)).await;
        let (locks, pieces) = rig(&store);
        let ada = ParticipantId::new("ada");

        locks.acquire(0, &ada, 0).await.unwrap();
        let before = read_piece(&store, 0).await;
        pieces
            .stream_move(0, Transform::at(220.0, 40.0), before.seq + 1, 4_000)
            .await
            .unwrap();

        let rec = read_piece(&store, 0).await;
        assert_eq!(rec.current, Transform::at(220.0, 40.0));
        assert_eq!(rec.seq, before.seq + 1);
        assert_eq!(rec.lock_ms, 4_000);
        assert_eq!(rec.lock_owner, Some(ada));
    }
}
