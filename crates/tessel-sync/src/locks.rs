// SPDX-License-Identifier: Apache-2.0
//! Per-piece exclusive lock arbitration.
//!
//! A lock is a compare-and-set against the piece record's `lock_owner`
//! field: acquisition succeeds only when the field is empty, already ours,
//! or held by someone whose lock has gone stale (no position update within
//! the TTL). Contention beyond the retry budget surfaces as
//! [`LockOutcome::Busy`], which callers treat as a non-fatal denial.

use crate::{from_json, to_json, SyncConfig, SyncError};
use std::sync::Arc;
use tessel_proto::{paths, ParticipantId, PieceId, PieceRecord, SessionId};
use tessel_store::{transactional_update, SharedStore, StoreError, TxnResult};
use tracing::debug;

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Exclusive manipulation rights granted.
    Granted,
    /// Someone else holds a live lock (or the piece is already placed).
    Denied,
    /// The store was too contended to decide within the retry budget.
    Busy,
}

/// Result of a lock release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock was ours and is now clear.
    Released,
    /// The lock was not held by the caller; nothing changed.
    NotOwner,
    /// The store was too contended to decide within the retry budget.
    Busy,
}

/// Arbitrates exclusive manipulation rights over individual pieces.
pub struct LockManager {
    store: Arc<dyn SharedStore>,
    session: SessionId,
    cfg: SyncConfig,
}

impl LockManager {
    /// New manager for one session.
    pub fn new(store: Arc<dyn SharedStore>, session: SessionId, cfg: SyncConfig) -> Self {
        Self {
            store,
            session,
            cfg,
        }
    }

    /// Try to take the lock on `piece` for `me`.
    ///
    /// Grants when the lock is vacant, re-grants to the current owner, and
    /// steals locks idle past the TTL. Placed pieces are never grantable.
    pub async fn acquire(
        &self,
        piece: PieceId,
        me: &ParticipantId,
        now_ms: u64,
    ) -> Result<LockOutcome, SyncError> {
        let path = paths::piece(&self.session, piece);
        let ttl = self.cfg.lock_ttl_ms;
        let owner = me.clone();
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            move |current| {
                let mut rec: PieceRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.is_placed {
                    return None;
                }
                match &rec.lock_owner {
                    None => {}
                    Some(holder) if *holder == owner => {}
                    // Stale locks are force-releasable by any observer;
                    // disconnect cleanup alone is not prompt enough under
                    // partition.
                    Some(_) if now_ms.saturating_sub(rec.lock_ms) > ttl => {}
                    Some(_) => return None,
                }
                rec.lock_owner = Some(owner.clone());
                rec.lock_ms = now_ms;
                rec.seq += 1;
                to_json(&rec)
            },
        )
        .await;

        match result {
            Ok(TxnResult::Applied { .. }) => Ok(LockOutcome::Granted),
            Ok(TxnResult::Aborted) => Ok(LockOutcome::Denied),
            Err(StoreError::Busy { .. }) => {
                debug!(piece, "lock acquisition busy");
                Ok(LockOutcome::Busy)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock on `piece` if `me` holds it.
    pub async fn release(
        &self,
        piece: PieceId,
        me: &ParticipantId,
        now_ms: u64,
    ) -> Result<ReleaseOutcome, SyncError> {
        let path = paths::piece(&self.session, piece);
        let owner = me.clone();
        let result = transactional_update(
            self.store.as_ref(),
            &path,
            self.cfg.txn_attempts,
            move |current| {
                let mut rec: PieceRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.lock_owner.as_ref() != Some(&owner) {
                    return None;
                }
                rec.lock_owner = None;
                rec.lock_ms = now_ms;
                rec.seq += 1;
                to_json(&rec)
            },
        )
        .await;

        match result {
            Ok(TxnResult::Applied { .. }) => Ok(ReleaseOutcome::Released),
            Ok(TxnResult::Aborted) => Ok(ReleaseOutcome::NotOwner),
            Err(StoreError::Busy { .. }) => Ok(ReleaseOutcome::Busy),
            Err(e) => Err(e.into()),
        }
    }

    /// Release every lock held by `owner` (participant loss path).
    pub async fn release_all_for(
        &self,
        owner: &ParticipantId,
        now_ms: u64,
    ) -> Result<Vec<PieceId>, SyncError> {
        let mut released = Vec::new();
        for (path, rec) in self.scan_pieces().await? {
            if rec.lock_owner.as_ref() == Some(owner) {
                if self.clear_lock(&path, &rec, now_ms).await? {
                    released.push(rec.piece_id);
                }
            }
        }
        Ok(released)
    }

    /// Force-release every lock idle past the TTL, regardless of owner.
    pub async fn evict_stale(&self, now_ms: u64) -> Result<Vec<PieceId>, SyncError> {
        let ttl = self.cfg.lock_ttl_ms;
        let mut evicted = Vec::new();
        for (path, rec) in self.scan_pieces().await? {
            if rec.lock_owner.is_some() && now_ms.saturating_sub(rec.lock_ms) > ttl {
                if self.clear_lock(&path, &rec, now_ms).await? {
                    evicted.push(rec.piece_id);
                }
            }
        }
        Ok(evicted)
    }

    async fn scan_pieces(&self) -> Result<Vec<(String, PieceRecord)>, SyncError> {
        let prefix = paths::pieces(&self.session);
        let mut out = Vec::new();
        for (path, versioned) in self.store.read_tree(&prefix).await? {
            let rec: PieceRecord = from_json(&path, &versioned.value)?;
            out.push((path, rec));
        }
        Ok(out)
    }

    /// Clear the lock at `path` if it is still held by the owner seen in
    /// `observed`. Returns whether anything was released.
    async fn clear_lock(
        &self,
        path: &str,
        observed: &PieceRecord,
        now_ms: u64,
    ) -> Result<bool, SyncError> {
        let expected_owner = observed.lock_owner.clone();
        let result = transactional_update(
            self.store.as_ref(),
            path,
            self.cfg.txn_attempts,
            move |current| {
                let mut rec: PieceRecord = serde_json::from_value(current?.clone()).ok()?;
                if rec.lock_owner.is_none() || rec.lock_owner != expected_owner {
                    return None;
                }
                rec.lock_owner = None;
                rec.lock_ms = now_ms;
                rec.seq += 1;
                to_json(&rec)
            },
        )
        .await;

        match result {
            Ok(TxnResult::Applied { .. }) => Ok(true),
            Ok(TxnResult::Aborted) => Ok(false),
            Err(StoreError::Busy { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
