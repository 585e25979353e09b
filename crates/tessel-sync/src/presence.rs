// SPDX-License-Identifier: Apache-2.0
//! Participant liveness: join/leave, heartbeats, offline sweeps.
//!
//! Liveness is inferred from heartbeat recency: a participant is online iff
//! `now - last_heartbeat < offline_threshold`. The substrate's disconnect
//! cleanup marks participants offline when sockets drop, but that signal is
//! not prompt under partition, so the heartbeat protocol is primary and the
//! disconnect hook is the backstop. Host loss never tears the session down;
//! ending a session takes an explicit host action.

use crate::{from_json, SyncConfig, SyncError};
use std::sync::Arc;
use tessel_proto::{
    paths, CursorPosition, DisconnectAction, ParticipantId, ParticipantRecord, SessionId,
};
use tessel_store::{SharedStore, StoreError};
use tracing::info;

/// Tracks participant liveness for one session.
pub struct PresenceManager {
    store: Arc<dyn SharedStore>,
    session: SessionId,
    cfg: SyncConfig,
}

impl PresenceManager {
    /// New manager for one session.
    pub fn new(store: Arc<dyn SharedStore>, session: SessionId, cfg: SyncConfig) -> Self {
        Self {
            store,
            session,
            cfg,
        }
    }

    /// Register `participant` as present and install disconnect cleanup:
    /// the online flag drops and the cursor slot is removed if this
    /// process's connection dies without an explicit leave.
    pub async fn join(&self, participant: &ParticipantRecord) -> Result<(), SyncError> {
        let path = paths::participant(&self.session, &participant.participant_id);
        let value = serde_json::to_value(participant).map_err(|e| SyncError::Codec {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.store.write(&path, value).await?;

        let mut offline = serde_json::Map::new();
        offline.insert("online".into(), serde_json::Value::Bool(false));
        self.store
            .on_disconnect(&path, DisconnectAction::Merge(offline))
            .await?;
        self.store
            .on_disconnect(
                &paths::cursor(&self.session, &participant.participant_id),
                DisconnectAction::Remove,
            )
            .await?;
        info!(session = %self.session, participant = %participant.participant_id, "joined");
        Ok(())
    }

    /// Record a heartbeat for `me`, reviving the online flag if a sweep had
    /// cleared it.
    pub async fn heartbeat(&self, me: &ParticipantId, now_ms: u64) -> Result<(), SyncError> {
        let path = paths::participant(&self.session, me);
        let mut fields = serde_json::Map::new();
        fields.insert("last_heartbeat_ms".into(), serde_json::Value::from(now_ms));
        fields.insert("online".into(), serde_json::Value::Bool(true));
        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Explicitly mark `me` offline (leaving the record in place for
    /// scores/rejoin).
    pub async fn leave(&self, me: &ParticipantId) -> Result<(), SyncError> {
        let path = paths::participant(&self.session, me);
        let mut fields = serde_json::Map::new();
        fields.insert("online".into(), serde_json::Value::Bool(false));
        self.store.update(&path, fields).await?;
        self.store
            .write(&paths::cursor(&self.session, me), serde_json::Value::Null)
            .await?;
        Ok(())
    }

    /// Whether a record counts as online at `now_ms`.
    pub fn is_online(&self, rec: &ParticipantRecord, now_ms: u64) -> bool {
        rec.online && now_ms.saturating_sub(rec.last_heartbeat_ms) < self.cfg.offline_threshold_ms
    }

    /// Read every participant record.
    pub async fn roster(&self) -> Result<Vec<ParticipantRecord>, SyncError> {
        let prefix = paths::participants(&self.session);
        let mut out = Vec::new();
        for (path, versioned) in self.store.read_tree(&prefix).await? {
            out.push(from_json(&path, &versioned.value)?);
        }
        Ok(out)
    }

    /// Flag every heartbeat-silent participant offline and return their
    /// ids so the caller can release the locks they were holding.
    pub async fn sweep_offline(&self, now_ms: u64) -> Result<Vec<ParticipantId>, SyncError> {
        let mut lost = Vec::new();
        for rec in self.roster().await? {
            if rec.online && !self.is_online(&rec, now_ms) {
                let path = paths::participant(&self.session, &rec.participant_id);
                let mut fields = serde_json::Map::new();
                fields.insert("online".into(), serde_json::Value::Bool(false));
                self.store.update(&path, fields).await?;
                info!(
                    session = %self.session,
                    participant = %rec.participant_id,
                    "went offline (heartbeat silence)"
                );
                lost.push(rec.participant_id);
            }
        }
        Ok(lost)
    }

    /// Best-effort cursor broadcast. Cosmetic: failures other than a dead
    /// substrate are swallowed, nothing is retried, and no ordering is
    /// guaranteed.
    pub async fn broadcast_cursor(
        &self,
        me: &ParticipantId,
        x: f64,
        y: f64,
        now_ms: u64,
    ) -> Result<(), SyncError> {
        let cursor = CursorPosition { x, y, at_ms: now_ms };
        let value = serde_json::to_value(cursor).unwrap_or(serde_json::Value::Null);
        match self.store.write(&paths::cursor(&self.session, me), value).await {
            Ok(()) | Err(StoreError::Busy { .. }) => Ok(()),
            Err(StoreError::Unavailable) => Err(StoreError::Unavailable.into()),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_store::MemoryStore;

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    fn presence(store: &MemoryStore) -> PresenceManager {
        PresenceManager::new(Arc::new(store.client()), sid(), SyncConfig::default())
    }

    fn ada(now_ms: u64) -> ParticipantRecord {
        ParticipantRecord::joined(ParticipantId::new("ada"), "Ada", true, now_ms)
    }

    #[tokio::test]
    async fn join_heartbeat_and_threshold() {
        let store = MemoryStore::new();
        let presence = presence(&store);
        let threshold = SyncConfig::default().offline_threshold_ms;

        presence.join(&ada(1_000)).await.unwrap();
        let rec = &presence.roster().await.unwrap()[0];
        assert!(presence.is_online(rec, 1_000 + threshold - 1));
        assert!(!presence.is_online(rec, 1_000 + threshold));

        presence
            .heartbeat(&ParticipantId::new("ada"), 20_000)
            .await
            .unwrap();
        let rec = &presence.roster().await.unwrap()[0];
        assert!(presence.is_online(rec, 20_000 + threshold - 1));
    }

    #[tokio::test]
    async fn sweep_flags_silent_participants_once() {
        let store = MemoryStore::new();
        let presence = presence(&store);
        presence.join(&ada(0)).await.unwrap();
        let mut ben = ParticipantRecord::joined(ParticipantId::new("ben"), "Ben", false, 0);
        ben.last_heartbeat_ms = 50_000;
        presence.join(&ben).await.unwrap();

        let lost = presence.sweep_offline(30_000).await.unwrap();
        assert_eq!(lost, vec![ParticipantId::new("ada")]);

        // Already-offline participants are not reported again.
        assert!(presence.sweep_offline(31_000).await.unwrap().is_empty());

        // A fresh heartbeat revives the record.
        presence
            .heartbeat(&ParticipantId::new("ada"), 40_000)
            .await
            .unwrap();
        let roster = presence.roster().await.unwrap();
        let rec = roster
            .iter()
            .find(|r| r.participant_id == ParticipantId::new("ada"))
            .unwrap();
        assert!(presence.is_online(rec, 41_000));
    }

    #[tokio::test]
    async fn disconnect_cleanup_marks_offline_and_drops_cursor() {
        let store = MemoryStore::new();
        let client = store.client();
        let presence =
            PresenceManager::new(Arc::new(client.clone()), sid(), SyncConfig::default());

        presence.join(&ada(0)).await.unwrap();
        presence
            .broadcast_cursor(&ParticipantId::new("ada"), 10.0, 20.0, 5)
            .await
            .unwrap();

        client.disconnect().await.unwrap();

        let observer = store.client();
        let rec = observer
            .read(&paths::participant(&sid(), &ParticipantId::new("ada")))
            .await
            .unwrap()
            .unwrap();
        let rec: ParticipantRecord = serde_json::from_value(rec.value).unwrap();
        assert!(!rec.online);
        assert!(observer
            .read(&paths::cursor(&sid(), &ParticipantId::new("ada")))
            .await
            .unwrap()
            .is_none());
    }
}
