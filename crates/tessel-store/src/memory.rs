// SPDX-License-Identifier: Apache-2.0
//! In-process shared store substrate.
//!
//! One [`MemoryStore`] plays the role of the external synchronization
//! service; each simulated participant takes its own [`MemoryClient`]
//! handle. Handles share the node tree but carry independent connection
//! identity, so disconnect cleanup and subscription teardown behave like
//! separate processes dropping off the network.

use crate::{CasOutcome, SharedStore, StoreError, StoreEvent, Subscription};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tessel_proto::{DisconnectAction, Versioned};
use tokio::sync::{mpsc, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    version: u64,
}

struct Watcher {
    owner: u64,
    prefix: String,
    tx: mpsc::Sender<StoreEvent>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Slot>,
    watchers: Vec<Watcher>,
    cleanups: HashMap<u64, Vec<(String, DisconnectAction)>>,
    disconnected: HashSet<u64>,
    unavailable: bool,
    next_version: u64,
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

impl Inner {
    fn alloc_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    async fn notify(&mut self, event: StoreEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if prefix_matches(&watcher.prefix, &event.path) {
                let _ = watcher.tx.send(event.clone()).await;
            }
        }
    }

    async fn set(&mut self, path: &str, value: Value) -> u64 {
        let version = self.alloc_version();
        self.nodes.insert(
            path.to_string(),
            Slot {
                value: value.clone(),
                version,
            },
        );
        self.notify(StoreEvent {
            path: path.to_string(),
            value: Some(value),
            version,
        })
        .await;
        version
    }

    async fn remove_subtree(&mut self, path: &str) {
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| prefix_matches(path, k))
            .cloned()
            .collect();
        for key in doomed {
            self.nodes.remove(&key);
            self.notify(StoreEvent {
                path: key,
                value: None,
                version: 0,
            })
            .await;
        }
    }

    async fn merge(
        &mut self,
        path: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let mut object = match self.nodes.get(path).map(|s| &s.value) {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(StoreError::NotAnObject(path.to_string())),
        };
        for (key, value) in fields {
            // A null field removes the key, mirroring the vendor substrate.
            if value.is_null() {
                object.remove(&key);
            } else {
                object.insert(key, value);
            }
        }
        Ok(self.set(path, Value::Object(object)).await)
    }

    async fn apply_cleanup(&mut self, path: &str, action: DisconnectAction) {
        match action {
            DisconnectAction::Set(Value::Null) | DisconnectAction::Remove => {
                self.remove_subtree(path).await;
            }
            DisconnectAction::Set(value) => {
                self.set(path, value).await;
            }
            DisconnectAction::Merge(fields) => {
                // Merge failures against non-objects are swallowed: cleanup
                // runs with no caller left to report to.
                if let Err(err) = self.merge(path, fields).await {
                    tracing::warn!(%err, path, "disconnect cleanup merge skipped");
                }
            }
        }
    }
}

/// In-memory shared store. Cheap to clone handles off of; the node tree
/// lives behind one async mutex, which also serializes CAS decisions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_client: Arc<std::sync::atomic::AtomicU64>,
}

impl MemoryStore {
    /// Fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client handle with its own connection identity.
    pub fn client(&self) -> MemoryClient {
        let id = self
            .next_client
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        MemoryClient {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Simulate the substrate dropping off the network. While unavailable,
    /// every client operation fails with [`StoreError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Snapshot of every stored path, for debugging and authoritative scans
    /// in tests.
    pub async fn dump(&self) -> Vec<(String, Versioned)> {
        let inner = self.inner.lock().await;
        inner
            .nodes
            .iter()
            .map(|(k, s)| {
                (
                    k.clone(),
                    Versioned {
                        value: s.value.clone(),
                        version: s.version,
                    },
                )
            })
            .collect()
    }
}

/// One connection's handle onto a [`MemoryStore`]. Clones share identity.
#[derive(Clone)]
pub struct MemoryClient {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryClient {
    async fn guard(&self) -> Result<tokio::sync::MutexGuard<'_, Inner>, StoreError> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        if inner.disconnected.contains(&self.id) {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }
}

#[async_trait]
impl SharedStore for MemoryClient {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.guard().await?;
        if value.is_null() {
            inner.remove_subtree(path).await;
        } else {
            inner.set(path, value).await;
        }
        Ok(())
    }

    async fn update(
        &self,
        path: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard().await?;
        inner.merge(path, fields).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Versioned>, StoreError> {
        let inner = self.guard().await?;
        Ok(inner.nodes.get(path).map(|s| Versioned {
            value: s.value.clone(),
            version: s.version,
        }))
    }

    async fn read_tree(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let inner = self.guard().await?;
        Ok(inner
            .nodes
            .iter()
            .filter(|(k, _)| prefix_matches(prefix, k))
            .map(|(k, s)| {
                (
                    k.clone(),
                    Versioned {
                        value: s.value.clone(),
                        version: s.version,
                    },
                )
            })
            .collect())
    }

    async fn write_if_version(
        &self,
        path: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.guard().await?;
        let current = inner.nodes.get(path).map(|s| s.version);
        if current != expected {
            return Ok(CasOutcome {
                applied: false,
                version: current.unwrap_or(0),
            });
        }
        if value.is_null() {
            inner.remove_subtree(path).await;
            return Ok(CasOutcome {
                applied: true,
                version: 0,
            });
        }
        let version = inner.set(path, value).await;
        Ok(CasOutcome {
            applied: true,
            version,
        })
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let mut inner = self.guard().await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Replay the current subtree so late joiners converge immediately.
        let replay: Vec<StoreEvent> = inner
            .nodes
            .iter()
            .filter(|(k, _)| prefix_matches(path, k))
            .map(|(k, s)| StoreEvent {
                path: k.clone(),
                value: Some(s.value.clone()),
                version: s.version,
            })
            .collect();
        for event in replay {
            let _ = tx.send(event).await;
        }

        inner.watchers.push(Watcher {
            owner: self.id,
            prefix: path.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn on_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard().await?;
        inner
            .cleanups
            .entry(self.id)
            .or_default()
            .push((path.to_string(), action));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.disconnected.insert(self.id) {
            return Ok(());
        }
        inner.watchers.retain(|w| w.owner != self.id);
        let actions = inner.cleanups.remove(&self.id).unwrap_or_default();
        for (path, action) in actions {
            inner.apply_cleanup(&path, action).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn next_event(sub: &mut Subscription) -> StoreEvent {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event within deadline")
            .expect("subscription alive")
    }

    #[tokio::test]
    async fn cas_grants_exactly_one_of_two_racers() {
        let store = MemoryStore::new();
        let a = store.client();
        let b = store.client();

        let (ra, rb) = tokio::join!(
            a.write_if_version("lock", None, json!({"owner": "a"})),
            b.write_if_version("lock", None, json!({"owner": "b"})),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(
            ra.applied ^ rb.applied,
            "exactly one CAS may win: {ra:?} vs {rb:?}"
        );
    }

    #[tokio::test]
    async fn subscribe_replays_subtree_then_streams_changes() {
        let store = MemoryStore::new();
        let writer = store.client();
        writer.write("s/pieces/0", json!({"seq": 1})).await.unwrap();

        let reader = store.client();
        let mut sub = reader.subscribe("s/pieces").await.unwrap();
        let replayed = next_event(&mut sub).await;
        assert_eq!(replayed.path, "s/pieces/0");

        writer.write("s/pieces/1", json!({"seq": 1})).await.unwrap();
        writer.write("s/meta", json!({"state": "playing"})).await.unwrap();
        let streamed = next_event(&mut sub).await;
        assert_eq!(streamed.path, "s/pieces/1");
        // The meta write is outside the prefix and must not arrive.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn null_write_removes_whole_subtree() {
        let store = MemoryStore::new();
        let c = store.client();
        c.write("s/pieces/0", json!(1)).await.unwrap();
        c.write("s/pieces/1", json!(2)).await.unwrap();
        c.write("s/meta", json!(3)).await.unwrap();

        c.write("s/pieces", Value::Null).await.unwrap();
        assert!(c.read("s/pieces/0").await.unwrap().is_none());
        assert!(c.read("s/pieces/1").await.unwrap().is_none());
        assert!(c.read("s/meta").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_merges_and_null_fields_remove_keys() {
        let store = MemoryStore::new();
        let c = store.client();
        c.write("p", json!({"a": 1, "b": 2})).await.unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("b".into(), Value::Null);
        fields.insert("c".into(), json!(3));
        c.update("p", fields).await.unwrap();

        let read = c.read("p").await.unwrap().unwrap();
        assert_eq!(read.value, json!({"a": 1, "c": 3}));

        c.write("scalar", json!(7)).await.unwrap();
        let err = c.update("scalar", serde_json::Map::new()).await;
        assert!(matches!(err, Err(StoreError::NotAnObject(_))));
    }

    #[tokio::test]
    async fn disconnect_applies_registered_cleanup() {
        let store = MemoryStore::new();
        let observer = store.client();
        let mut sub = observer.subscribe("s").await.unwrap();

        let dropper = store.client();
        dropper
            .write("s/participants/u", json!({"online": true}))
            .await
            .unwrap();
        let mut offline = serde_json::Map::new();
        offline.insert("online".into(), json!(false));
        dropper
            .on_disconnect("s/participants/u", DisconnectAction::Merge(offline))
            .await
            .unwrap();
        dropper
            .on_disconnect("s/cursors/u", DisconnectAction::Remove)
            .await
            .unwrap();
        dropper.write("s/cursors/u", json!({"x": 1.0})).await.unwrap();

        dropper.disconnect().await.unwrap();
        assert!(matches!(
            dropper.read("s/meta").await,
            Err(StoreError::Closed)
        ));

        let participant = observer
            .read("s/participants/u")
            .await
            .unwrap()
            .expect("participant survives disconnect");
        assert_eq!(participant.value, json!({"online": false}));
        assert!(observer.read("s/cursors/u").await.unwrap().is_none());

        // Events were emitted for both cleanup mutations.
        let mut saw_offline = false;
        let mut saw_cursor_removal = false;
        while let Some(event) = sub.try_recv() {
            if event.path == "s/participants/u" && event.value == Some(json!({"online": false})) {
                saw_offline = true;
            }
            if event.path == "s/cursors/u" && event.value.is_none() {
                saw_cursor_removal = true;
            }
        }
        assert!(saw_offline && saw_cursor_removal);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_every_operation() {
        let store = MemoryStore::new();
        let c = store.client();
        store.set_unavailable(true).await;
        assert!(matches!(
            c.write("k", json!(1)).await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(c.read("k").await, Err(StoreError::Unavailable)));
        store.set_unavailable(false).await;
        c.write("k", json!(1)).await.unwrap();
    }
}
