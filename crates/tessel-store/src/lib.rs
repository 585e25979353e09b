// SPDX-License-Identifier: Apache-2.0
//! Shared mutable store port for tessel.
//!
//! Every participant process coordinates exclusively through an
//! implementation of [`SharedStore`]: plain last-writer-wins writes, shallow
//! field merges, versioned reads, compare-and-swap, prefix subscriptions,
//! and server-side disconnect cleanup. [`MemoryStore`] is the in-process
//! substrate used by tests and hosted by the hub service;
//! `tessel-store-client` provides the socket-backed implementation.
//!
//! Atomic read-modify-write is deliberately *not* a primitive: it is built
//! on CAS by [`transactional_update`], a bounded-retry loop that surfaces
//! contention as a non-fatal [`StoreError::Busy`].

use async_trait::async_trait;
use serde_json::Value;
use tessel_proto::{DisconnectAction, Versioned};
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;

pub use memory::{MemoryClient, MemoryStore};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The substrate cannot be reached; callers should surface a
    /// reconnecting state and block piece interaction.
    #[error("store unreachable")]
    Unavailable,
    /// A transactional update exhausted its retry budget. Non-fatal; the
    /// caller keeps its optimistic local state.
    #[error("transaction busy at {path}")]
    Busy {
        /// Contended path.
        path: String,
    },
    /// A field merge was attempted against a non-object value.
    #[error("not an object at {0}")]
    NotAnObject(String),
    /// The connection backing this handle is gone.
    #[error("connection closed")]
    Closed,
    /// Transport failure (socket-backed stores).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing/decoding failure (socket-backed stores).
    #[error("wire error: {0}")]
    Wire(#[from] tessel_proto::wire::WireError),
    /// The remote substrate rejected a request.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Change notification delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// Path that changed.
    pub path: String,
    /// New value, or `None` when the path was removed.
    pub value: Option<Value>,
    /// Version after the change (0 for removals).
    pub version: u64,
}

/// Receiving half of a store subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<StoreEvent>,
}

impl Subscription {
    /// Wrap a raw event channel.
    pub fn new(rx: mpsc::Receiver<StoreEvent>) -> Self {
        Self { rx }
    }

    /// Await the next change. Returns `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a pending change.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }
}

/// Outcome of a compare-and-swap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    /// Whether the swap was applied.
    pub applied: bool,
    /// Version now stored at the path (the conflicting writer's version when
    /// `applied` is false).
    pub version: u64,
}

/// The shared mutable store consumed by the synchronization core.
///
/// Path semantics: paths are slash-segmented strings addressing whole
/// records (`sessions/s1/pieces/3`). Writing [`Value::Null`] removes the
/// path and everything below it. Subscriptions match a prefix: subscribing
/// to `sessions/s1/pieces` observes every piece record.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Overwrite the value at `path`. Fire-and-forget, last-writer-wins.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow-merge `fields` into the object at `path`, creating it when
    /// absent.
    async fn update(
        &self,
        path: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Read the value and version at `path`.
    async fn read(&self, path: &str) -> Result<Option<Versioned>, StoreError>;

    /// Read every record at or below `prefix` (authoritative scan).
    async fn read_tree(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;

    /// Write `value` only if the version at `path` still equals `expected`
    /// (`None` = the path must be absent). Never retries.
    async fn write_if_version(
        &self,
        path: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, StoreError>;

    /// Subscribe to changes at or below `path`. The current subtree is
    /// replayed as events so late joiners converge without a separate read.
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Register a server-side cleanup `action` for `path`, applied when this
    /// handle's connection drops.
    async fn on_disconnect(&self, path: &str, action: DisconnectAction)
        -> Result<(), StoreError>;

    /// Tear down this handle, applying any registered disconnect actions.
    async fn disconnect(&self) -> Result<(), StoreError>;
}

/// Default retry budget for [`transactional_update`].
pub const DEFAULT_TXN_ATTEMPTS: u32 = 8;

/// Result of a [`transactional_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnResult {
    /// The closure produced a value and the swap landed.
    Applied {
        /// Version of the written value.
        version: u64,
    },
    /// The closure declined to write; nothing changed.
    Aborted,
}

/// Versioned read-modify-write with bounded retry.
///
/// Reads the current value, lets `f` decide on a replacement (`None` aborts
/// with no side effects), and attempts a CAS conditioned on the version that
/// was read. On conflict the loop re-reads and retries, failing with
/// [`StoreError::Busy`] once `attempts` is exhausted.
pub async fn transactional_update<F>(
    store: &dyn SharedStore,
    path: &str,
    attempts: u32,
    mut f: F,
) -> Result<TxnResult, StoreError>
where
    F: FnMut(Option<&Value>) -> Option<Value>,
{
    for _ in 0..attempts.max(1) {
        let current = store.read(path).await?;
        let expected = current.as_ref().map(|v| v.version);
        let next = match f(current.as_ref().map(|v| &v.value)) {
            Some(next) => next,
            None => return Ok(TxnResult::Aborted),
        };
        let outcome = store.write_if_version(path, expected, next).await?;
        if outcome.applied {
            return Ok(TxnResult::Applied {
                version: outcome.version,
            });
        }
        tracing::debug!(path, "transactional update conflicted, retrying");
    }
    Err(StoreError::Busy { path: path.into() })
}
