// SPDX-License-Identifier: Apache-2.0
//! Socket-backed [`SharedStore`] implementation.
//!
//! [`RemoteStore`] speaks the CBOR wire protocol from `tessel_proto::wire`
//! to the store hub over a Unix socket. One background task owns the read
//! half: replies are routed to their requests by [`ReqId`], unsolicited
//! `Event` frames are fanned out to live subscriptions by path prefix.
//! Registered disconnect cleanup runs hub-side when the socket drops, so an
//! abruptly killed client still leaves the store tidy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tessel_proto::wire::{
    decode_message, encode_message, HelloPayload, Message, ReqId, WireError,
};
use tessel_proto::{DisconnectAction, Versioned};
use tessel_store::{CasOutcome, SharedStore, StoreError, StoreEvent, Subscription};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Client implementation version sent in the hello frame.
const CLIENT_VERSION: u32 = 1;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUF_SIZE: usize = 16 * 1024;

fn prefix_matches(prefix: &str, path: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct Shared {
    pending: Mutex<HashMap<ReqId, oneshot::Sender<Message>>>,
    subs: Mutex<Vec<(String, mpsc::Sender<StoreEvent>)>>,
    next_req: AtomicU64,
    /// Set by an explicit [`SharedStore::disconnect`].
    closed: AtomicBool,
    /// Set when the socket dies underneath us.
    dead: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<ReqId, oneshot::Sender<Message>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subs(&self) -> MutexGuard<'_, Vec<(String, mpsc::Sender<StoreEvent>)>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A [`SharedStore`] handle backed by one hub connection.
pub struct RemoteStore {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<JoinHandle<()>>>,
    conn_id: u64,
}

impl RemoteStore {
    /// Connect to the hub at `socket_path` and complete the hello exchange.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        client_name: &str,
    ) -> Result<Self, StoreError> {
        let mut stream = UnixStream::connect(socket_path.as_ref()).await?;

        let hello = Message::Hello(HelloPayload {
            client_name: client_name.to_string(),
            client_version: CLIENT_VERSION,
        });
        stream.write_all(&encode_message(&hello)?).await?;

        // Read exactly one frame for the greeting reply; leftover bytes (the
        // hub may pipeline) are handed to the read loop.
        let mut acc = Vec::with_capacity(256);
        let mut buf = [0u8; 4096];
        let ack = loop {
            match decode_message(&acc) {
                Ok((msg, used)) => {
                    acc.drain(..used);
                    break msg;
                }
                Err(WireError::Incomplete) => {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        return Err(StoreError::Closed);
                    }
                    acc.extend_from_slice(&buf[..n]);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let Message::HelloAck(ack) = ack else {
            return Err(StoreError::Protocol(format!(
                "expected hello ack, got {ack:?}"
            )));
        };
        debug!(conn_id = ack.conn_id, "connected to store hub");

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            subs: Mutex::new(Vec::new()),
            next_req: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read_half, acc, Arc::clone(&shared)));

        Ok(Self {
            shared,
            writer: tokio::sync::Mutex::new(write_half),
            reader: Mutex::new(Some(reader)),
            conn_id: ack.conn_id,
        })
    }

    /// Connection id assigned by the hub, for log correlation.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(StoreError::Closed);
        }
        if self.shared.dead.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    async fn request<F>(&self, build: F) -> Result<Message, StoreError>
    where
        F: FnOnce(ReqId) -> Message,
    {
        self.guard()?;
        let req = self.shared.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(req, tx);

        let pkt = encode_message(&build(req))?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_all(&pkt).await {
                self.shared.pending().remove(&req);
                self.shared.dead.store(true, Ordering::Relaxed);
                debug!(%err, "hub socket write failed");
                return Err(StoreError::Unavailable);
            }
        }

        match rx.await {
            Ok(Message::Error { message, .. }) => Err(StoreError::Protocol(message)),
            Ok(msg) => Ok(msg),
            // Sender dropped: the read loop died mid-request.
            Err(_) => {
                if self.shared.closed.load(Ordering::Relaxed) {
                    Err(StoreError::Closed)
                } else {
                    Err(StoreError::Unavailable)
                }
            }
        }
    }
}

fn unexpected(reply: &Message) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {reply:?}"))
}

#[async_trait::async_trait]
impl SharedStore for RemoteStore {
    async fn write(&self, path: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let path = path.to_string();
        match self
            .request(|req| Message::Write { req, path, value })
            .await?
        {
            Message::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn update(
        &self,
        path: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let path = path.to_string();
        match self
            .request(|req| Message::Update { req, path, fields })
            .await?
        {
            Message::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn read(&self, path: &str) -> Result<Option<Versioned>, StoreError> {
        let path = path.to_string();
        match self.request(|req| Message::Read { req, path }).await? {
            Message::ReadResult { found, .. } => Ok(found),
            other => Err(unexpected(&other)),
        }
    }

    async fn read_tree(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let prefix = prefix.to_string();
        match self.request(|req| Message::ReadTree { req, prefix }).await? {
            Message::TreeResult { entries, .. } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    async fn write_if_version(
        &self,
        path: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<CasOutcome, StoreError> {
        let path = path.to_string();
        match self
            .request(|req| Message::Cas {
                req,
                path,
                expected,
                value,
            })
            .await?
        {
            Message::CasResult {
                applied, version, ..
            } => Ok(CasOutcome { applied, version }),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Register before the request goes out: the hub replays the current
        // subtree as events and those may arrive ahead of the ack.
        self.shared.subs().push((path.to_string(), tx.clone()));

        let path_owned = path.to_string();
        let result = self
            .request(|req| Message::Subscribe {
                req,
                path: path_owned,
            })
            .await;
        match result {
            Ok(Message::Ack { .. }) => Ok(Subscription::new(rx)),
            Ok(other) => {
                self.shared.subs().retain(|(_, s)| !s.same_channel(&tx));
                Err(unexpected(&other))
            }
            Err(err) => {
                self.shared.subs().retain(|(_, s)| !s.same_channel(&tx));
                Err(err)
            }
        }
    }

    async fn on_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<(), StoreError> {
        let path = path.to_string();
        match self
            .request(|req| Message::OnDisconnect { req, path, action })
            .await?
        {
            Message::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.shared.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.shared.pending().clear();
        self.shared.subs().clear();
        // The hub applies registered cleanup actions when it sees EOF.
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

async fn read_loop(mut reader: OwnedReadHalf, mut acc: Vec<u8>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    'conn: loop {
        loop {
            match decode_message(&acc) {
                Ok((msg, used)) => {
                    acc.drain(..used);
                    dispatch(&shared, msg).await;
                }
                Err(WireError::Incomplete) => break,
                Err(err) => {
                    warn!(%err, "undecodable frame from hub");
                    break 'conn;
                }
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(err) => {
                debug!(%err, "hub socket read failed");
                break;
            }
        }
    }
    shared.dead.store(true, Ordering::Relaxed);
    // Dropping the reply senders fails any in-flight requests; dropping the
    // event senders ends every subscription stream.
    shared.pending().clear();
    shared.subs().clear();
}

async fn dispatch(shared: &Shared, msg: Message) {
    if let Message::Event {
        path,
        value,
        version,
    } = msg
    {
        let targets: Vec<mpsc::Sender<StoreEvent>> = {
            let subs = shared.subs();
            subs.iter()
                .filter(|(prefix, _)| prefix_matches(prefix, &path))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        let event = StoreEvent {
            path,
            value,
            version,
        };
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
        shared.subs().retain(|(_, tx)| !tx.is_closed());
        return;
    }

    let req = match &msg {
        Message::Ack { req }
        | Message::ReadResult { req, .. }
        | Message::CasResult { req, .. }
        | Message::TreeResult { req, .. } => Some(*req),
        Message::Error { req, .. } => *req,
        _ => None,
    };
    match req {
        Some(req) => {
            if let Some(tx) = shared.pending().remove(&req) {
                let _ = tx.send(msg);
            } else {
                debug!(req, "reply for unknown request");
            }
        }
        None => match msg {
            Message::Error { message, .. } => warn!(%message, "hub error"),
            other => warn!(?other, "unexpected frame from hub"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessel_proto::wire::HelloAckPayload;
    use tokio::net::UnixListener;

    fn scratch_socket(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tessel-client-{tag}-{}.sock", std::process::id()))
    }

    /// Minimal scripted hub: hello ack, then canned replies per request.
    async fn fake_hub(listener: UnixListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut acc = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let msg = loop {
                match decode_message(&acc) {
                    Ok((msg, used)) => {
                        acc.drain(..used);
                        break msg;
                    }
                    Err(WireError::Incomplete) => {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        acc.extend_from_slice(&buf[..n]);
                    }
                    Err(err) => panic!("fake hub decode: {err}"),
                }
            };
            let replies: Vec<Message> = match msg {
                Message::Hello(_) => vec![Message::HelloAck(HelloAckPayload {
                    server_version: 1,
                    conn_id: 9,
                })],
                Message::Write { req, .. } => vec![Message::Ack { req }],
                Message::Read { req, path } => vec![Message::ReadResult {
                    req,
                    found: Some(Versioned {
                        value: json!({ "path": path }),
                        version: 3,
                    }),
                }],
                Message::Cas { req, .. } => vec![Message::CasResult {
                    req,
                    applied: false,
                    version: 7,
                }],
                // Replay two events before the ack, like the real hub.
                Message::Subscribe { req, path } => vec![
                    Message::Event {
                        path: format!("{path}/a"),
                        value: Some(json!(1)),
                        version: 1,
                    },
                    Message::Event {
                        path: format!("{path}/b"),
                        value: None,
                        version: 0,
                    },
                    Message::Ack { req },
                ],
                Message::Update { req, .. } => vec![Message::Error {
                    req: Some(req),
                    message: "not an object at x".into(),
                }],
                other => panic!("fake hub got {other:?}"),
            };
            for reply in replies {
                stream.write_all(&encode_message(&reply).unwrap()).await.unwrap();
            }
        }
    }

    async fn connect(tag: &str) -> RemoteStore {
        let path = scratch_socket(tag);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_hub(listener));
        RemoteStore::connect(&path, "test").await.unwrap()
    }

    #[tokio::test]
    async fn correlates_replies_with_requests() {
        let store = connect("correlate").await;
        assert_eq!(store.conn_id(), 9);

        store.write("k", json!(1)).await.unwrap();
        let found = store.read("some/path").await.unwrap().unwrap();
        assert_eq!(found.version, 3);
        assert_eq!(found.value, json!({ "path": "some/path" }));

        let cas = store.write_if_version("k", Some(1), json!(2)).await.unwrap();
        assert!(!cas.applied);
        assert_eq!(cas.version, 7);
    }

    #[tokio::test]
    async fn hub_errors_surface_as_protocol_errors() {
        let store = connect("error").await;
        let err = store
            .update("x", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(m) if m.contains("not an object")));
    }

    #[tokio::test]
    async fn subscription_receives_replay_sent_before_the_ack() {
        let store = connect("subscribe").await;
        let mut sub = store.subscribe("sessions/s1").await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.path, "sessions/s1/a");
        assert_eq!(first.value, Some(json!(1)));

        let second = sub.recv().await.unwrap();
        assert_eq!(second.path, "sessions/s1/b");
        assert!(second.value.is_none());
    }

    #[tokio::test]
    async fn explicit_disconnect_makes_the_handle_closed() {
        let store = connect("disconnect").await;
        store.disconnect().await.unwrap();
        assert!(matches!(
            store.write("k", json!(1)).await,
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        assert!(prefix_matches("a/b", "a/b"));
        assert!(prefix_matches("a/b", "a/b/c"));
        assert!(!prefix_matches("a/b", "a/bc"));
        assert!(prefix_matches("", "anything"));
    }
}
