// SPDX-License-Identifier: Apache-2.0
//! Headless store hub.
//!
//! Hosts the in-memory substrate behind a Unix socket. Each connection gets
//! its own [`MemoryClient`] handle, so disconnect cleanup registered by a
//! client runs automatically when its socket drops — including process
//! crashes, which is the whole point of registering cleanup hub-side.

mod config;

use anyhow::Result;
use config::{ConfigService, FsConfigStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessel_proto::wire::{
    decode_message, default_socket_path, encode_message, payload_len, HelloAckPayload, Message,
    ReqId, WireError,
};
use tessel_store::{MemoryClient, MemoryStore, SharedStore, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

const SERVER_VERSION: u32 = 1;
const MAX_PAYLOAD: usize = 8 * 1024 * 1024;
const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostPrefs {
    socket_path: String,
}

impl Default for HostPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Config is best-effort; a broken config dir never stops the hub.
    let config: Option<ConfigService<FsConfigStore>> =
        FsConfigStore::new().map(ConfigService::new).ok();
    let prefs: HostPrefs = config
        .as_ref()
        .and_then(|c| c.load::<HostPrefs>("store_hub").ok().flatten())
        .unwrap_or_default();
    // Persist defaults once if absent.
    if let Some(cfg) = &config {
        let _ = cfg.save("store_hub", &prefs);
    }

    // Remove a stale socket from a previous run.
    let _ = std::fs::remove_file(&prefs.socket_path);
    let listener = UnixListener::bind(&prefs.socket_path)?;
    info!("store hub listening at {}", prefs.socket_path);

    serve(listener, Arc::new(MemoryStore::new())).await
}

async fn serve(listener: UnixListener, store: Arc<MemoryStore>) -> Result<()> {
    let mut next_conn = 1u64;
    loop {
        let (stream, _) = listener.accept().await?;
        let conn_id = next_conn;
        next_conn += 1;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &store, conn_id).await {
                warn!(conn_id, ?err, "client handler error");
            }
        });
    }
}

async fn handle_client(stream: UnixStream, store: &MemoryStore, conn_id: u64) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    let (outbox, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let client = store.client();
    let mut greeted = false;
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    'conn: loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        acc.extend_from_slice(&read_buf[..n]);

        // Process as many complete frames as are buffered.
        loop {
            // Reject oversized frames before buffering their payload.
            if payload_len(&acc).is_some_and(|len| len > MAX_PAYLOAD) {
                warn!(conn_id, "oversized frame");
                break 'conn;
            }
            let msg = match decode_message(&acc) {
                Ok((msg, used)) => {
                    acc.drain(..used);
                    msg
                }
                Err(WireError::Incomplete) => break,
                Err(err) => {
                    warn!(conn_id, %err, "undecodable frame");
                    break 'conn;
                }
            };

            if !greeted {
                let Message::Hello(hello) = msg else {
                    warn!(conn_id, "first frame was not a hello");
                    break 'conn;
                };
                info!(conn_id, client = %hello.client_name, "client connected");
                let ack = Message::HelloAck(HelloAckPayload {
                    server_version: SERVER_VERSION,
                    conn_id,
                });
                let _ = outbox.send(encode_message(&ack)?).await;
                greeted = true;
                continue;
            }

            handle_request(msg, &client, &outbox).await?;
        }
    }

    // Socket gone: apply any registered cleanup actions.
    let _ = client.disconnect().await;
    info!(conn_id, "client disconnected");
    Ok(())
}

fn error_reply(req: ReqId, err: &StoreError) -> Message {
    Message::Error {
        req: Some(req),
        message: err.to_string(),
    }
}

fn ack_or_error(req: ReqId, result: Result<(), StoreError>) -> Message {
    match result {
        Ok(()) => Message::Ack { req },
        Err(err) => error_reply(req, &err),
    }
}

async fn handle_request(
    msg: Message,
    client: &MemoryClient,
    outbox: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let reply = match msg {
        Message::Write { req, path, value } => ack_or_error(req, client.write(&path, value).await),
        Message::Update { req, path, fields } => {
            ack_or_error(req, client.update(&path, fields).await)
        }
        Message::Read { req, path } => match client.read(&path).await {
            Ok(found) => Message::ReadResult { req, found },
            Err(err) => error_reply(req, &err),
        },
        Message::ReadTree { req, prefix } => match client.read_tree(&prefix).await {
            Ok(entries) => Message::TreeResult { req, entries },
            Err(err) => error_reply(req, &err),
        },
        Message::Cas {
            req,
            path,
            expected,
            value,
        } => match client.write_if_version(&path, expected, value).await {
            Ok(outcome) => Message::CasResult {
                req,
                applied: outcome.applied,
                version: outcome.version,
            },
            Err(err) => error_reply(req, &err),
        },
        Message::OnDisconnect { req, path, action } => {
            ack_or_error(req, client.on_disconnect(&path, action).await)
        }
        Message::Subscribe { req, path } => match client.subscribe(&path).await {
            Ok(mut sub) => {
                // Forward subtree replay and live changes for the life of
                // the subscription.
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    while let Some(event) = sub.recv().await {
                        let frame = Message::Event {
                            path: event.path,
                            value: event.value,
                            version: event.version,
                        };
                        match encode_message(&frame) {
                            Ok(pkt) => {
                                if outbox.send(pkt).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(%err, "failed to encode event frame");
                                break;
                            }
                        }
                    }
                });
                Message::Ack { req }
            }
            Err(err) => error_reply(req, &err),
        },
        Message::Hello(_) => Message::Error {
            req: None,
            message: "duplicate hello".into(),
        },
        other => Message::Error {
            req: None,
            message: format!("clients may not send {other:?}"),
        },
    };

    let _ = outbox.send(encode_message(&reply)?).await;
    Ok(())
}
