// SPDX-License-Identifier: Apache-2.0
//! Deterministic CBOR framing for hub traffic.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR-encoded [`Message`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use crate::{DisconnectAction, Versioned};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default Unix socket path for the store hub.
///
/// Prefers the per-user runtime dir (`XDG_RUNTIME_DIR`) and falls back to
/// `/tmp` when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("tessel-store.sock")
}

/// Protocol magic constant "TSL!".
pub const MAGIC: [u8; 4] = [0x54, 0x53, 0x4c, 0x21];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes (magic + version + flags + payload length).
pub const HEADER_LEN: usize = 12;
/// Checksum length in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Request correlation id, allocated by the client per outbound request.
pub type ReqId = u64;

/// Wire framing and decoding errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),
    /// Not enough bytes for a full packet.
    #[error("incomplete packet")]
    Incomplete,
    /// Magic bytes did not match.
    #[error("bad magic")]
    BadMagic,
    /// Unknown protocol version.
    #[error("unsupported wire version {0:#06x}")]
    Version(u16),
    /// blake3 checksum mismatch.
    #[error("checksum mismatch")]
    Checksum,
}

/// Client connection greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Free-form client identifier for hub logs.
    pub client_name: String,
    /// Client implementation version (not wire version).
    pub client_version: u32,
}

/// Hub greeting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    /// Hub implementation version.
    pub server_version: u32,
    /// Connection id assigned by the hub.
    pub conn_id: u64,
}

/// All hub traffic. Requests carry a [`ReqId`] echoed by the matching reply;
/// [`Message::Event`] frames are unsolicited pushes for active
/// subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client → hub greeting; must be the first frame on a connection.
    Hello(HelloPayload),
    /// Hub → client greeting reply.
    HelloAck(HelloAckPayload),
    /// Overwrite the value at a path.
    Write {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented store path.
        path: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Shallow-merge fields into the object at a path.
    Update {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented store path.
        path: String,
        /// Fields to merge.
        fields: serde_json::Map<String, serde_json::Value>,
    },
    /// Read the value and version at a path.
    Read {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented store path.
        path: String,
    },
    /// Read every record at or below a prefix.
    ReadTree {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented path prefix.
        prefix: String,
    },
    /// Compare-and-swap: write only if the path version is unchanged.
    Cas {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented store path.
        path: String,
        /// Expected current version; `None` means "path must be absent".
        expected: Option<u64>,
        /// Value to write on success.
        value: serde_json::Value,
    },
    /// Subscribe to a path prefix; current subtree is replayed as events.
    Subscribe {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented path prefix.
        path: String,
    },
    /// Register a cleanup action applied by the hub when this connection
    /// drops.
    OnDisconnect {
        /// Correlation id.
        req: ReqId,
        /// Slash-segmented store path.
        path: String,
        /// Action to apply on disconnect.
        action: DisconnectAction,
    },
    /// Generic success reply for requests without a payload.
    Ack {
        /// Correlation id of the acknowledged request.
        req: ReqId,
    },
    /// Reply to [`Message::Read`].
    ReadResult {
        /// Correlation id.
        req: ReqId,
        /// Value and version, or `None` when the path is absent.
        found: Option<Versioned>,
    },
    /// Reply to [`Message::ReadTree`].
    TreeResult {
        /// Correlation id.
        req: ReqId,
        /// Path/record pairs at or below the requested prefix.
        entries: Vec<(String, Versioned)>,
    },
    /// Reply to [`Message::Cas`].
    CasResult {
        /// Correlation id.
        req: ReqId,
        /// Whether the swap was applied.
        applied: bool,
        /// Version now stored at the path.
        version: u64,
    },
    /// Unsolicited change notification for a subscribed prefix.
    Event {
        /// Path that changed.
        path: String,
        /// New value, or `None` when the path was removed.
        value: Option<serde_json::Value>,
        /// Version after the change (0 for removals).
        version: u64,
    },
    /// Request failure or protocol error.
    Error {
        /// Correlation id of the failing request, when attributable.
        req: Option<ReqId>,
        /// Human-readable reason.
        message: String,
    },
}

/// Encode a [`Message`] into a full framed packet.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::with_capacity(128);
    ciborium::ser::into_writer(msg, &mut payload).map_err(|e| WireError::Encode(e.to_string()))?;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_be_bytes());
    header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    let mut hasher = Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    out.extend_from_slice(checksum.as_bytes());
    Ok(out)
}

/// Payload length promised by a frame header, if a full header is present.
///
/// Lets stream readers size their reads without decoding the payload.
pub fn payload_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize)
}

/// Decode one [`Message`] from the front of `bytes`, returning the message
/// and the number of bytes consumed.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(WireError::Incomplete);
    }
    if bytes[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WireError::Version(version));
    }
    let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let total = HEADER_LEN + len + CHECKSUM_LEN;
    if bytes.len() < total {
        return Err(WireError::Incomplete);
    }
    let header = &bytes[0..HEADER_LEN];
    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let checksum = &bytes[HEADER_LEN + len..total];

    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    if hasher.finalize().as_bytes() != checksum {
        return Err(WireError::Checksum);
    }

    let msg: Message =
        ciborium::de::from_reader(payload).map_err(|e| WireError::Decode(e.to_string()))?;
    Ok((msg, total))
}
