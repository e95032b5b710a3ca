// src/core/wire.rs

//! The wire protocol: length-delimited JSON frames carrying RPC calls,
//! replies, faults, and server-push events.
//!
//! Method names are symbolic strings routed through a handler table on the
//! server and a typed stub on the client; there is no dynamic attribute
//! forwarding anywhere in the stack.

use crate::core::errors::AhaError;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

/// Frames larger than this are protocol violations, not payloads.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A single message on a transport session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMsg {
    /// An RPC request. `seq` correlates the reply.
    Call {
        seq: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// A successful RPC reply.
    Reply { seq: u64, value: Value },
    /// A failed RPC reply carrying the symbolic error code.
    Fault { seq: u64, code: String, mesg: String },
    /// A server-push event on a subscribed topic.
    Event { topic: String, data: Value },
    /// Orderly end-of-session marker.
    Fini,
}

impl WireMsg {
    pub fn fault(seq: u64, err: &AhaError) -> Self {
        WireMsg::Fault {
            seq,
            code: err.code().to_string(),
            mesg: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, AhaError> {
        let buf = serde_json::to_vec(self)?;
        Ok(Bytes::from(buf))
    }

    pub fn decode(buf: &BytesMut) -> Result<Self, AhaError> {
        serde_json::from_slice(buf)
            .map_err(|e| AhaError::BadArg(format!("malformed wire frame: {e}")))
    }
}

/// Builds the length-delimited codec both sides of a session share.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}
