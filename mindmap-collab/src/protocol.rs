//! Binary wire protocol (y-protocols framing).
//!
//! Every WebSocket binary message is one frame:
//! ```text
//! ┌────────────┬──────────────┬──────────────────────────┐
//! │ kind       │ sync subkind │ payload                  │
//! │ varuint    │ varuint      │ varUint8Array            │
//! ├────────────┼──────────────┼──────────────────────────┤
//! │ 0 = sync   │ 0 = step 1   │ encoded state vector     │
//! │            │ 1 = step 2   │ encoded update           │
//! │            │ 2 = update   │ encoded update           │
//! │ 1 = aware. │ (absent)     │ awareness update         │
//! └────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Payloads are opaque here; the document and the awareness registry decode
//! them. Frames are interoperable with stock Yjs WebSocket clients.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

pub const MESSAGE_SYNC: u32 = 0;
pub const MESSAGE_AWARENESS: u32 = 1;

pub const SYNC_STEP1: u32 = 0;
pub const SYNC_STEP2: u32 = 1;
pub const SYNC_UPDATE: u32 = 2;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u32),
    #[error("Unknown sync message kind: {0}")]
    UnknownSyncKind(u32),
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Rejected document update: {0}")]
    InvalidUpdate(#[from] crate::document::DocError),
    #[error("Rejected awareness update: {0}")]
    InvalidAwareness(#[from] crate::awareness::AwarenessError),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake step 1: sender's state vector
    SyncStep1(Vec<u8>),
    /// Handshake step 2: everything the receiver was missing
    SyncStep2(Vec<u8>),
    /// Incremental document update
    Update(Vec<u8>),
    /// Awareness (presence) update
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Frame::SyncStep1(payload) => {
                buf.write_var(MESSAGE_SYNC);
                buf.write_var(SYNC_STEP1);
                buf.write_buf(payload);
            }
            Frame::SyncStep2(payload) => {
                buf.write_var(MESSAGE_SYNC);
                buf.write_var(SYNC_STEP2);
                buf.write_buf(payload);
            }
            Frame::Update(payload) => {
                buf.write_var(MESSAGE_SYNC);
                buf.write_var(SYNC_UPDATE);
                buf.write_buf(payload);
            }
            Frame::Awareness(payload) => {
                buf.write_var(MESSAGE_AWARENESS);
                buf.write_buf(payload);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let kind: u32 = cursor.read_var().map_err(malformed)?;
        match kind {
            MESSAGE_SYNC => {
                let sub: u32 = cursor.read_var().map_err(malformed)?;
                let payload = cursor.read_buf().map_err(malformed)?.to_vec();
                match sub {
                    SYNC_STEP1 => Ok(Frame::SyncStep1(payload)),
                    SYNC_STEP2 => Ok(Frame::SyncStep2(payload)),
                    SYNC_UPDATE => Ok(Frame::Update(payload)),
                    other => Err(ProtocolError::UnknownSyncKind(other)),
                }
            }
            MESSAGE_AWARENESS => {
                let payload = cursor.read_buf().map_err(malformed)?.to_vec();
                Ok(Frame::Awareness(payload))
            }
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }

    /// Short name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::SyncStep1(_) => "sync-step-1",
            Frame::SyncStep2(_) => "sync-step-2",
            Frame::Update(_) => "update",
            Frame::Awareness(_) => "awareness",
        }
    }
}

fn malformed(e: yrs::encoding::read::Error) -> ProtocolError {
    ProtocolError::Malformed(e.to_string())
}
