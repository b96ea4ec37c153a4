use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub mod config;
pub mod crypto;
pub mod error;
pub mod signaling;
pub mod transfer;

pub use config::EngineConfig;
pub use error::{AbortCause, TransferError};
pub use transfer::protocol::{Envelope, MetaData, Payload, ReceiveEvent};
pub use transfer::sender::FileSource;
pub use transfer::session::{Session, SessionHandle, SessionKeys};
pub use transfer::transport::{ChannelState, FrameSource, Transport, memory_channel};

/// Lifecycle of one file, on either side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Pending,
    WaitingAccept,
    Processing,
    Success,
    /// Ended without the whole file; the cause sits in `FileDetail::error`
    Aborted,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Success | FileStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Read-only view of a transfer, as published by the state machine that owns it
#[derive(Debug, Clone)]
pub struct FileDetail {
    pub id: String,
    pub direction: Direction,
    pub meta: MetaData,
    pub status: FileStatus,
    pub progress: u8,
    /// Smoothed bytes per second
    pub bitrate: f64,
    /// Payload bytes sent or received so far (plaintext)
    pub transferred: u64,
    pub started_at: Instant,
    pub error: Option<AbortCause>,
    pub encrypted: bool,
}

impl FileDetail {
    pub fn new(id: impl Into<String>, direction: Direction, meta: MetaData) -> Self {
        Self {
            id: id.into(),
            direction,
            meta,
            status: FileStatus::Pending,
            progress: 0,
            bitrate: 0.0,
            transferred: 0,
            started_at: Instant::now(),
            error: None,
            encrypted: false,
        }
    }
}

/// A fully reassembled inbound file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: String,
    pub meta: MetaData,
    pub data: Bytes,
}

/// Report from a session to whoever drives it
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Peer announced a file and waits for `accept` or `reject`
    Incoming(FileDetail),
    Accepted { id: String, direction: Direction },
    Rejected { id: String, direction: Direction },
    Progress(FileDetail),
    Completed(FileDetail),
    Received(ReceivedFile),
    Aborted { detail: FileDetail, cause: AbortCause },
    SessionClosed { reason: String },
}
