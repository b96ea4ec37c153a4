//! Error taxonomy for the transfer engine.
//!
//! Codec and crypto failures stay local to one frame or one file. Only
//! [`TransportError`] is allowed to take down every transfer on a channel.

use std::fmt;
use thiserror::Error;

/// Malformed or truncated wire frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("negative file size {0}")]
    NegativeSize(i64),
    #[error("frame has no file id")]
    MissingId,
    #[error("frame carries no payload")]
    MissingPayload,
}

impl From<prost::DecodeError> for DecodeError {
    fn from(e: prost::DecodeError) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// Key generation, wrapping or AEAD failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("key wrap failed: {0}")]
    Wrap(String),
    #[error("key unwrap failed: {0}")]
    Unwrap(String),
    #[error("chunk encryption failed")]
    Encrypt,
    #[error("chunk authentication failed")]
    Decrypt,
    #[error("ciphertext shorter than nonce and tag ({0} bytes)")]
    CiphertextTooShort(usize),
    #[error("encryption enabled but no peer public key is known")]
    MissingPeerKey,
    #[error("peer sent a wrapped key but no private key is loaded")]
    MissingPrivateKey,
}

/// Failure to turn a signaling token back into a session description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("token contains character {0:?} outside the URL-safe alphabet")]
    InvalidCharacter(char),
    #[error("token is not valid base64: {0}")]
    Base64(String),
    #[error("unknown dictionary code {0:#04x}")]
    UnknownCode(u8),
    #[error("escape byte at end of token")]
    DanglingEscape,
    #[error("decoded description is not UTF-8")]
    InvalidUtf8,
    #[error("empty token")]
    Empty,
    #[error("unsupported token format {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("url has no sdp parameter")]
    MissingToken,
}

/// Write or connection failure on the underlying channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("outbound buffer did not drain in time ({buffered} bytes buffered)")]
    DrainTimeout { buffered: usize },
    #[error("too many malformed frames ({0} in a row)")]
    Corrupted(usize),
}

/// Receiver-side validation failure; always answered with `VALIDATE_ERROR`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file is too large ({size} bytes, limit {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("file name too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("received {received} bytes for a {size} byte file")]
    Overrun { received: u64, size: u64 },
    #[error("chunk failed authentication")]
    Corrupted,
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// `VALIDATE_ERROR` from the receiver. Before acceptance it is sent when the
    /// metadata fails the size or name checks, and also when the wrapped key
    /// cannot be unwrapped. The frame does not say which, so the sender reports
    /// every pre-accept refusal as [`AbortCause::TooLarge`].
    #[error("peer reported a validation error")]
    PeerReported { before_accept: bool },
}

/// Rejected engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk size {size} outside 1..={max}")]
    ChunkSize { size: usize, max: usize },
    #[error("low water mark {low} above high water mark {high}")]
    Watermarks { low: usize, high: usize },
    #[error("progress step must be between 1 and 100")]
    ProgressStep,
}

/// Anything that ends a single file transfer early
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rejected by peer")]
    Rejected,
    #[error("peer did not answer within {0} seconds")]
    AcceptTimeout(u64),
    #[error("no data for {0} seconds")]
    Stalled(u64),
    #[error("cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// User-facing reason attached to an aborted transfer
    pub fn cause(&self) -> AbortCause {
        match self {
            TransferError::Decode(e) => AbortCause::Protocol(e.to_string()),
            TransferError::Crypto(e) => AbortCause::Crypto(e.to_string()),
            TransferError::Validation(ValidationError::TooLarge { .. }) => AbortCause::TooLarge,
            TransferError::Validation(ValidationError::Corrupted) => AbortCause::Corrupted,
            TransferError::Validation(ValidationError::PeerReported { before_accept: true }) => {
                AbortCause::TooLarge
            }
            TransferError::Validation(ValidationError::PeerReported { before_accept: false }) => {
                AbortCause::PeerValidation
            }
            TransferError::Validation(e) => AbortCause::Protocol(e.to_string()),
            TransferError::Transport(_) => AbortCause::ConnectionLost,
            TransferError::Rejected => AbortCause::Rejected,
            TransferError::AcceptTimeout(_) => AbortCause::AcceptTimeout,
            TransferError::Stalled(_) => AbortCause::Stalled,
            TransferError::Cancelled => AbortCause::Cancelled,
            TransferError::Io(e) => AbortCause::Io(e.to_string()),
        }
    }

    /// Cancellation is a graceful stop, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Why a transfer ended without success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Rejected,
    /// Refused on its metadata before any chunk was sent. On the sending side
    /// this also covers a receiver that could not unwrap the file key.
    TooLarge,
    /// The peer answered `VALIDATE_ERROR` mid-transfer
    PeerValidation,
    Corrupted,
    Cancelled,
    AcceptTimeout,
    Stalled,
    ConnectionLost,
    Protocol(String),
    Crypto(String),
    Io(String),
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Rejected => write!(f, "rejected by peer"),
            AbortCause::TooLarge => write!(f, "file too large"),
            AbortCause::PeerValidation => write!(f, "peer validation failed"),
            AbortCause::Corrupted => write!(f, "corrupted"),
            AbortCause::Cancelled => write!(f, "cancelled"),
            AbortCause::AcceptTimeout => write!(f, "peer did not respond"),
            AbortCause::Stalled => write!(f, "stalled"),
            AbortCause::ConnectionLost => write!(f, "connection lost"),
            AbortCause::Protocol(m) => write!(f, "protocol error: {}", m),
            AbortCause::Crypto(m) => write!(f, "crypto error: {}", m),
            AbortCause::Io(m) => write!(f, "i/o error: {}", m),
        }
    }
}
