//! Outbound side of one file: announce, wait for a decision, push chunks.

use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::accounting::TransferStats;
use super::constants::{DEFAULT_MIME_TYPE, MAX_CHUNK_SIZE};
use super::protocol::{Envelope, MetaData, ReceiveEvent, send_msg};
use super::transport::{Transport, wait_for_drain};
use crate::config::SendOptions;
use crate::crypto::{self, PublicKey, SymmetricKey};
use crate::error::{CryptoError, TransferError, TransportError, ValidationError};
use crate::{Direction, FileDetail, FileStatus, TransferEvent};

/// Where the bytes of an outbound file come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Path {
        path: PathBuf,
        mime: Option<String>,
    },
    Memory {
        name: String,
        mime: Option<String>,
        data: Bytes,
    },
}

impl FileSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        FileSource::Path {
            path: path.into(),
            mime: None,
        }
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        FileSource::Memory {
            name: name.into(),
            mime: None,
            data: data.into(),
        }
    }

    pub fn with_mime(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            FileSource::Path { mime, .. } | FileSource::Memory { mime, .. } => {
                *mime = Some(value.into())
            }
        }
        self
    }

    /// Name announced to the peer
    pub fn name(&self) -> String {
        match self {
            FileSource::Path { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown_file".to_string()),
            FileSource::Memory { name, .. } => name.clone(),
        }
    }

    async fn open(self) -> io::Result<(MetaData, Box<dyn AsyncRead + Send + Unpin>)> {
        let name = self.name();
        match self {
            FileSource::Path { path, mime } => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                let meta = MetaData {
                    name,
                    size,
                    mime: mime.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
                    key: Vec::new(),
                };
                Ok((meta, Box::new(file)))
            }
            FileSource::Memory { mime, data, .. } => {
                let meta = MetaData {
                    name,
                    size: data.len() as u64,
                    mime: mime.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
                    key: Vec::new(),
                };
                Ok((meta, Box::new(io::Cursor::new(data))))
            }
        }
    }
}

/// One outbound transfer. Runs in its own task and is the only writer of its
/// [`FileDetail`].
pub(crate) struct OutboundTransfer<T> {
    pub id: String,
    pub transport: Arc<T>,
    pub options: SendOptions,
    pub progress_step: u8,
    pub peer_key: Option<PublicKey>,
    /// Receiver events routed here by the session
    pub events: mpsc::Receiver<ReceiveEvent>,
    pub observer: mpsc::Sender<TransferEvent>,
    pub stop: CancellationToken,
    pub detail: watch::Sender<FileDetail>,
}

impl<T: Transport> OutboundTransfer<T> {
    pub async fn run(mut self, source: FileSource) -> FileStatus {
        let result = self.drive(source).await;
        self.finish(result).await
    }

    async fn drive(&mut self, source: FileSource) -> Result<(), TransferError> {
        let (mut meta, mut reader) = source.open().await?;
        let key = if self.options.is_encrypt {
            let peer = self.peer_key.as_ref().ok_or(CryptoError::MissingPeerKey)?;
            let key = crypto::generate_symmetric_key();
            meta.key = crypto::wrap_symmetric_key(peer, &key)?;
            Some(key)
        } else {
            None
        };
        self.detail.send_modify(|d| {
            d.meta = MetaData {
                key: Vec::new(),
                ..meta.clone()
            };
            d.encrypted = key.is_some();
        });

        if self.stop.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let size = meta.size;
        send_msg(self.transport.as_ref(), &Envelope::meta_data(self.id.clone(), meta)).await?;
        self.set_status(FileStatus::WaitingAccept);
        tracing::info!(id = %self.id, size, encrypted = key.is_some(), "Announced file, waiting for peer");

        self.wait_for_accept().await?;
        self.detail.send_modify(|d| {
            d.status = FileStatus::Processing;
            d.started_at = Instant::now();
        });
        let _ = self
            .observer
            .send(TransferEvent::Accepted {
                id: self.id.clone(),
                direction: Direction::Sending,
            })
            .await;

        self.push_chunks(&mut reader, size, key.as_ref()).await
    }

    async fn wait_for_accept(&mut self) -> Result<(), TransferError> {
        let deadline = tokio::time::sleep(self.options.accept_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Err(TransferError::Cancelled),
                _ = &mut deadline => {
                    return Err(TransferError::AcceptTimeout(self.options.accept_timeout_secs));
                }
                event = self.events.recv() => match event {
                    Some(ReceiveEvent::Accept) => return Ok(()),
                    Some(ReceiveEvent::Reject) => return Err(TransferError::Rejected),
                    Some(ReceiveEvent::ValidateError) => {
                        return Err(ValidationError::PeerReported { before_accept: true }.into());
                    }
                    Some(other) => {
                        tracing::debug!(id = %self.id, ?other, "Ignoring event while waiting for decision");
                    }
                    None => return Err(TransportError::Closed.into()),
                },
            }
        }
    }

    async fn push_chunks(
        &mut self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        key: Option<&SymmetricKey>,
    ) -> Result<(), TransferError> {
        let chunk_size = self.options.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let mut buffer = vec![0u8; chunk_size];
        let mut stats = TransferStats::new(size, self.progress_step, Instant::now());
        let mut chunks = 0u64;

        while stats.done() < size {
            if self.stop.is_cancelled() {
                tracing::info!(id = %self.id, sent = stats.done(), size, "Stopped before next chunk");
                return Err(TransferError::Cancelled);
            }
            self.check_peer_events()?;

            let len = (size - stats.done()).min(chunk_size as u64) as usize;
            let plain = &mut buffer[..len];
            reader.read_exact(plain).await?;
            let payload = match key {
                Some(key) => Bytes::from(crypto::encrypt_chunk(key, plain)?),
                None => Bytes::copy_from_slice(plain),
            };

            let drain = wait_for_drain(
                self.transport.as_ref(),
                self.options.buffered_amount_high,
                self.options.buffered_amount_low,
                self.options.drain_timeout(),
            );
            tokio::pin!(drain);
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return Err(TransferError::Cancelled),
                    event = self.events.recv() => match event {
                        Some(event) => {
                            if let Some(err) = mid_transfer_error(event) {
                                return Err(err);
                            }
                            tracing::trace!(id = %self.id, ?event, "Peer event while draining");
                        }
                        None => return Err(TransportError::Closed.into()),
                    },
                    drained = &mut drain => {
                        drained?;
                        break;
                    }
                }
            }
            send_msg(self.transport.as_ref(), &Envelope::chunk(self.id.clone(), payload)).await?;

            chunks += 1;
            stats.record(len as u64, Instant::now());
            self.publish_progress(&mut stats).await;
        }

        tracing::debug!(id = %self.id, chunks, size, "All chunks handed to transport");
        Ok(())
    }

    /// Events that arrived while pushing. The peer may give up at any time.
    fn check_peer_events(&mut self) -> Result<(), TransferError> {
        loop {
            match self.events.try_recv() {
                Ok(event) => match mid_transfer_error(event) {
                    Some(err) => return Err(err),
                    None => tracing::trace!(id = %self.id, ?event, "Peer event during transfer"),
                },
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed.into()),
            }
        }
    }

    async fn publish_progress(&self, stats: &mut TransferStats) {
        let now = Instant::now();
        self.detail.send_modify(|d| {
            d.transferred = stats.done();
            d.progress = stats.progress();
            d.bitrate = stats.bitrate(now);
        });
        if stats.take_notification() {
            let snapshot = self.detail.borrow().clone();
            let _ = self.observer.send(TransferEvent::Progress(snapshot)).await;
        }
    }

    fn set_status(&self, status: FileStatus) {
        self.detail.send_modify(|d| d.status = status);
    }

    async fn finish(self, result: Result<(), TransferError>) -> FileStatus {
        match result {
            Ok(()) => {
                self.detail.send_modify(|d| {
                    d.status = FileStatus::Success;
                    d.progress = 100;
                });
                let snapshot = self.detail.borrow().clone();
                tracing::info!(
                    id = %self.id,
                    name = %snapshot.meta.name,
                    elapsed_ms = snapshot.started_at.elapsed().as_millis() as u64,
                    "File sent"
                );
                let _ = self.observer.send(TransferEvent::Completed(snapshot)).await;
                FileStatus::Success
            }
            Err(err) => {
                let cause = err.cause();
                if err.is_cancelled() {
                    tracing::info!(id = %self.id, "Send cancelled");
                } else {
                    tracing::warn!(id = %self.id, error = %err, "Send aborted");
                }
                self.detail.send_modify(|d| {
                    d.status = FileStatus::Aborted;
                    d.error = Some(cause.clone());
                });
                if matches!(err, TransferError::Rejected) {
                    let _ = self
                        .observer
                        .send(TransferEvent::Rejected {
                            id: self.id.clone(),
                            direction: Direction::Sending,
                        })
                        .await;
                }
                let detail = self.detail.borrow().clone();
                let _ = self.observer.send(TransferEvent::Aborted { detail, cause }).await;
                FileStatus::Aborted
            }
        }
    }
}

/// Receiver events that end a transfer once chunks are flowing
fn mid_transfer_error(event: ReceiveEvent) -> Option<TransferError> {
    match event {
        ReceiveEvent::ValidateError => {
            Some(ValidationError::PeerReported { before_accept: false }.into())
        }
        ReceiveEvent::Reject => Some(TransferError::Rejected),
        _ => None,
    }
}
