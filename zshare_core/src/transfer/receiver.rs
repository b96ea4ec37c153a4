//! Inbound side of one file.
//!
//! Records are owned by the session's dispatch loop, so every step for one
//! file runs to completion before the next frame for it is looked at.

use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use super::accounting::TransferStats;
use super::protocol::{Envelope, MetaData, ReceiveEvent, send_msg};
use super::transport::Transport;
use super::utils::validate_metadata;
use crate::config::ReceiveOptions;
use crate::crypto::{self, KeyPair, SymmetricKey};
use crate::error::{CryptoError, TransferError, TransportError, ValidationError};
use crate::{Direction, FileDetail, FileStatus, ReceivedFile, TransferEvent};

/// What a receiving record needs from its surroundings for one step
pub(crate) struct ReceiveContext<'a, T: ?Sized> {
    pub transport: &'a T,
    pub observer: &'a mpsc::Sender<TransferEvent>,
    pub options: &'a ReceiveOptions,
    pub keys: Option<&'a KeyPair>,
    pub progress_step: u8,
}

pub(crate) struct ReceivingFile {
    id: String,
    meta: MetaData,
    key: Option<SymmetricKey>,
    chunks: Vec<Bytes>,
    received: u64,
    stats: TransferStats,
    status: FileStatus,
    last_activity: Instant,
    detail: watch::Sender<FileDetail>,
}

impl ReceivingFile {
    pub fn new(id: String, meta: MetaData, progress_step: u8) -> (Self, watch::Receiver<FileDetail>) {
        let now = Instant::now();
        let mut detail = FileDetail::new(id.clone(), Direction::Receiving, MetaData {
            key: Vec::new(),
            ..meta.clone()
        });
        detail.encrypted = !meta.key.is_empty();
        let (tx, rx) = watch::channel(detail);
        let file = Self {
            id,
            stats: TransferStats::new(meta.size, progress_step, now),
            meta,
            key: None,
            chunks: Vec::new(),
            received: 0,
            status: FileStatus::Pending,
            last_activity: now,
            detail: tx,
        };
        (file, rx)
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// No chunk for longer than `timeout` while data is expected
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.status == FileStatus::Processing
            && now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// First frame for this id: check limits, recover the key, then either
    /// accept straight away or wait for a decision.
    pub async fn on_metadata<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) {
        tracing::info!(
            id = %self.id,
            name = %self.meta.name,
            size = self.meta.size,
            encrypted = !self.meta.key.is_empty(),
            "Incoming file"
        );
        if let Err(err) = validate_metadata(&self.meta, ctx.options.max_size) {
            self.fail(ctx, err.into(), true).await;
            return;
        }
        if !self.meta.key.is_empty() {
            let unwrapped = match ctx.keys {
                Some(keys) => crypto::unwrap_symmetric_key(&keys.private, &self.meta.key),
                None => Err(CryptoError::MissingPrivateKey),
            };
            match unwrapped {
                Ok(key) => self.key = Some(key),
                Err(err) => {
                    self.fail(ctx, err.into(), true).await;
                    return;
                }
            }
        }

        if ctx.options.auto_accept {
            self.accept(ctx).await;
        } else {
            self.set_status(FileStatus::WaitingAccept);
            let snapshot = self.detail.borrow().clone();
            let _ = ctx.observer.send(TransferEvent::Incoming(snapshot)).await;
        }
    }

    /// Caller approved; only meaningful while waiting for a decision
    pub async fn accept<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) -> bool {
        if !matches!(self.status, FileStatus::Pending | FileStatus::WaitingAccept) {
            tracing::warn!(id = %self.id, status = ?self.status, "Accept for a file not awaiting a decision");
            return false;
        }
        if let Err(err) = self.reply(ctx, ReceiveEvent::Accept).await {
            self.fail(ctx, err.into(), false).await;
            return false;
        }

        let now = Instant::now();
        self.stats = TransferStats::new(self.meta.size, ctx.progress_step, now);
        self.last_activity = now;
        self.status = FileStatus::Processing;
        self.detail.send_modify(|d| {
            d.status = FileStatus::Processing;
            d.started_at = now;
        });
        let _ = ctx
            .observer
            .send(TransferEvent::Accepted {
                id: self.id.clone(),
                direction: Direction::Receiving,
            })
            .await;

        if self.meta.size == 0 {
            self.complete(ctx).await;
        }
        true
    }

    pub async fn reject<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Err(err) = self.reply(ctx, ReceiveEvent::Reject).await {
            tracing::debug!(id = %self.id, error = %err, "Could not deliver reject");
        }
        let _ = ctx
            .observer
            .send(TransferEvent::Rejected {
                id: self.id.clone(),
                direction: Direction::Receiving,
            })
            .await;
        self.abort(ctx, TransferError::Rejected).await;
        true
    }

    pub async fn on_chunk<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>, data: Bytes) {
        match self.status {
            FileStatus::Processing => {}
            FileStatus::Pending | FileStatus::WaitingAccept => {
                let err = ValidationError::ProtocolViolation("chunk before accept");
                self.fail(ctx, err.into(), true).await;
                return;
            }
            FileStatus::Success | FileStatus::Aborted => {
                tracing::warn!(
                    id = %self.id,
                    status = ?self.status,
                    len = data.len(),
                    "Dropping chunk for finished transfer"
                );
                return;
            }
        }

        let plain = match &self.key {
            Some(key) => match crypto::decrypt_chunk(key, &data) {
                Ok(plain) => Bytes::from(plain),
                Err(err) => {
                    tracing::warn!(id = %self.id, error = %err, "Chunk failed authentication");
                    self.fail(ctx, ValidationError::Corrupted.into(), true).await;
                    return;
                }
            },
            None => data,
        };

        let received = self.received + plain.len() as u64;
        if received > self.meta.size {
            let err = ValidationError::Overrun {
                received,
                size: self.meta.size,
            };
            self.fail(ctx, err.into(), true).await;
            return;
        }

        let now = Instant::now();
        self.received = received;
        self.last_activity = now;
        self.stats.record(plain.len() as u64, now);
        self.chunks.push(plain);
        self.detail.send_modify(|d| {
            d.transferred = received;
            d.progress = self.stats.progress();
            d.bitrate = self.stats.bitrate(now);
        });

        if self.received == self.meta.size {
            self.complete(ctx).await;
        } else if self.stats.take_notification() {
            let snapshot = self.detail.borrow().clone();
            let _ = ctx.observer.send(TransferEvent::Progress(snapshot)).await;
        }
    }

    /// Give up on a transfer that stopped producing data
    pub async fn on_stall<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>, timeout: Duration) {
        self.fail(ctx, TransferError::Stalled(timeout.as_secs()), true).await;
    }

    /// Local stop; the sender is told with a reject so it stops pushing
    pub async fn cancel<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Err(err) = self.reply(ctx, ReceiveEvent::Reject).await {
            tracing::debug!(id = %self.id, error = %err, "Could not deliver cancel");
        }
        self.abort(ctx, TransferError::Cancelled).await;
        true
    }

    /// The channel is gone; nothing can be sent anymore
    pub async fn on_connection_lost<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) {
        if !self.status.is_terminal() {
            self.abort(ctx, TransportError::Closed.into()).await;
        }
    }

    async fn complete<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>) {
        let data = match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.remove(0),
            _ => {
                let mut out = BytesMut::with_capacity(self.received as usize);
                for chunk in self.chunks.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        };
        self.status = FileStatus::Success;
        self.detail.send_modify(|d| {
            d.status = FileStatus::Success;
            d.progress = 100;
        });
        let snapshot = self.detail.borrow().clone();
        tracing::info!(
            id = %self.id,
            name = %self.meta.name,
            size = self.meta.size,
            elapsed_ms = self.stats.elapsed(Instant::now()).as_millis() as u64,
            "File received"
        );

        let file = ReceivedFile {
            id: self.id.clone(),
            meta: MetaData {
                key: Vec::new(),
                ..self.meta.clone()
            },
            data,
        };
        let _ = ctx.observer.send(TransferEvent::Completed(snapshot)).await;
        let _ = ctx.observer.send(TransferEvent::Received(file)).await;
    }

    /// Abort and, when asked, tell the sender with `VALIDATE_ERROR`
    async fn fail<T: Transport + ?Sized>(
        &mut self,
        ctx: &ReceiveContext<'_, T>,
        err: TransferError,
        notify_peer: bool,
    ) {
        if notify_peer {
            if let Err(send_err) = self.reply(ctx, ReceiveEvent::ValidateError).await {
                tracing::debug!(id = %self.id, error = %send_err, "Could not deliver validate error");
            }
        }
        self.abort(ctx, err).await;
    }

    async fn abort<T: Transport + ?Sized>(&mut self, ctx: &ReceiveContext<'_, T>, err: TransferError) {
        let cause = err.cause();
        if err.is_cancelled() || matches!(err, TransferError::Rejected) {
            tracing::info!(id = %self.id, reason = %cause, "Receive stopped");
        } else {
            tracing::warn!(id = %self.id, error = %err, "Receive aborted");
        }
        self.status = FileStatus::Aborted;
        self.chunks.clear();
        self.key = None;
        self.detail.send_modify(|d| {
            d.status = FileStatus::Aborted;
            d.error = Some(cause.clone());
        });
        let detail = self.detail.borrow().clone();
        let _ = ctx.observer.send(TransferEvent::Aborted { detail, cause }).await;
    }

    async fn reply<T: Transport + ?Sized>(
        &self,
        ctx: &ReceiveContext<'_, T>,
        event: ReceiveEvent,
    ) -> Result<(), TransportError> {
        send_msg(ctx.transport, &Envelope::event(self.id.clone(), event)).await
    }

    fn set_status(&mut self, status: FileStatus) {
        self.status = status;
        self.detail.send_modify(|d| d.status = status);
    }
}
