//! Per-channel dispatch.
//!
//! One task owns the inbound half of a channel. It decodes every frame and
//! hands it to the state machine registered under the frame's id: receiver
//! events go to the outbound transfer (each running in its own task), while
//! metadata and chunks drive the inbound records the task owns itself.
//! Observers never touch a record; they read the `watch` snapshots kept in
//! the registry.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{Envelope, MetaData, Payload, ReceiveEvent};
use super::receiver::{ReceiveContext, ReceivingFile};
use super::sender::{FileSource, OutboundTransfer};
use super::transport::{FrameSource, Transport};
use crate::config::EngineConfig;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::TransportError;
use crate::{Direction, FileDetail, FileStatus, TransferEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1000;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
/// Receiver events queued for one outbound transfer
const ROUTE_CAPACITY: usize = 64;
const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Key material for one channel
#[derive(Debug, Clone, Default)]
pub struct SessionKeys {
    /// Ours; needed to unwrap keys of encrypted inbound files
    pub local: Option<KeyPair>,
    /// The peer's; needed to send encrypted files
    pub peer: Option<PublicKey>,
}

type Registry = Arc<RwLock<HashMap<(Direction, String), watch::Receiver<FileDetail>>>>;

enum SessionCommand {
    Send {
        id: String,
        source: FileSource,
        reply: oneshot::Sender<()>,
    },
    Accept {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Reject {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Forget {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable control surface of a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    registry: Registry,
}

impl SessionHandle {
    /// Start sending a file; returns the id it travels under
    pub async fn send_file(&self, source: FileSource) -> Result<String, TransportError> {
        let id = Uuid::new_v4().to_string();
        let (reply, registered) = oneshot::channel();
        self.command(SessionCommand::Send {
            id: id.clone(),
            source,
            reply,
        })
        .await?;
        registered.await.map_err(|_| TransportError::Closed)?;
        Ok(id)
    }

    /// Approve an incoming file. False if nothing was waiting under `id`.
    pub async fn accept(&self, id: &str) -> Result<bool, TransportError> {
        self.request(|reply| SessionCommand::Accept {
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn reject(&self, id: &str) -> Result<bool, TransportError> {
        self.request(|reply| SessionCommand::Reject {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Stop a transfer in either direction. An outbound one halts at the next
    /// chunk boundary; chunks already handed to the transport still arrive.
    pub async fn cancel(&self, id: &str) -> Result<bool, TransportError> {
        self.request(|reply| SessionCommand::Cancel {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Drop the record of a finished transfer.
    ///
    /// Finished transfers keep their record so their final status stays
    /// readable; nothing removes it except this call. A long-lived session
    /// should forget each id once its `Completed` or `Aborted` event has been
    /// handled. Returns false while the transfer is still running or when the
    /// id is unknown.
    pub async fn forget(&self, id: &str) -> Result<bool, TransportError> {
        self.request(|reply| SessionCommand::Forget {
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.command(SessionCommand::Shutdown).await
    }

    pub async fn snapshot(&self, id: &str) -> Option<FileDetail> {
        let rx = self.subscribe(id).await?;
        let detail = rx.borrow().clone();
        Some(detail)
    }

    /// All known transfers, oldest first. Finished ones stay listed until
    /// they are forgotten.
    pub async fn snapshots(&self) -> Vec<FileDetail> {
        let registry = self.registry.read().await;
        let mut all: Vec<FileDetail> = registry.values().map(|rx| rx.borrow().clone()).collect();
        all.sort_by_key(|d| d.started_at);
        all
    }

    /// Live view of one transfer. Outbound ids take precedence if the peer
    /// happened to pick the same id.
    pub async fn subscribe(&self, id: &str) -> Option<watch::Receiver<FileDetail>> {
        let registry = self.registry.read().await;
        [Direction::Sending, Direction::Receiving]
            .into_iter()
            .find_map(|direction| registry.get(&(direction, id.to_string())).cloned())
    }

    async fn command(&self, command: SessionCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<bool>) -> SessionCommand,
    ) -> Result<bool, TransportError> {
        let (reply, answer) = oneshot::channel();
        self.command(build(reply)).await?;
        answer.await.map_err(|_| TransportError::Closed)
    }
}

pub struct Session;

impl Session {
    /// Start dispatching on a channel. Events about every transfer on it come
    /// out of the returned receiver, which must be drained.
    pub fn spawn<T, S>(
        transport: T,
        inbox: S,
        config: EngineConfig,
        keys: SessionKeys,
    ) -> (SessionHandle, mpsc::Receiver<TransferEvent>)
    where
        T: Transport + 'static,
        S: FrameSource + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let registry: Registry = Arc::default();

        let dispatcher = Dispatcher {
            shared: Shared {
                transport: Arc::new(transport),
                observer: event_tx,
                config,
                keys,
            },
            inbox,
            registry: registry.clone(),
            receiving: HashMap::new(),
            sending: HashMap::new(),
            tasks: JoinSet::new(),
            decode_errors: 0,
        };
        tokio::spawn(dispatcher.run(command_rx));

        let handle = SessionHandle {
            commands: command_tx,
            registry,
        };
        (handle, event_rx)
    }
}

/// Read-only state every step needs
struct Shared<T> {
    transport: Arc<T>,
    observer: mpsc::Sender<TransferEvent>,
    config: EngineConfig,
    keys: SessionKeys,
}

impl<T: Transport> Shared<T> {
    fn receive_ctx(&self) -> ReceiveContext<'_, T> {
        ReceiveContext {
            transport: self.transport.as_ref(),
            observer: &self.observer,
            options: &self.config.receive,
            keys: self.keys.local.as_ref(),
            progress_step: self.config.session.progress_step,
        }
    }
}

struct OutboundRoute {
    events: mpsc::Sender<ReceiveEvent>,
    stop: CancellationToken,
}

#[derive(Debug)]
enum Teardown {
    Shutdown,
    ChannelClosed,
    Transport(TransportError),
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Shutdown => write!(f, "shut down"),
            Teardown::ChannelClosed => write!(f, "channel closed"),
            Teardown::Transport(err) => write!(f, "{}", err),
        }
    }
}

struct Dispatcher<T, S> {
    shared: Shared<T>,
    inbox: S,
    registry: Registry,
    receiving: HashMap<String, ReceivingFile>,
    sending: HashMap<String, OutboundRoute>,
    tasks: JoinSet<(String, FileStatus)>,
    decode_errors: usize,
}

impl<T, S> Dispatcher<T, S>
where
    T: Transport + 'static,
    S: FrameSource,
{
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut stall_check = tokio::time::interval(STALL_CHECK_INTERVAL);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        let reason = loop {
            tokio::select! {
                frame = self.inbox.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = self.on_frame(frame).await {
                            break Teardown::Transport(err);
                        }
                    }
                    None => break Teardown::ChannelClosed,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Shutdown) => break Teardown::Shutdown,
                    Some(command) => self.on_command(command).await,
                    // handles gone; keep serving the peer
                    None => commands_open = false,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task_done(joined);
                }
                _ = stall_check.tick() => self.check_stalls().await,
            }
        };
        self.teardown(reason).await;
    }

    async fn on_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => {
                self.decode_errors = 0;
                envelope
            }
            Err(err) => {
                self.decode_errors += 1;
                tracing::warn!(error = %err, streak = self.decode_errors, "Dropping malformed frame");
                let limit = self.shared.config.session.max_consecutive_decode_errors.max(1);
                if self.decode_errors >= limit {
                    return Err(TransportError::Corrupted(self.decode_errors));
                }
                return Ok(());
            }
        };

        match envelope.payload {
            Payload::Event(event) => self.route_event(&envelope.id, event),
            Payload::MetaData(meta) => self.on_metadata(envelope.id, meta).await,
            Payload::Chunk(data) => self.on_chunk(&envelope.id, data).await,
        }
        Ok(())
    }

    fn route_event(&mut self, id: &str, event: ReceiveEvent) {
        let Some(route) = self.sending.get(id) else {
            tracing::warn!(id, ?event, "Receiver event for unknown transfer");
            return;
        };
        match route.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(id, ?event, "Outbound transfer not keeping up, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(id, ?event, "Event for finished transfer");
            }
        }
    }

    async fn on_metadata(&mut self, id: String, meta: MetaData) {
        if let Some(existing) = self.receiving.get(&id) {
            if !existing.status().is_terminal() {
                tracing::warn!(id = %id, "Ignoring metadata for a transfer already in flight");
                return;
            }
        }

        let (mut file, detail) =
            ReceivingFile::new(id.clone(), meta, self.shared.config.session.progress_step);
        self.registry
            .write()
            .await
            .insert((Direction::Receiving, id.clone()), detail);
        file.on_metadata(&self.shared.receive_ctx()).await;
        self.receiving.insert(id, file);
    }

    async fn on_chunk(&mut self, id: &str, data: Bytes) {
        let ctx = self.shared.receive_ctx();
        match self.receiving.get_mut(id) {
            Some(file) => file.on_chunk(&ctx, data).await,
            None => tracing::warn!(id, len = data.len(), "Chunk for unknown transfer"),
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        let ctx = self.shared.receive_ctx();
        match command {
            SessionCommand::Send { id, source, reply } => {
                let (events_tx, events_rx) = mpsc::channel(ROUTE_CAPACITY);
                let stop = CancellationToken::new();
                let meta = MetaData {
                    name: source.name(),
                    ..MetaData::default()
                };
                let (detail_tx, detail_rx) =
                    watch::channel(FileDetail::new(id.clone(), Direction::Sending, meta));
                self.registry
                    .write()
                    .await
                    .insert((Direction::Sending, id.clone()), detail_rx);
                self.sending.insert(
                    id.clone(),
                    OutboundRoute {
                        events: events_tx,
                        stop: stop.clone(),
                    },
                );

                let transfer = OutboundTransfer {
                    id: id.clone(),
                    transport: self.shared.transport.clone(),
                    options: self.shared.config.send.clone(),
                    progress_step: self.shared.config.session.progress_step,
                    peer_key: self.shared.keys.peer.clone(),
                    events: events_rx,
                    observer: self.shared.observer.clone(),
                    stop,
                    detail: detail_tx,
                };
                tracing::debug!(id = %id, name = %source.name(), "Queued outbound file");
                self.tasks.spawn(async move {
                    let status = transfer.run(source).await;
                    (id, status)
                });
                let _ = reply.send(());
            }
            SessionCommand::Accept { id, reply } => {
                let accepted = match self.receiving.get_mut(&id) {
                    Some(file) => file.accept(&ctx).await,
                    None => false,
                };
                let _ = reply.send(accepted);
            }
            SessionCommand::Reject { id, reply } => {
                let rejected = match self.receiving.get_mut(&id) {
                    Some(file) => file.reject(&ctx).await,
                    None => false,
                };
                let _ = reply.send(rejected);
            }
            SessionCommand::Cancel { id, reply } => {
                let cancelled = if let Some(route) = self.sending.get(&id) {
                    route.stop.cancel();
                    true
                } else if let Some(file) = self.receiving.get_mut(&id) {
                    file.cancel(&ctx).await
                } else {
                    false
                };
                let _ = reply.send(cancelled);
            }
            SessionCommand::Forget { id, reply } => {
                let mut forgotten = false;
                let mut registry = self.registry.write().await;
                for direction in [Direction::Sending, Direction::Receiving] {
                    let key = (direction, id.clone());
                    let finished = registry
                        .get(&key)
                        .is_some_and(|rx| rx.borrow().status.is_terminal());
                    if finished {
                        registry.remove(&key);
                        forgotten = true;
                    }
                }
                drop(registry);
                if self
                    .receiving
                    .get(&id)
                    .is_some_and(|file| file.status().is_terminal())
                {
                    self.receiving.remove(&id);
                }
                if forgotten {
                    tracing::debug!(id = %id, "Forgot finished transfer");
                }
                let _ = reply.send(forgotten);
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn on_task_done(&mut self, joined: Result<(String, FileStatus), JoinError>) {
        match joined {
            Ok((id, status)) => {
                self.sending.remove(&id);
                tracing::debug!(id = %id, ?status, "Outbound transfer finished");
            }
            Err(err) => tracing::error!("Outbound transfer task failed: {}", err),
        }
    }

    async fn check_stalls(&mut self) {
        let timeout = self.shared.config.session.stall_timeout();
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        let ctx = self.shared.receive_ctx();
        for file in self.receiving.values_mut() {
            if file.is_stalled(now, timeout) {
                tracing::warn!(received = file.received(), "No data within stall timeout");
                file.on_stall(&ctx, timeout).await;
            }
        }
    }

    async fn teardown(mut self, reason: Teardown) {
        let in_flight = self.sending.len()
            + self
                .receiving
                .values()
                .filter(|f| !f.status().is_terminal())
                .count();
        match &reason {
            Teardown::Shutdown => tracing::info!(in_flight, "Session shutting down"),
            other => tracing::warn!(in_flight, reason = %other, "Session lost its channel"),
        }

        let ctx = self.shared.receive_ctx();
        for file in self.receiving.values_mut() {
            match reason {
                Teardown::Shutdown => {
                    file.cancel(&ctx).await;
                }
                _ => file.on_connection_lost(&ctx).await,
            }
        }

        // Outbound transfers see their event route close and abort with
        // "connection lost"; on shutdown they are cancelled instead.
        for route in self.sending.values() {
            if matches!(reason, Teardown::Shutdown) {
                route.stop.cancel();
            }
        }
        self.sending.clear();
        while let Some(joined) = self.tasks.join_next().await {
            self.on_task_done(joined);
        }

        let _ = self
            .shared
            .observer
            .send(TransferEvent::SessionClosed {
                reason: reason.to_string(),
            })
            .await;
    }
}
