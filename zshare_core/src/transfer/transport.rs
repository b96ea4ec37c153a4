//! The channel a session rides on.
//!
//! A browser data channel is one implementation; [`memory_channel`] is
//! another, used by the tests and the loopback demo.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::constants::DRAIN_POLL_INTERVAL_MS;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Outbound half of an ordered, reliable channel
pub trait Transport: Send + Sync {
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Bytes handed to `send` that have not left the local buffer yet
    fn buffered_amount(&self) -> usize;

    fn state(&self) -> ChannelState;
}

/// Inbound half; `None` means the channel is gone
pub trait FrameSource: Send {
    fn recv(&mut self) -> impl Future<Output = Option<Bytes>> + Send;
}

impl FrameSource for mpsc::Receiver<Bytes> {
    async fn recv(&mut self) -> Option<Bytes> {
        mpsc::Receiver::recv(self).await
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).send(frame)
    }

    fn buffered_amount(&self) -> usize {
        (**self).buffered_amount()
    }

    fn state(&self) -> ChannelState {
        (**self).state()
    }
}

/// Block until the outbound buffer has room.
///
/// Returns at once while the gauge is at or under `high`. Past that, waits
/// for it to fall to `low` so writes resume in bursts rather than per frame.
pub async fn wait_for_drain<T: Transport + ?Sized>(
    transport: &T,
    high: usize,
    low: usize,
    timeout: Duration,
) -> Result<(), TransportError> {
    if transport.state() == ChannelState::Closed {
        return Err(TransportError::Closed);
    }
    if transport.state() == ChannelState::Open && transport.buffered_amount() <= high {
        return Ok(());
    }

    debug!(
        buffered = transport.buffered_amount(),
        high_watermark = high,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(DRAIN_POLL_INTERVAL_MS);
    loop {
        match transport.state() {
            ChannelState::Closing | ChannelState::Closed => return Err(TransportError::Closed),
            ChannelState::Open if transport.buffered_amount() <= low => return Ok(()),
            _ => {}
        }
        if Instant::now() >= deadline {
            let buffered = transport.buffered_amount();
            warn!(buffered, "Buffer drain timeout");
            return Err(TransportError::DrainTimeout { buffered });
        }
        tokio::time::sleep(poll).await;
    }
}

struct Shared {
    state: AtomicU8,
    closed: Notify,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn close(&self) {
        self.state.store(ChannelState::Closed as u8, Ordering::SeqCst);
        self.closed.notify_waiters();
    }
}

/// In-process transport; the gauge counts bytes the peer has not read yet
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    shared: Arc<Shared>,
}

/// Receiving end paired with the remote [`MemoryTransport`]
pub struct MemoryInbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
    /// Gauge of the transport that feeds this inbox
    buffered: Arc<AtomicUsize>,
    shared: Arc<Shared>,
}

/// Two connected endpoints: whatever one side sends, the other side's inbox yields
pub fn memory_channel() -> ((MemoryTransport, MemoryInbox), (MemoryTransport, MemoryInbox)) {
    let shared = Arc::new(Shared {
        state: AtomicU8::new(ChannelState::Open as u8),
        closed: Notify::new(),
    });
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_gauge = Arc::new(AtomicUsize::new(0));
    let b_gauge = Arc::new(AtomicUsize::new(0));

    let a = (
        MemoryTransport {
            tx: a_tx,
            buffered: a_gauge.clone(),
            shared: shared.clone(),
        },
        MemoryInbox {
            rx: a_rx,
            buffered: b_gauge.clone(),
            shared: shared.clone(),
        },
    );
    let b = (
        MemoryTransport {
            tx: b_tx,
            buffered: b_gauge,
            shared: shared.clone(),
        },
        MemoryInbox {
            rx: b_rx,
            buffered: a_gauge,
            shared,
        },
    );
    (a, b)
}

impl MemoryTransport {
    /// Close both directions
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.shared.state() != ChannelState::Open {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn state(&self) -> ChannelState {
        self.shared.state()
    }
}

impl MemoryInbox {
    fn take(&self, frame: Bytes) -> Bytes {
        self.buffered.fetch_sub(frame.len(), Ordering::SeqCst);
        frame
    }
}

impl FrameSource for MemoryInbox {
    /// Frames queued before the channel closed are still delivered
    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            let closed = self.shared.closed.notified();
            if self.shared.state() == ChannelState::Closed {
                return self.rx.try_recv().ok().map(|frame| self.take(frame));
            }
            tokio::select! {
                frame = self.rx.recv() => return frame.map(|frame| self.take(frame)),
                _ = closed => {}
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shared.close();
    }
}
