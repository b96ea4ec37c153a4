//! Helpers shared by the integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use zshare_core::error::TransportError;
use zshare_core::transfer::transport::{MemoryInbox, MemoryTransport};
use zshare_core::{
    ChannelState, EngineConfig, Envelope, FrameSource, Payload, Session, SessionHandle,
    SessionKeys, TransferEvent, Transport, memory_channel,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    Bytes::from(data)
}

/// Wraps a transport and watches the chunk frames going through it
pub struct TapTransport<T> {
    inner: T,
    chunks: Arc<AtomicUsize>,
    tamper_chunk: Option<usize>,
    pause_after: Option<usize>,
    paused: Option<mpsc::UnboundedSender<()>>,
    resume: Arc<Notify>,
}

impl<T: Transport> TapTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            chunks: Arc::new(AtomicUsize::new(0)),
            tamper_chunk: None,
            pause_after: None,
            paused: None,
            resume: Arc::new(Notify::new()),
        }
    }

    /// Chunk frames sent so far
    pub fn chunk_counter(&self) -> Arc<AtomicUsize> {
        self.chunks.clone()
    }

    /// Flip the last byte of the n-th chunk frame (1-based)
    pub fn tamper_chunk(mut self, n: usize) -> Self {
        self.tamper_chunk = Some(n);
        self
    }

    /// After the n-th chunk frame is out, report on `paused` and hold the
    /// sender until `resume` is notified
    pub fn pause_after(
        mut self,
        n: usize,
        paused: mpsc::UnboundedSender<()>,
        resume: Arc<Notify>,
    ) -> Self {
        self.pause_after = Some(n);
        self.paused = Some(paused);
        self.resume = resume;
        self
    }
}

impl<T: Transport> Transport for TapTransport<T> {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let is_chunk = matches!(
            Envelope::decode(frame.clone()).map(|e| e.payload),
            Ok(Payload::Chunk(_))
        );
        if !is_chunk {
            return self.inner.send(frame).await;
        }

        let n = self.chunks.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = if self.tamper_chunk == Some(n) {
            let mut raw = frame.to_vec();
            if let Some(last) = raw.last_mut() {
                *last ^= 0x01;
            }
            Bytes::from(raw)
        } else {
            frame
        };
        self.inner.send(frame).await?;

        if self.pause_after == Some(n) {
            if let Some(paused) = &self.paused {
                let _ = paused.send(());
            }
            self.resume.notified().await;
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount()
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }
}

pub struct Peer {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<TransferEvent>,
}

/// Sender session on one end of a memory channel (behind `tap`), receiver
/// session on the other
pub fn connect<F>(
    sender_config: EngineConfig,
    sender_keys: SessionKeys,
    receiver_config: EngineConfig,
    receiver_keys: SessionKeys,
    tap: F,
) -> (Peer, Peer, Arc<AtomicUsize>)
where
    F: FnOnce(TapTransport<MemoryTransport>) -> TapTransport<MemoryTransport>,
{
    let ((a_tx, a_rx), (b_tx, b_rx)) = memory_channel();
    let tapped = tap(TapTransport::new(a_tx));
    let chunks = tapped.chunk_counter();

    let (handle, events) = Session::spawn(tapped, a_rx, sender_config, sender_keys);
    let sender = Peer { handle, events };
    let (handle, events) = Session::spawn(b_tx, b_rx, receiver_config, receiver_keys);
    let receiver = Peer { handle, events };
    (sender, receiver, chunks)
}

/// Skip events until one matches
pub async fn next_matching<F>(events: &mut mpsc::Receiver<TransferEvent>, mut pred: F) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Hand-driven peer speaking raw frames
pub struct RawPeer {
    pub tx: MemoryTransport,
    pub rx: MemoryInbox,
}

impl RawPeer {
    pub async fn send(&self, envelope: Envelope) {
        self.tx.send(envelope.encode()).await.expect("raw send");
    }

    pub async fn send_bytes(&self, frame: &'static [u8]) {
        self.tx.send(Bytes::from_static(frame)).await.expect("raw send");
    }

    pub async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        Envelope::decode(frame).expect("session sent a malformed frame")
    }
}

/// A session on one end, a raw peer on the other
pub fn session_with_raw_peer(config: EngineConfig, keys: SessionKeys) -> (Peer, RawPeer) {
    let ((a_tx, a_rx), (b_tx, b_rx)) = memory_channel();
    let (handle, events) = Session::spawn(a_tx, a_rx, config, keys);
    (Peer { handle, events }, RawPeer { tx: b_tx, rx: b_rx })
}
