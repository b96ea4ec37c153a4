//! A hand-driven peer sending frames a well-behaved sender never would.

mod common;

use bytes::Bytes;
use common::{RawPeer, init_tracing, next_matching, random_bytes, session_with_raw_peer};
use zshare_core::{
    AbortCause, EngineConfig, Envelope, FileSource, FileStatus, FrameSource, MetaData, Payload,
    ReceiveEvent, SessionKeys, TransferEvent,
};

/// Length prefix runs past the end of the frame
const GARBAGE: &[u8] = &[0x0a, 0x05, b'x'];

fn receiving(auto_accept: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.receive.auto_accept = auto_accept;
    config
}

fn meta(name: &str, size: u64) -> MetaData {
    MetaData {
        name: name.to_string(),
        size,
        mime: "text/plain".to_string(),
        key: Vec::new(),
    }
}

async fn expect_event(raw: &mut RawPeer, id: &str, event: ReceiveEvent) {
    assert_eq!(raw.recv().await, Envelope::event(id, event));
}

#[tokio::test]
async fn test_malformed_frame_streak_closes_session() {
    init_tracing();
    let (mut peer, raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    for _ in 0..8 {
        raw.send_bytes(GARBAGE).await;
    }

    let TransferEvent::SessionClosed { reason } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::SessionClosed { .. })).await
    else {
        unreachable!()
    };
    assert!(reason.contains("malformed"), "unexpected reason: {}", reason);
    assert!(peer.handle.accept("anything").await.is_err());
}

#[tokio::test]
async fn test_valid_frame_resets_malformed_streak() {
    init_tracing();
    let (mut peer, raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    for _ in 0..7 {
        raw.send_bytes(GARBAGE).await;
    }
    raw.send(Envelope::event("nobody", ReceiveEvent::Accept)).await;
    for _ in 0..7 {
        raw.send_bytes(GARBAGE).await;
    }
    raw.send(Envelope::meta_data("fresh", meta("fresh.txt", 10))).await;

    let event = next_matching(&mut peer.events, |_| true).await;
    let TransferEvent::Incoming(detail) = event else {
        panic!("session did not survive: {:?}", event);
    };
    assert_eq!(detail.id, "fresh");
}

#[tokio::test]
async fn test_chunk_before_accept_is_refused() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    raw.send(Envelope::meta_data("f1", meta("early.txt", 10))).await;
    next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Incoming(_))).await;

    raw.send(Envelope::chunk("f1", Bytes::from_static(b"0123456789"))).await;
    expect_event(&mut raw, "f1", ReceiveEvent::ValidateError).await;

    let TransferEvent::Aborted { detail, cause } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert!(matches!(cause, AbortCause::Protocol(_)));
    assert_eq!(detail.transferred, 0);
    // too late to change our mind
    assert!(!peer.handle.accept("f1").await.unwrap());
}

#[tokio::test]
async fn test_overrun_is_refused() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(true), SessionKeys::default());

    raw.send(Envelope::meta_data("f2", meta("short.txt", 4))).await;
    expect_event(&mut raw, "f2", ReceiveEvent::Accept).await;

    raw.send(Envelope::chunk("f2", Bytes::from_static(b"12345"))).await;
    expect_event(&mut raw, "f2", ReceiveEvent::ValidateError).await;

    let TransferEvent::Aborted { detail, cause } = next_matching(&mut peer.events, |e| {
        assert!(!matches!(e, TransferEvent::Received(_)));
        matches!(e, TransferEvent::Aborted { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert!(matches!(cause, AbortCause::Protocol(ref msg) if msg.contains("received 5 bytes")));
    assert_eq!(detail.status, FileStatus::Aborted);
}

#[tokio::test]
async fn test_duplicate_metadata_in_flight_is_ignored() {
    init_tracing();
    let (mut peer, raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    raw.send(Envelope::meta_data("dup", meta("one.txt", 10))).await;
    raw.send(Envelope::meta_data("dup", meta("two.txt", 20))).await;
    raw.send(Envelope::meta_data("fresh", meta("fresh.txt", 1))).await;

    let TransferEvent::Incoming(first) = next_matching(&mut peer.events, |_| true).await else {
        panic!("expected an offer");
    };
    assert_eq!(first.meta.name, "one.txt");
    let TransferEvent::Incoming(second) = next_matching(&mut peer.events, |_| true).await else {
        panic!("expected an offer");
    };
    assert_eq!(second.id, "fresh");

    let kept = peer.handle.snapshot("dup").await.unwrap();
    assert_eq!(kept.meta.size, 10);
}

#[tokio::test]
async fn test_stray_chunks_are_dropped() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(true), SessionKeys::default());

    raw.send(Envelope::chunk("ghost", Bytes::from_static(b"boo"))).await;
    raw.send(Envelope::meta_data("f3", meta("abc.txt", 3))).await;
    expect_event(&mut raw, "f3", ReceiveEvent::Accept).await;
    raw.send(Envelope::chunk("f3", Bytes::from_static(b"abc"))).await;

    let TransferEvent::Received(file) =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Received(_))).await
    else {
        unreachable!()
    };
    assert_eq!(&file.data[..], b"abc");

    // after success: no reply and no new event
    raw.send(Envelope::chunk("f3", Bytes::from_static(b"zzz"))).await;
    raw.send(Envelope::meta_data("fresh", meta("fresh.txt", 1))).await;
    expect_event(&mut raw, "fresh", ReceiveEvent::Accept).await;

    let event = next_matching(&mut peer.events, |_| true).await;
    assert!(
        matches!(&event, TransferEvent::Accepted { id, .. } if id == "fresh"),
        "unexpected event: {:?}",
        event
    );
    assert_eq!(
        peer.handle.snapshot("f3").await.unwrap().status,
        FileStatus::Success
    );
}

#[tokio::test]
async fn test_reject_notifies_sender() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    raw.send(Envelope::meta_data("f4", meta("unwanted.exe", 10))).await;
    next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Incoming(_))).await;

    assert!(peer.handle.reject("f4").await.unwrap());
    expect_event(&mut raw, "f4", ReceiveEvent::Reject).await;

    next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Rejected { .. })).await;
    let TransferEvent::Aborted { cause, .. } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::Rejected);
    assert!(!peer.handle.reject("f4").await.unwrap());
}

#[tokio::test]
async fn test_cancel_inbound_sends_reject() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(true), SessionKeys::default());

    raw.send(Envelope::meta_data("f5", meta("long.bin", 10))).await;
    expect_event(&mut raw, "f5", ReceiveEvent::Accept).await;
    raw.send(Envelope::chunk("f5", Bytes::from_static(b"0123"))).await;

    assert!(peer.handle.cancel("f5").await.unwrap());
    expect_event(&mut raw, "f5", ReceiveEvent::Reject).await;

    let TransferEvent::Aborted { cause, .. } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::Cancelled);
}

#[tokio::test]
async fn test_lost_channel_aborts_inbound() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(true), SessionKeys::default());

    raw.send(Envelope::meta_data("f6", meta("half.bin", 10))).await;
    expect_event(&mut raw, "f6", ReceiveEvent::Accept).await;
    drop(raw.tx);

    let TransferEvent::Aborted { cause, .. } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::ConnectionLost);
    let TransferEvent::SessionClosed { reason } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::SessionClosed { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(reason, "channel closed");
}

#[tokio::test]
async fn test_chunks_queued_before_close_still_complete() {
    init_tracing();
    let (mut peer, mut raw) = session_with_raw_peer(receiving(true), SessionKeys::default());

    raw.send(Envelope::meta_data("f7", meta("whole.txt", 6))).await;
    expect_event(&mut raw, "f7", ReceiveEvent::Accept).await;
    raw.send(Envelope::chunk("f7", Bytes::from_static(b"abc"))).await;
    raw.send(Envelope::chunk("f7", Bytes::from_static(b"def"))).await;
    drop(raw.tx);

    let TransferEvent::Received(file) = next_matching(&mut peer.events, |e| {
        assert!(!matches!(e, TransferEvent::Aborted { .. }), "aborted: {:?}", e);
        matches!(e, TransferEvent::Received(_))
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(file.data, Bytes::from_static(b"abcdef"));
    next_matching(&mut peer.events, |e| matches!(e, TransferEvent::SessionClosed { .. })).await;
}

#[tokio::test]
async fn test_decisions_on_unknown_ids() {
    init_tracing();
    let (peer, _raw) = session_with_raw_peer(receiving(false), SessionKeys::default());

    assert!(!peer.handle.accept("missing").await.unwrap());
    assert!(!peer.handle.reject("missing").await.unwrap());
    assert!(!peer.handle.cancel("missing").await.unwrap());
    assert!(peer.handle.snapshot("missing").await.is_none());
}

#[tokio::test]
async fn test_sender_stops_on_peer_validation_error() {
    init_tracing();
    let mut config = EngineConfig::default();
    config.send.is_encrypt = false;
    config.send.chunk_size = 1024;
    config.send.buffered_amount_high = 4096;
    config.send.buffered_amount_low = 1024;
    let (mut peer, mut raw) = session_with_raw_peer(config, SessionKeys::default());

    let id = peer
        .handle
        .send_file(FileSource::memory("big.bin", random_bytes(1024 * 1024)))
        .await
        .unwrap();

    let announced = raw.recv().await;
    assert_eq!(announced.id, id);
    let Payload::MetaData(announced) = announced.payload else {
        panic!("first frame must be metadata");
    };
    assert_eq!(announced.size, 1024 * 1024);
    assert!(announced.key.is_empty());

    raw.send(Envelope::event(id.clone(), ReceiveEvent::Accept)).await;
    assert!(matches!(raw.recv().await.payload, Payload::Chunk(_)));
    raw.send(Envelope::event(id.clone(), ReceiveEvent::ValidateError)).await;

    // keep reading so the sender is never held up by back-pressure
    let mut inbox = raw.rx;
    let drain = tokio::spawn(async move { while inbox.recv().await.is_some() {} });

    let TransferEvent::Aborted { detail, cause } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::PeerValidation);
    assert!(detail.transferred < 1024 * 1024);
    drain.abort();
}

#[tokio::test]
async fn test_sender_held_by_backpressure_sees_validate_error() {
    init_tracing();
    let mut config = EngineConfig::default();
    config.send.is_encrypt = false;
    config.send.chunk_size = 1024;
    config.send.buffered_amount_high = 4096;
    config.send.buffered_amount_low = 1024;
    config.send.drain_timeout_secs = 30;
    let (mut peer, mut raw) = session_with_raw_peer(config, SessionKeys::default());

    let id = peer
        .handle
        .send_file(FileSource::memory("stuck.bin", random_bytes(1024 * 1024)))
        .await
        .unwrap();
    assert!(matches!(raw.recv().await.payload, Payload::MetaData(_)));
    raw.send(Envelope::event(id.clone(), ReceiveEvent::Accept)).await;
    assert!(matches!(raw.recv().await.payload, Payload::Chunk(_)));

    // stop reading: the sender fills the buffer and waits for it to drain
    let started = std::time::Instant::now();
    raw.send(Envelope::event(id.clone(), ReceiveEvent::ValidateError)).await;

    let TransferEvent::Aborted { detail, cause } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::PeerValidation);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(detail.transferred <= 8 * 1024);
}

#[tokio::test]
async fn test_sender_rejected_before_accept() {
    init_tracing();
    let mut config = EngineConfig::default();
    config.send.is_encrypt = false;
    let (mut peer, mut raw) = session_with_raw_peer(config, SessionKeys::default());

    let id = peer
        .handle
        .send_file(FileSource::memory("note.txt", random_bytes(10)))
        .await
        .unwrap();
    assert!(matches!(raw.recv().await.payload, Payload::MetaData(_)));
    // unknown event values are skipped while waiting
    raw.send(Envelope::event(id.clone(), ReceiveEvent::Unrecognized(42))).await;
    raw.send(Envelope::event(id.clone(), ReceiveEvent::Reject)).await;

    next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Rejected { .. })).await;
    let TransferEvent::Aborted { cause, .. } =
        next_matching(&mut peer.events, |e| matches!(e, TransferEvent::Aborted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(cause, AbortCause::Rejected);
    assert_eq!(
        peer.handle.snapshot(&id).await.unwrap().error,
        Some(AbortCause::Rejected)
    );
}
