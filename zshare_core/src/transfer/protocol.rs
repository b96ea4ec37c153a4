use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};

use super::transport::Transport;
use crate::error::{DecodeError, TransportError};

const FIELD_ID: u32 = 1;
const FIELD_CHUNK: u32 = 3;

/// Description of one file, sent as the first frame of a transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub name: String,
    pub size: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub mime: String,
    /// Wrapped symmetric key, empty when the transfer is not encrypted
    #[serde(skip)]
    pub key: Vec<u8>,
}

/// Control message from the receiving side back to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEvent {
    Accept,
    Reject,
    ReceivedChunk,
    ValidateError,
    /// A value this build does not know, kept so it re-encodes unchanged
    Unrecognized(i32),
}

impl ReceiveEvent {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ReceiveEvent::Accept,
            1 => ReceiveEvent::Reject,
            2 => ReceiveEvent::ReceivedChunk,
            3 => ReceiveEvent::ValidateError,
            other => ReceiveEvent::Unrecognized(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ReceiveEvent::Accept => 0,
            ReceiveEvent::Reject => 1,
            ReceiveEvent::ReceivedChunk => 2,
            ReceiveEvent::ValidateError => 3,
            ReceiveEvent::Unrecognized(v) => v,
        }
    }
}

/// Exactly one payload per frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    MetaData(MetaData),
    Chunk(Bytes),
    Event(ReceiveEvent),
}

/// One wire frame, keyed by the file id it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub payload: Payload,
}

// Wire messages. `size` is declared int64 so that a negative int32 from an
// older peer, which arrives sign-extended, decodes as negative.

#[derive(Clone, PartialEq, Message)]
struct WireEnvelope {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(oneof = "WirePayload", tags = "2, 3, 4")]
    payload: Option<WirePayload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
enum WirePayload {
    #[prost(message, tag = "2")]
    MetaData(WireMetaData),
    #[prost(bytes = "bytes", tag = "3")]
    Chunk(Bytes),
    #[prost(int32, tag = "4")]
    ReceiveEvent(i32),
}

#[derive(Clone, PartialEq, Message)]
struct WireMetaData {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(int64, tag = "2")]
    size: i64,
    #[prost(string, tag = "3")]
    r#type: String,
    #[prost(bytes = "vec", tag = "4")]
    key: Vec<u8>,
}

impl WireMetaData {
    fn from_meta(meta: &MetaData) -> Self {
        Self {
            name: meta.name.clone(),
            size: meta.size as i64,
            r#type: meta.mime.clone(),
            key: meta.key.clone(),
        }
    }

    fn into_meta(self) -> Result<MetaData, DecodeError> {
        let size = u64::try_from(self.size).map_err(|_| DecodeError::NegativeSize(self.size))?;
        Ok(MetaData {
            name: self.name,
            size,
            mime: self.r#type,
            key: self.key,
        })
    }
}

impl Envelope {
    pub fn meta_data(id: impl Into<String>, meta: MetaData) -> Self {
        Self {
            id: id.into(),
            payload: Payload::MetaData(meta),
        }
    }

    pub fn chunk(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: Payload::Chunk(data.into()),
        }
    }

    pub fn event(id: impl Into<String>, event: ReceiveEvent) -> Self {
        Self {
            id: id.into(),
            payload: Payload::Event(event),
        }
    }

    fn to_wire(&self) -> WireEnvelope {
        let payload = match &self.payload {
            Payload::MetaData(meta) => WirePayload::MetaData(WireMetaData::from_meta(meta)),
            Payload::Chunk(data) => WirePayload::Chunk(data.clone()),
            Payload::Event(event) => WirePayload::ReceiveEvent(event.as_i32()),
        };
        WireEnvelope {
            id: self.id.clone(),
            payload: Some(payload),
        }
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self, DecodeError> {
        if wire.id.is_empty() {
            return Err(DecodeError::MissingId);
        }
        let payload = match wire.payload.ok_or(DecodeError::MissingPayload)? {
            WirePayload::MetaData(meta) => Payload::MetaData(meta.into_meta()?),
            WirePayload::Chunk(data) => Payload::Chunk(data),
            WirePayload::ReceiveEvent(value) => Payload::Event(ReceiveEvent::from_i32(value)),
        };
        Ok(Self {
            id: wire.id,
            payload,
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.to_wire().encoded_len()
    }

    /// Payload fields are always written, so ACCEPT (enum value 0) and an
    /// empty chunk still reach the peer.
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_wire().encode_to_vec())
    }

    /// Decode one frame. Chunk payloads share memory with `frame`; unknown
    /// fields are skipped. When a frame repeats the payload, the last one wins.
    pub fn decode(frame: Bytes) -> Result<Self, DecodeError> {
        Self::from_wire(WireEnvelope::decode(frame)?)
    }
}

/// Frame and send one envelope
pub async fn send_msg<T: Transport + ?Sized>(
    transport: &T,
    msg: &Envelope,
) -> Result<(), TransportError> {
    transport.send(msg.encode()).await
}

/// Size of the frame header wrapped around a chunk of `chunk_len` bytes
pub fn chunk_overhead(id: &str, chunk_len: usize) -> usize {
    use prost::encoding::{encoded_len_varint, key_len};

    key_len(FIELD_ID)
        + encoded_len_varint(id.len() as u64)
        + id.len()
        + key_len(FIELD_CHUNK)
        + encoded_len_varint(chunk_len as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> MetaData {
        MetaData {
            name: "report.pdf".to_string(),
            size: 100_000,
            mime: "application/pdf".to_string(),
            key: vec![7u8; 128],
        }
    }

    #[test]
    fn test_roundtrip_each_payload() {
        let frames = [
            Envelope::meta_data("a1", sample_meta()),
            Envelope::meta_data("a2", MetaData::default()),
            Envelope::chunk("a1", Bytes::from_static(b"hello")),
            Envelope::chunk("a1", Bytes::new()),
            Envelope::event("a1", ReceiveEvent::Accept),
            Envelope::event("a1", ReceiveEvent::ValidateError),
            Envelope::event("a1", ReceiveEvent::Unrecognized(-1)),
        ];
        for frame in frames {
            let encoded = frame.encode();
            assert_eq!(encoded.len(), frame.encoded_len());
            assert_eq!(Envelope::decode(encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_matches_reference_encoding() {
        // id "x", receiveEvent REJECT
        let frame = Envelope::event("x", ReceiveEvent::Reject);
        assert_eq!(&frame.encode()[..], &[0x0a, 0x01, b'x', 0x20, 0x01]);

        // id "f", metaData { name "a", size 2000 }
        let meta = MetaData {
            name: "a".to_string(),
            size: 2000,
            ..Default::default()
        };
        let frame = Envelope::meta_data("f", meta);
        assert_eq!(
            &frame.encode()[..],
            &[0x0a, 0x01, b'f', 0x12, 0x06, 0x0a, 0x01, b'a', 0x10, 0xd0, 0x0f]
        );
    }

    #[test]
    fn test_accept_event_is_still_encoded() {
        let encoded = Envelope::event("id", ReceiveEvent::Accept).encode();
        assert_eq!(&encoded[..], &[0x0a, 0x02, b'i', b'd', 0x20, 0x00]);
        assert_eq!(
            Envelope::decode(encoded).unwrap().payload,
            Payload::Event(ReceiveEvent::Accept)
        );
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let frame = Bytes::from_static(&[
            // field 15, varint 99
            0x78, 0x63, //
            0x0a, 0x03, b'a', b'b', b'c', //
            // field 16, "future"
            0x82, 0x01, 0x06, b'f', b'u', b't', b'u', b'r', b'e', //
            0x1a, 0x04, b'd', b'a', b't', b'a',
        ]);
        let decoded = Envelope::decode(frame).unwrap();
        assert_eq!(decoded, Envelope::chunk("abc", Bytes::from_static(b"data")));
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(
            Envelope::decode(Bytes::from_static(&[0x0a, 0x01, b'x'])),
            Err(DecodeError::MissingPayload)
        );
        assert_eq!(
            Envelope::decode(Envelope::chunk("", Bytes::from_static(b"z")).encode()),
            Err(DecodeError::MissingId)
        );

        let full = Envelope::chunk("abc", Bytes::from_static(b"0123456789")).encode();
        let truncated = full.slice(..full.len() - 3);
        assert!(matches!(
            Envelope::decode(truncated),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_repeated_payload_keeps_the_last() {
        // id "x", chunk "1", then receiveEvent ACCEPT
        let frame = Bytes::from_static(&[0x0a, 0x01, b'x', 0x1a, 0x01, b'1', 0x20, 0x00]);
        assert_eq!(
            Envelope::decode(frame).unwrap(),
            Envelope::event("x", ReceiveEvent::Accept)
        );
    }

    #[test]
    fn test_negative_size_rejected() {
        let wire = WireEnvelope {
            id: "x".to_string(),
            payload: Some(WirePayload::MetaData(WireMetaData {
                size: -5,
                ..Default::default()
            })),
        };
        let encoded = Bytes::from(wire.encode_to_vec());
        // a negative int32 is sign-extended to ten bytes
        assert_eq!(encoded.len(), 3 + 2 + 11);
        assert_eq!(
            Envelope::decode(encoded),
            Err(DecodeError::NegativeSize(-5))
        );
    }

    #[test]
    fn test_chunk_overhead() {
        let frame = Envelope::chunk("some-id", vec![0u8; 32 * 1024]);
        assert_eq!(frame.encoded_len(), 32 * 1024 + chunk_overhead("some-id", 32 * 1024));
    }
}
