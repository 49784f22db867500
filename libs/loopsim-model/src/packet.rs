//! Framed packet codec
//!
//! One packet per connection, framed as `<type>:<len>:<payload>` where
//! `<type>` is a single ASCII character, `<len>` is the decimal byte
//! length of the payload, and the payload is a JSON object:
//!
//! ```text
//! d:79:{"time":1700000000.25,"data":[{"chType":"ao","gpio_str":"GPIO13","val":12.0,...}]}
//! ```
//!
//! The decoder reads the header byte-wise after an initial 4-byte slice
//! and then exactly `<len>` payload bytes, so it can never consume bytes
//! belonging to a following frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::entry::{epoch_now, DataEntry, ErrorEntry};

/// Normal data batch.
pub const MSG_TYPE_DATA: char = 'd';
/// Write/poll request carrying no data entries.
pub const MSG_TYPE_WRITE_REQUEST: char = 'w';

/// Payload size guard: a batch is at most a few hundred entries, so a
/// multi-megabyte length field means a garbled header.
const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Codec error type
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame header: {0}")]
    Header(String),

    #[error("Unsupported message type '{0}'")]
    MessageType(char),

    #[error("Payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type alias for the codec
pub type Result<T> = std::result::Result<T, PacketError>;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    time: f64,
    data: Vec<DataEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ErrorEntry>,
}

/// One framed batch of entries and errors: the atomic unit of exchange
/// on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub msg_type: char,
    /// Batch timestamp; stamped with the current time at encode when the
    /// producer left it blank.
    pub time: Option<f64>,
    pub entries: Vec<DataEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl DataPacket {
    /// Data batch with no batch timestamp (stamped at encode).
    pub fn data(entries: Vec<DataEntry>) -> Self {
        Self {
            msg_type: MSG_TYPE_DATA,
            time: None,
            entries,
            errors: Vec::new(),
        }
    }

    /// Data batch carrying both readings and fault reports.
    pub fn reply(entries: Vec<DataEntry>, errors: Vec<ErrorEntry>) -> Self {
        Self {
            msg_type: MSG_TYPE_DATA,
            time: None,
            entries,
            errors,
        }
    }

    /// Empty write/poll request.
    pub fn write_request() -> Self {
        Self {
            msg_type: MSG_TYPE_WRITE_REQUEST,
            time: None,
            entries: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Encode into frame bytes ready for a single socket write.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = Payload {
            time: self.time.unwrap_or_else(epoch_now),
            data: self.entries.clone(),
            errors: self.errors.clone(),
        };
        let body = serde_json::to_string(&payload)?;
        Ok(format!("{}:{}:{}", self.msg_type, body.len(), body).into_bytes())
    }

    /// Decode exactly one frame from `reader`.
    ///
    /// An end-of-stream before the initial 4 header bytes decodes as an
    /// empty `d` batch; the node treats that the same as an explicit
    /// write request (poll all inputs).
    pub async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut head).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(Self::data(Vec::new()));
            }
            return Err(e.into());
        }

        let msg_type = head[0] as char;
        if msg_type != MSG_TYPE_DATA && msg_type != MSG_TYPE_WRITE_REQUEST {
            return Err(PacketError::MessageType(msg_type));
        }
        if head[1] != b':' {
            return Err(PacketError::Header(format!(
                "expected ':' after message type, got 0x{:02x}",
                head[1]
            )));
        }

        // Length digits start at byte 2. A single-digit length puts the
        // second ':' at byte 3; otherwise keep reading one byte at a
        // time until the delimiter so the payload is never overshot.
        let mut digits = Vec::with_capacity(8);
        let mut terminated = false;
        for &b in &head[2..] {
            if b == b':' {
                terminated = true;
                break;
            }
            digits.push(b);
        }
        while !terminated {
            let b = reader.read_u8().await?;
            if b == b':' {
                terminated = true;
            } else {
                digits.push(b);
                if digits.len() > 10 {
                    return Err(PacketError::Header(
                        "length field longer than 10 digits".to_string(),
                    ));
                }
            }
        }

        let len_text = std::str::from_utf8(&digits)
            .map_err(|_| PacketError::Header("length field is not ASCII".to_string()))?;
        let payload_len: usize = len_text.parse().map_err(|_| {
            PacketError::Header(format!(
                "expected packet length as integer, got `{len_text}`"
            ))
        })?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(PacketError::Header(format!(
                "payload length {payload_len} exceeds limit"
            )));
        }

        let mut body = vec![0u8; payload_len];
        reader.read_exact(&mut body).await?;

        let payload: Payload = serde_json::from_slice(&body)?;
        Ok(Self {
            msg_type,
            time: Some(payload.time),
            entries: payload.data,
            errors: payload.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryValue, Severity, SignalKind};

    fn sample_packet() -> DataPacket {
        DataPacket {
            msg_type: MSG_TYPE_DATA,
            time: Some(1700000000.125),
            entries: vec![
                DataEntry::new(SignalKind::Ao, "GPIO13", 12.0, 1700000000.125),
                DataEntry::new(SignalKind::Ai, "GPIO5", 8.0, 1700000001.375),
                DataEntry::new(SignalKind::Do, "GPIO6", EntryValue::Nak, 1700000002.5),
            ],
            errors: vec![ErrorEntry::new(
                "ao",
                Severity::High,
                "Loop error detected:GPIO13",
            )],
        }
    }

    #[tokio::test]
    async fn encode_decode_round_trip() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = DataPacket::decode(&mut cursor).await.unwrap();

        assert_eq!(decoded.msg_type, MSG_TYPE_DATA);
        assert_eq!(decoded.entries, packet.entries);
        assert_eq!(decoded.errors.len(), 1);
        // Millisecond timestamps must survive the trip.
        assert_eq!(decoded.time, Some(1700000000.125));
    }

    #[tokio::test]
    async fn frame_layout_matches_wire_contract() {
        let packet = DataPacket {
            msg_type: MSG_TYPE_DATA,
            time: Some(1.0),
            entries: vec![DataEntry::new(SignalKind::Di, "GPIO16", 0.0, 2.0)],
            errors: Vec::new(),
        };
        let bytes = packet.encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        let mut parts = text.splitn(3, ':');
        assert_eq!(parts.next(), Some("d"));
        let len: usize = parts.next().unwrap().parse().unwrap();
        let body = parts.next().unwrap();
        assert_eq!(body.len(), len);
        assert!(body.starts_with('{'));
    }

    #[tokio::test]
    async fn errors_key_is_omitted_when_empty() {
        let packet = DataPacket::data(vec![DataEntry::new(SignalKind::Do, "GPIO6", 1.0, 3.0)]);
        let text = String::from_utf8(packet.encode().unwrap()).unwrap();
        assert!(!text.contains("errors"));
    }

    #[tokio::test]
    async fn short_stream_decodes_as_empty_batch() {
        let mut cursor = std::io::Cursor::new(b"d:".to_vec());
        let decoded = DataPacket::decode(&mut cursor).await.unwrap();
        assert_eq!(decoded.msg_type, MSG_TYPE_DATA);
        assert!(decoded.entries.is_empty());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_io_error() {
        let mut cursor = std::io::Cursor::new(b"d:5:{\"ti".to_vec());
        // Header says 5 payload bytes but the stream ends after 4: the
        // short read must surface as an error, never as a batch.
        match DataPacket::decode(&mut cursor).await {
            Err(PacketError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
            },
            other => panic!("expected IO error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multi_digit_length_is_read_without_overshoot() {
        let packet = sample_packet();
        let mut bytes = packet.encode().unwrap();
        // Append a trailing sentinel; the decoder must not consume it.
        bytes.extend_from_slice(b"XYZ");
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = DataPacket::decode(&mut cursor).await.unwrap();
        assert_eq!(decoded.entries.len(), 3);

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"XYZ");
    }

    #[tokio::test]
    async fn garbage_message_type_is_rejected() {
        let mut cursor = std::io::Cursor::new(b"x:2:{}".to_vec());
        match DataPacket::decode(&mut cursor).await {
            Err(PacketError::MessageType('x')) => {},
            other => panic!("expected message type error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_numeric_length_is_rejected() {
        let mut cursor = std::io::Cursor::new(b"d:ab:{}".to_vec());
        match DataPacket::decode(&mut cursor).await {
            Err(PacketError::Header(msg)) => assert!(msg.contains("ab")),
            other => panic!("expected header error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_request_round_trips() {
        let bytes = DataPacket::write_request().encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = DataPacket::decode(&mut cursor).await.unwrap();
        assert_eq!(decoded.msg_type, MSG_TYPE_WRITE_REQUEST);
        assert!(decoded.entries.is_empty());
    }
}
