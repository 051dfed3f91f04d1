use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunker;
use crate::error::TransportError;

/// Routing hints carried next to the encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMeta {
    /// Question hash for query traffic (lets hubs correlate replies).
    #[serde(default)]
    pub q_hash: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    1
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            q_hash: None,
            priority: default_priority(),
        }
    }
}

impl PacketMeta {
    /// Meta for query traffic.
    pub fn for_query(q_hash: impl Into<String>) -> Self {
        Self {
            q_hash: Some(q_hash.into()),
            priority: default_priority(),
        }
    }
}

/// One chunk of an encrypted payload exchanged between hubs.
///
/// All chunks of one logical send share `pkt_id` and `total_chunks`.
/// `payload_enc` travels as base64 text in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub pkt_id: String,
    pub src_id: String,
    pub dst_id: String,
    /// Creation time (Unix milliseconds).
    pub timestamp: u64,
    #[serde(with = "base64_bytes")]
    pub payload_enc: Vec<u8>,
    #[serde(default)]
    pub meta: PacketMeta,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default = "default_total_chunks")]
    pub total_chunks: u32,
}

fn default_total_chunks() -> u32 {
    1
}

impl Packet {
    /// Create a single-chunk packet with a fresh `pkt_id`.
    pub fn new(
        src_id: impl Into<String>,
        dst_id: impl Into<String>,
        meta: PacketMeta,
        payload_enc: Vec<u8>,
    ) -> Self {
        Self {
            pkt_id: new_pkt_id(),
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            timestamp: now_ms(),
            payload_enc,
            meta,
            chunk_index: 0,
            total_chunks: 1,
        }
    }

    /// Split `payload_enc` into `max_chunk_size`-bounded packets sharing one `pkt_id`.
    pub fn chunked(
        src_id: &str,
        dst_id: &str,
        meta: PacketMeta,
        payload_enc: &[u8],
        max_chunk_size: usize,
    ) -> Result<Vec<Packet>, TransportError> {
        let chunks = chunker::chunk(payload_enc, max_chunk_size)?;
        let total_chunks = chunks.len() as u32;
        let pkt_id = new_pkt_id();
        let timestamp = now_ms();

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(idx, chunk)| Packet {
                pkt_id: pkt_id.clone(),
                src_id: src_id.to_string(),
                dst_id: dst_id.to_string(),
                timestamp,
                payload_enc: chunk.to_vec(),
                meta: meta.clone(),
                chunk_index: idx as u32,
                total_chunks,
            })
            .collect())
    }

    /// Re-chunk this packet into clones carrying sequential positions.
    ///
    /// Used by the simulator when a single-chunk packet is oversized.
    pub fn split(&self, max_chunk_size: usize) -> Result<Vec<Packet>, TransportError> {
        let chunks = chunker::chunk(&self.payload_enc, max_chunk_size)?;
        let total_chunks = chunks.len() as u32;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let mut clone = self.clone();
                clone.chunk_index = idx as u32;
                clone.total_chunks = total_chunks;
                clone.payload_enc = chunk.to_vec();
                clone
            })
            .collect())
    }

    pub fn is_single_chunk(&self) -> bool {
        self.total_chunks == 1
    }

    /// Unique key for this chunk: `"{pkt_id}:{chunk_index}"`.
    pub fn packet_key(&self) -> String {
        format!("{}:{}", self.pkt_id, self.chunk_index)
    }

    /// Check `0 <= chunk_index < total_chunks` and `total_chunks >= 1`.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(TransportError::InvalidChunkPosition {
                index: self.chunk_index,
                total: self.total_chunks,
            });
        }
        Ok(())
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(data).map_err(Into::into)
    }
}

/// ACK/NAK status used by the simulator and by hubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "NAK")]
    Nak,
}

/// Hub inbound endpoint reply.
///
/// `response_packet` carries an embedded reply (e.g. an authoritative
/// capsule) back through the simulator's downstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubAck {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_packet: Option<Packet>,
    #[serde(default)]
    pub needs_more_chunks: bool,
}

impl HubAck {
    pub fn ack(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ack,
            message: Some(message.into()),
            response_packet: None,
            needs_more_chunks: false,
        }
    }

    pub fn nak(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Nak,
            message: Some(message.into()),
            response_packet: None,
            needs_more_chunks: false,
        }
    }

    /// ACK for a chunk that was buffered without completing its packet.
    pub fn buffered() -> Self {
        Self {
            needs_more_chunks: true,
            ..Self::ack("Chunk buffered")
        }
    }

    /// ACK carrying a reply packet.
    pub fn with_reply(message: impl Into<String>, reply: Packet) -> Self {
        Self {
            response_packet: Some(reply),
            ..Self::ack(message)
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == AckStatus::Ack
    }
}

/// Fresh packet identifier (UUID v4, simple hex form).
pub fn new_pkt_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64
            .decode(text.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packet_is_single_chunk() {
        let pkt = Packet::new("mh1", "main-hub", PacketMeta::default(), vec![1, 2, 3]);
        assert!(pkt.is_single_chunk());
        assert_eq!(pkt.chunk_index, 0);
        assert_eq!(pkt.meta.priority, 1);
        assert_eq!(pkt.packet_key(), format!("{}:0", pkt.pkt_id));
        assert!(pkt.validate().is_ok());
    }

    #[test]
    fn chunked_packets_share_identity() {
        let payload = vec![7u8; 2050];
        let packets =
            Packet::chunked("mh1", "main-hub", PacketMeta::for_query("h"), &payload, 1000).unwrap();

        assert_eq!(packets.len(), 3);
        for (idx, pkt) in packets.iter().enumerate() {
            assert_eq!(pkt.pkt_id, packets[0].pkt_id);
            assert_eq!(pkt.total_chunks, 3);
            assert_eq!(pkt.chunk_index, idx as u32);
            assert_eq!(pkt.meta.q_hash.as_deref(), Some("h"));
        }
        assert_eq!(packets[2].payload_enc.len(), 50);
    }

    #[test]
    fn split_rewrites_positions_only() {
        let pkt = Packet::new("a", "b", PacketMeta::default(), vec![9u8; 300]);
        let parts = pkt.split(128).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.pkt_id == pkt.pkt_id && p.src_id == "a"));
        let joined: Vec<u8> = parts.iter().flat_map(|p| p.payload_enc.clone()).collect();
        assert_eq!(joined, pkt.payload_enc);
    }

    #[test]
    fn validate_rejects_bad_positions() {
        let mut pkt = Packet::new("a", "b", PacketMeta::default(), vec![]);
        pkt.chunk_index = 1;
        assert!(matches!(
            pkt.validate(),
            Err(TransportError::InvalidChunkPosition { index: 1, total: 1 })
        ));

        pkt.chunk_index = 0;
        pkt.total_chunks = 0;
        assert!(pkt.validate().is_err());
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let pkt = Packet::new("a", "b", PacketMeta::default(), b"hello".to_vec());
        let json: serde_json::Value = serde_json::to_value(&pkt).unwrap();
        assert_eq!(json["payload_enc"], "aGVsbG8=");

        let decoded = Packet::from_bytes(&pkt.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{"pkt_id":"p","src_id":"a","dst_id":"b","timestamp":1,"payload_enc":""}"#;
        let pkt = Packet::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(pkt.total_chunks, 1);
        assert_eq!(pkt.chunk_index, 0);
        assert_eq!(pkt.meta, PacketMeta::default());
    }

    #[test]
    fn invalid_base64_rejected() {
        let json = r#"{"pkt_id":"p","src_id":"a","dst_id":"b","timestamp":1,"payload_enc":"***"}"#;
        assert!(Packet::from_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn hub_ack_status_wire_names() {
        let ack = HubAck::buffered();
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "ACK");
        assert_eq!(json["needs_more_chunks"], true);
        assert!(json.get("response_packet").is_none());

        let nak: HubAck = serde_json::from_str(r#"{"status":"NAK","message":"boom"}"#).unwrap();
        assert!(!nak.is_ack());
        assert!(!nak.needs_more_chunks);
    }
}
