use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::packet::{AckStatus, HubAck, Packet};

/// Inbound delivery endpoint of a registered node.
///
/// In production: [`HttpSink`](crate::HttpSink) posting to the node's callback URL.
/// In-process: the hub itself.
#[async_trait::async_trait]
pub trait PacketSink: Send + Sync {
    /// Hand one chunk to the node and return its reply.
    ///
    /// `Err` means the destination could not be reached or answered with an error.
    async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError>;
}

/// Outbound path from an endpoint into the simulated link.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    async fn send(
        &self,
        src_id: &str,
        dst_id: &str,
        packet: Packet,
    ) -> Result<SendReport, TransportError>;
}

/// Outcome of one delivered chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: u32,
    pub latency_ms: f64,
    pub downstream: HubAck,
}

/// Aggregated result of a simulator send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReport {
    pub status: AckStatus,
    pub pkt_id: String,
    /// Last delivered chunk on ACK, the failing chunk on NAK.
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub delivered_chunks: u32,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reply of the destination to the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_response: Option<HubAck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_results: Option<Vec<ChunkResult>>,
}

impl SendReport {
    pub fn is_ack(&self) -> bool {
        self.status == AckStatus::Ack
    }

    /// Embedded reply packet carried by the final downstream response, if any.
    pub fn reply_packet(&self) -> Option<&Packet> {
        self.downstream_response
            .as_ref()
            .and_then(|ack| ack.response_packet.as_ref())
    }
}

// ── Mock sink (tests) ────────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records every delivered chunk.
    #[derive(Clone)]
    pub struct RecordingSink {
        received: Arc<Mutex<Vec<Packet>>>,
        fail_deliveries: Arc<Mutex<bool>>,
        reply: Arc<Mutex<Option<HubAck>>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                received: Arc::new(Mutex::new(Vec::new())),
                fail_deliveries: Arc::new(Mutex::new(false)),
                reply: Arc::new(Mutex::new(None)),
            }
        }

        pub fn received(&self) -> Vec<Packet> {
            self.received.lock().unwrap().clone()
        }

        pub fn set_fail_deliveries(&self, fail: bool) {
            *self.fail_deliveries.lock().unwrap() = fail;
        }

        pub fn set_reply(&self, reply: HubAck) {
            *self.reply.lock().unwrap() = Some(reply);
        }
    }

    #[async_trait::async_trait]
    impl PacketSink for RecordingSink {
        async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError> {
            if *self.fail_deliveries.lock().unwrap() {
                return Err(TransportError::Delivery("mock: endpoint down".into()));
            }
            let index = packet.chunk_index;
            self.received.lock().unwrap().push(packet);
            let reply = self.reply.lock().unwrap().clone();
            Ok(reply.unwrap_or_else(|| HubAck::ack(format!("chunk {index} received"))))
        }
    }
}
