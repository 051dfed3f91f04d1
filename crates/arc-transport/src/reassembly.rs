/// Per-endpoint chunk reassembly buffer.
///
/// Accumulates chunks of multi-chunk packets keyed by `pkt_id` and
/// releases the payload once every index has arrived. One lock guards
/// every accumulator of the endpoint; all operations are O(1) and never
/// held across an await.
///
/// Partial transfers that stall are dropped by `sweep_expired()` once
/// they are older than the configured TTL.
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::chunker;
use crate::error::TransportError;
use crate::packet::Packet;

/// Default lifetime of an incomplete accumulator.
pub const DEFAULT_REASSEMBLY_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Accumulator {
    total_chunks: u32,
    chunks: HashMap<u32, Vec<u8>>,
    first_seen: Instant,
}

impl Accumulator {
    fn new(total_chunks: u32, now: Instant) -> Self {
        Self {
            total_chunks,
            chunks: HashMap::new(),
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks as usize
    }
}

pub struct ReassemblyBuffer {
    entries: Mutex<HashMap<String, Accumulator>>,
    ttl: Duration,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_REASSEMBLY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Feed one arriving packet. See [`on_chunk_arrival`](Self::on_chunk_arrival).
    pub fn accept(&self, packet: &Packet) -> Result<Option<Vec<u8>>, TransportError> {
        self.on_chunk_arrival(
            &packet.pkt_id,
            packet.total_chunks,
            packet.chunk_index,
            packet.payload_enc.clone(),
        )
    }

    /// Record a chunk. Returns the assembled payload once complete,
    /// `None` while more chunks are needed.
    ///
    /// Single-chunk packets are returned immediately without buffering.
    /// A repeated index overwrites the earlier bytes.
    pub fn on_chunk_arrival(
        &self,
        pkt_id: &str,
        total_chunks: u32,
        chunk_index: u32,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if total_chunks == 0 || chunk_index >= total_chunks {
            return Err(TransportError::InvalidChunkPosition {
                index: chunk_index,
                total: total_chunks,
            });
        }
        if total_chunks == 1 {
            return Ok(Some(bytes));
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let acc = entries
            .entry(pkt_id.to_string())
            .or_insert_with(|| Accumulator::new(total_chunks, Instant::now()));

        if acc.total_chunks != total_chunks {
            return Err(TransportError::ChunkCountMismatch {
                pkt_id: pkt_id.to_string(),
                expected: acc.total_chunks,
                actual: total_chunks,
            });
        }

        acc.chunks.insert(chunk_index, bytes);
        if !acc.is_complete() {
            tracing::debug!(
                "reassembly: pkt={pkt_id} chunk={chunk_index} buffered ({}/{total_chunks})",
                acc.chunks.len()
            );
            return Ok(None);
        }

        let Some(acc) = entries.remove(pkt_id) else {
            return Ok(None);
        };
        chunker::join_in_order(acc.chunks, acc.total_chunks).map(Some)
    }

    /// Drop accumulators older than the TTL. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|pkt_id, acc| {
            let alive = now.saturating_duration_since(acc.first_seen) < self.ttl;
            if !alive {
                tracing::warn!(
                    "reassembly: dropping stalled pkt={pkt_id} ({}/{} chunks)",
                    acc.chunks.len(),
                    acc.total_chunks
                );
            }
            alive
        });
        before - entries.len()
    }

    /// Number of incomplete packets currently buffered.
    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
