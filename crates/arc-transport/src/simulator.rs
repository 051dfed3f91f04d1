/// In-process network simulator.
///
/// Owns the node registry and the link model. Every `send` takes one
/// settings snapshot, optionally splits an oversized packet, then walks the
/// chunks in index order: loss roll, simulated delay, delivery. The first
/// lost or failed chunk aborts the whole send with a NAK.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{SettingsUpdate, SimSettings};
use crate::error::TransportError;
use crate::link::{ChunkResult, Network, PacketSink, SendReport};
use crate::packet::{AckStatus, Packet};

/// Minimum reordering jitter window, in seconds.
const MIN_JITTER_WINDOW_SECS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Main,
    Mini,
    Utility,
}

#[derive(Clone)]
struct Registration {
    node_type: NodeType,
    sink: Arc<dyn PacketSink>,
}

pub struct NetworkSimulator {
    registry: tokio::sync::Mutex<HashMap<String, Registration>>,
    settings: RwLock<Arc<SimSettings>>,
    rng: Mutex<StdRng>,
}

impl NetworkSimulator {
    /// Create a simulator. Fails if `settings` are out of range.
    pub fn new(settings: SimSettings) -> Result<Self, TransportError> {
        Self::build(settings, StdRng::from_os_rng())
    }

    /// Deterministic loss and jitter rolls, for tests and reproducible runs.
    pub fn with_seed(settings: SimSettings, seed: u64) -> Result<Self, TransportError> {
        Self::build(settings, StdRng::seed_from_u64(seed))
    }

    fn build(settings: SimSettings, rng: StdRng) -> Result<Self, TransportError> {
        settings.validate()?;
        tracing::info!("network simulator started with settings: {settings:?}");
        Ok(Self {
            registry: tokio::sync::Mutex::new(HashMap::new()),
            settings: RwLock::new(Arc::new(settings)),
            rng: Mutex::new(rng),
        })
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Register (or replace) the delivery endpoint of `node_id`.
    pub async fn register(
        &self,
        node_id: impl Into<String>,
        sink: Arc<dyn PacketSink>,
        node_type: NodeType,
    ) {
        let node_id = node_id.into();
        tracing::info!("registered node {node_id} ({node_type:?})");
        self.registry
            .lock()
            .await
            .insert(node_id, Registration { node_type, sink });
    }

    /// Remove `node_id`. Returns whether it was registered.
    pub async fn unregister(&self, node_id: &str) -> bool {
        let removed = self.registry.lock().await.remove(node_id).is_some();
        if removed {
            tracing::info!("unregistered node {node_id}");
        }
        removed
    }

    pub async fn node_type(&self, node_id: &str) -> Option<NodeType> {
        self.registry.lock().await.get(node_id).map(|r| r.node_type)
    }

    pub async fn registered_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    // ── Settings ─────────────────────────────────────────────────────

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<SimSettings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial update atomically. Invalid results leave the
    /// settings untouched. Sends already in flight keep their snapshot.
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<Arc<SimSettings>, TransportError> {
        let mut guard = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let next = guard.merged(update);
        next.validate()?;
        tracing::info!("updated simulator settings: {next:?}");
        *guard = Arc::new(next);
        Ok(guard.clone())
    }

    // ── Send ─────────────────────────────────────────────────────────

    /// Simulate delivery of `packet` from `src_id` to `dst_id`.
    ///
    /// `Err` only for an unregistered destination or a malformed packet;
    /// loss and destination failures come back as a NAK report.
    pub async fn send(
        &self,
        src_id: &str,
        dst_id: &str,
        packet: Packet,
    ) -> Result<SendReport, TransportError> {
        let settings = self.settings();
        let sink = {
            let registry = self.registry.lock().await;
            match registry.get(dst_id) {
                Some(reg) => reg.sink.clone(),
                None => {
                    tracing::error!("destination {dst_id} not registered (from {src_id})");
                    return Err(TransportError::NotRegistered {
                        node_id: dst_id.to_string(),
                    });
                }
            }
        };
        packet.validate()?;

        let pkt_id = packet.pkt_id.clone();
        let chunks = prepare_chunks(packet, &settings)?;
        let total_chunks = chunks.len() as u32;

        let mut chunk_results: Vec<ChunkResult> = Vec::with_capacity(chunks.len());
        let mut total_latency_ms = 0.0;

        for chunk in chunks {
            let chunk_index = chunk.chunk_index;
            let nak = |message: String, results: &Vec<ChunkResult>, latency_ms: f64| SendReport {
                status: AckStatus::Nak,
                pkt_id: pkt_id.clone(),
                chunk_index,
                total_chunks,
                delivered_chunks: results.len() as u32,
                latency_ms,
                message: Some(message),
                downstream_response: None,
                chunk_results: (!results.is_empty()).then(|| results.clone()),
            };

            let roll = self.roll_loss();
            if roll < settings.packet_loss_pct {
                tracing::warn!(
                    "chunk dropped: pkt={pkt_id} chunk={chunk_index} roll={roll:.2} pct={:.2}",
                    settings.packet_loss_pct
                );
                return Ok(nak(
                    "Packet chunk dropped by simulator".into(),
                    &chunk_results,
                    total_latency_ms,
                ));
            }

            let start = Instant::now();
            let delay = self.chunk_delay(&settings, chunk.payload_enc.len());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let downstream = match sink.deliver(chunk).await {
                Ok(ack) => ack,
                Err(e) => {
                    tracing::error!("destination error: pkt={pkt_id} chunk={chunk_index}: {e}");
                    return Ok(nak(
                        format!("Destination error: {e}"),
                        &chunk_results,
                        total_latency_ms,
                    ));
                }
            };

            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            total_latency_ms += latency_ms;
            tracing::debug!(
                "chunk delivered: pkt={pkt_id} chunk={chunk_index} latency_ms={latency_ms:.2} dest={dst_id}"
            );
            chunk_results.push(ChunkResult {
                chunk_index,
                latency_ms,
                downstream,
            });
        }

        let last = chunk_results.last();
        Ok(SendReport {
            status: AckStatus::Ack,
            pkt_id,
            chunk_index: last.map(|r| r.chunk_index).unwrap_or_default(),
            total_chunks,
            delivered_chunks: chunk_results.len() as u32,
            latency_ms: total_latency_ms,
            message: None,
            downstream_response: last.map(|r| r.downstream.clone()),
            chunk_results: Some(chunk_results),
        })
    }

    fn roll_loss(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0.0..100.0)
    }

    /// `latency + len / bandwidth + jitter`, jitter only when reordering.
    fn chunk_delay(&self, settings: &SimSettings, len: usize) -> Duration {
        let base = settings.latency_ms as f64 / 1000.0;
        let transfer = len as f64 / settings.bandwidth_bytes_per_sec.max(1) as f64;
        let jitter = if settings.enable_reordering {
            let window = base.max(MIN_JITTER_WINDOW_SECS);
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random_range(0.0..window)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + transfer + jitter)
    }
}

/// Split an oversized single-chunk packet when auto-chunking is on.
fn prepare_chunks(packet: Packet, settings: &SimSettings) -> Result<Vec<Packet>, TransportError> {
    let oversized = packet.payload_enc.len() > settings.max_chunk_size_bytes;
    if !oversized || !packet.is_single_chunk() {
        return Ok(vec![packet]);
    }

    if !settings.auto_chunk_large_payloads {
        tracing::warn!(
            "oversized packet without chunking: pkt={} size={} max={}",
            packet.pkt_id,
            packet.payload_enc.len(),
            settings.max_chunk_size_bytes
        );
        return Ok(vec![packet]);
    }

    let chunks = packet.split(settings.max_chunk_size_bytes)?;
    tracing::info!(
        "auto-chunked packet: pkt={} total_chunks={} max_size={}",
        packet.pkt_id,
        chunks.len(),
        settings.max_chunk_size_bytes
    );
    Ok(chunks)
}

#[async_trait::async_trait]
impl Network for NetworkSimulator {
    async fn send(
        &self,
        src_id: &str,
        dst_id: &str,
        packet: Packet,
    ) -> Result<SendReport, TransportError> {
        NetworkSimulator::send(self, src_id, dst_id, packet).await
    }
}
