//! ARC-AI transport layer.
//!
//! Packets, payload chunking, per-endpoint reassembly and a lossy network
//! simulator that models latency, bandwidth, loss and reordering between
//! hubs.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arc_transport::{HttpSink, NetworkSimulator, NodeType, Packet, PacketMeta, SimSettings};
//!
//! # async fn example() -> Result<(), arc_transport::TransportError> {
//! let sim = NetworkSimulator::new(SimSettings::from_env())?;
//! sim.register("main-hub", Arc::new(HttpSink::new("http://main-hub:8000/packets")?), NodeType::Main)
//!     .await;
//!
//! let packet = Packet::new("mini-hub-1", "main-hub", PacketMeta::default(), b"sealed".to_vec());
//! let report = sim.send("mini-hub-1", "main-hub", packet).await?;
//! println!("{:?} after {:.1} ms", report.status, report.latency_ms);
//! # Ok(())
//! # }
//! ```

pub mod chunker;
mod config;
mod error;
mod http;
mod link;
mod packet;
mod reassembly;
mod simulator;

pub use config::{SettingsUpdate, SimSettings, MIN_BANDWIDTH_BYTES_PER_SEC, MIN_CHUNK_SIZE_BYTES};
pub use error::TransportError;
pub use http::{HttpSimulatorClient, HttpSink};
pub use link::{ChunkResult, Network, PacketSink, SendReport};
pub use packet::{new_pkt_id, now_ms, AckStatus, HubAck, Packet, PacketMeta};
pub use reassembly::{ReassemblyBuffer, DEFAULT_REASSEMBLY_TTL};
pub use simulator::{NetworkSimulator, NodeType};
