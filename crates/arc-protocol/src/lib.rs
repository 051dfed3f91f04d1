//! ARC-AI protocol layer.
//!
//! Signed knowledge capsules, manifest gossip, a persistent retransmit
//! queue and the two hub roles, on top of `arc-transport`.
//!
//! Wire format: JSON payloads discriminated by `"type"`, sealed with
//! ChaCha20-Poly1305 (`nonce ++ ciphertext`).
//! Signatures: Ed25519 over the capsule's sorted-key JSON without `signature`.
//! Persistence: SQLite.

pub mod capsule;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod hub;
pub mod manifest;
pub mod payload;
pub mod queue;
pub mod reconcile;
pub mod runtime;
pub mod store;

pub use capsule::{question_hash, Capsule, Provenance};
pub use config::{CapsuleConfig, MainHubConfig, MiniHubConfig, RetransmitConfig};
pub use crypto::{SessionCipher, SessionKey, SigningKeypair};
pub use error::ArcProtocolError;
pub use http::HttpAuthority;
pub use hub::{
    AnswerSource, BroadcastReport, DeliveryStatus, Inbound, MainHub, MessageReceipt, MiniHub, QueryAnswer,
    RetransmitReport, SeedEntry,
};
pub use manifest::Manifest;
pub use payload::{HubPayload, UserMessage};
pub use queue::{BackoffPolicy, QueueItem, RetransmitQueue, RetryOutcome};
pub use reconcile::{AuthorityApi, ManifestReconciler, ReconcilePhase, ReconcileReport};
pub use runtime::{spawn_authority_tasks, spawn_edge_tasks, TaskSet};
pub use store::{open_db, open_in_memory, Db, Direction};
