use crate::output;
use serde::Serialize;
use std::io::Write;

use arc_protocol::{BroadcastReport, QueryAnswer, ReconcileReport, RetransmitReport};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
/// If --output-dir was provided, also writes to the JSONL file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::write_jsonl_line(&json);
    }
}

/// RFC 3339 timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub scenario: String,
    pub edges: usize,
    pub loss_pct: f64,
    pub latency_ms: u64,
    pub bandwidth_bytes_per_sec: u64,
    pub max_chunk_size_bytes: usize,
    pub timestamp: String,
}

// ── Seeding ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSeeded {
    pub event: &'static str,
    pub capsules: usize,
    pub manifest_size: usize,
    pub verify_key: String,
    pub elapsed_s: f64,
}

// ── Queries ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventQuery {
    pub event: &'static str,
    pub hub: String,
    pub seq: u32,
    pub question: String,
    #[serde(flatten)]
    pub answer: QueryAnswer,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventQueryFailed {
    pub event: &'static str,
    pub hub: String,
    pub seq: u32,
    pub error: String,
    pub elapsed_s: f64,
}

// ── Messages ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventMessage {
    pub event: &'static str,
    pub hub: String,
    pub message_id: String,
    pub status: String,
    pub elapsed_s: f64,
}

// ── Recovery ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventLinkRestored {
    pub event: &'static str,
    pub loss_pct: f64,
    pub elapsed_s: f64,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct EventRetransmit {
    pub event: &'static str,
    pub hub: String,
    pub round: u32,
    pub pending: usize,
    #[serde(flatten)]
    pub report: RetransmitReport,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventBroadcast {
    pub event: &'static str,
    #[serde(flatten)]
    pub report: BroadcastReport,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventReconcile {
    pub event: &'static str,
    pub hub: String,
    pub converged: bool,
    #[serde(flatten)]
    pub report: ReconcileReport,
    pub elapsed_s: f64,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize, Default)]
pub struct EventSummary {
    pub event: &'static str,
    pub queries: u32,
    pub authoritative: u32,
    pub cached: u32,
    pub fallback: u32,
    pub messages_sent: u32,
    pub messages_queued: u32,
    pub still_pending: usize,
    pub capsules_per_hub: Vec<(String, usize)>,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventKeygen {
    pub event: &'static str,
    pub signing_key_b64: String,
    pub verify_key_b64: String,
}
