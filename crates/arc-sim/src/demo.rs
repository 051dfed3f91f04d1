/// In-process demo: one authority, N edge hubs, a lossy simulated link.
///
/// Phases: seed the authority, query through the edges, send messages,
/// restore the link and drain the retransmit queues, then broadcast the
/// manifest and reconcile every edge.
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_protocol::{
    open_in_memory, AnswerSource, DeliveryStatus, MainHub, MainHubConfig, MiniHub, MiniHubConfig, RetransmitConfig,
    SeedEntry, SigningKeypair,
};
use arc_transport::{now_ms, NetworkSimulator, NodeType, SettingsUpdate, SimSettings};

use crate::events::{
    emit, now_iso, EventBroadcast, EventLinkRestored, EventMessage, EventQuery, EventQueryFailed, EventReconcile,
    EventRetransmit, EventSeeded, EventStarted, EventSummary,
};

const MAIN_HUB_ID: &str = "main-hub";

const SEED: &[(&str, &str)] = &[
    (
        "How do I treat a minor burn?",
        "Cool the burn under clean running water for 20 minutes, cover loosely, do not apply butter or oil.",
    ),
    (
        "When should maize be planted?",
        "Plant at the onset of reliable rains, once the topsoil is moist to a hand's depth.",
    ),
    (
        "How can drinking water be made safe?",
        "Bring water to a rolling boil for one minute, or use chlorine tablets as directed, then store covered.",
    ),
];

const QUESTIONS: &[&str] = &[
    "How do I treat a minor burn?",
    "When should maize be planted?",
    "What are the signs of dehydration in children?",
    "How can drinking water be made safe?",
    "How do I store seed grain through the rainy season?",
];

/// Wall-clock milliseconds advanced by the tokio clock, so retransmit
/// deadlines follow paused time in tests.
struct SimClock {
    base_ms: u64,
    origin: tokio::time::Instant,
}

impl SimClock {
    fn start() -> Self {
        Self {
            base_ms: now_ms(),
            origin: tokio::time::Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.base_ms + self.origin.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub loss_pct: f64,
    pub latency_ms: u64,
    pub bandwidth_bytes_per_sec: u64,
    pub max_chunk_size_bytes: usize,
    pub edges: usize,
    pub queries: u32,
    pub retransmit_rounds: u32,
    pub seed: u64,
}

pub async fn run(opts: &DemoOptions) -> anyhow::Result<EventSummary> {
    let start = Instant::now();
    anyhow::ensure!(opts.edges > 0, "--edges must be at least 1");

    let settings = SimSettings::new()
        .packet_loss_pct(opts.loss_pct)
        .latency_ms(opts.latency_ms)
        .bandwidth_bytes_per_sec(opts.bandwidth_bytes_per_sec)
        .max_chunk_size_bytes(opts.max_chunk_size_bytes);
    let sim = Arc::new(NetworkSimulator::with_seed(settings, opts.seed)?);

    emit(&EventStarted {
        event: "started",
        scenario: "demo".into(),
        edges: opts.edges,
        loss_pct: opts.loss_pct,
        latency_ms: opts.latency_ms,
        bandwidth_bytes_per_sec: opts.bandwidth_bytes_per_sec,
        max_chunk_size_bytes: opts.max_chunk_size_bytes,
        timestamp: now_iso(),
    });

    // ── Hubs ────────────────────────────────────────────────────────
    let edge_ids: Vec<String> = (1..=opts.edges).map(|i| format!("mini-hub-{i}")).collect();
    let main_config = MainHubConfig::new(MAIN_HUB_ID)
        .known_mini_hubs(edge_ids.clone())
        .signing_keys(SigningKeypair::generate());
    let main = Arc::new(MainHub::new(main_config, sim.clone(), open_in_memory()?)?);
    sim.register(MAIN_HUB_ID, main.clone(), NodeType::Main).await;

    let retransmit = RetransmitConfig::default().base_backoff(Duration::from_millis(200));
    let mut edges = Vec::with_capacity(edge_ids.len());
    for id in edge_ids {
        let config = MiniHubConfig::new(id.clone())
            .main_hub_node_id(MAIN_HUB_ID)
            .max_chunk_size_bytes(opts.max_chunk_size_bytes)
            .retransmit(retransmit.clone());
        let edge = Arc::new(MiniHub::new(config, sim.clone(), main.clone(), open_in_memory()?)?);
        sim.register(id, edge.clone(), NodeType::Mini).await;
        edges.push(edge);
    }

    // ── Seed ────────────────────────────────────────────────────────
    let entries: Vec<SeedEntry> = SEED
        .iter()
        .map(|(q, a)| SeedEntry {
            question_text: q.to_string(),
            answer_text: a.to_string(),
        })
        .collect();
    let seeded = main.seed(&entries).await?;
    emit(&EventSeeded {
        event: "seeded",
        capsules: seeded.len(),
        manifest_size: main.latest_manifest().await?.capsule_ids.len(),
        verify_key: main.verify_key(),
        elapsed_s: start.elapsed().as_secs_f64(),
    });

    let mut summary = EventSummary {
        event: "summary",
        ..Default::default()
    };

    // ── Queries ─────────────────────────────────────────────────────
    for seq in 0..opts.queries {
        let edge = &edges[seq as usize % edges.len()];
        let question = QUESTIONS[seq as usize % QUESTIONS.len()];
        summary.queries += 1;
        match edge.query(&format!("user-{seq}"), question, None).await {
            Ok(answer) => {
                match answer.source {
                    AnswerSource::Authoritative => summary.authoritative += 1,
                    AnswerSource::LocalCache => summary.cached += 1,
                    AnswerSource::Fallback => summary.fallback += 1,
                }
                emit(&EventQuery {
                    event: "query",
                    hub: edge.node_id().to_string(),
                    seq,
                    question: question.to_string(),
                    answer,
                    elapsed_s: start.elapsed().as_secs_f64(),
                });
            }
            Err(e) => {
                tracing::warn!("query {seq} on {} failed: {e}", edge.node_id());
                emit(&EventQueryFailed {
                    event: "query_failed",
                    hub: edge.node_id().to_string(),
                    seq,
                    error: e.to_string(),
                    elapsed_s: start.elapsed().as_secs_f64(),
                });
            }
        }
    }

    // ── Messages ────────────────────────────────────────────────────
    for edge in &edges {
        let content = format!("Status report from {}: clinic open, stock adequate.", edge.node_id());
        match edge.send_message("coordinator", None, &content).await {
            Ok(receipt) => {
                match receipt.status {
                    DeliveryStatus::Sent => summary.messages_sent += 1,
                    DeliveryStatus::Queued => summary.messages_queued += 1,
                }
                emit(&EventMessage {
                    event: "message",
                    hub: edge.node_id().to_string(),
                    message_id: receipt.message.message_id.clone(),
                    status: format!("{:?}", receipt.status).to_lowercase(),
                    elapsed_s: start.elapsed().as_secs_f64(),
                });
            }
            Err(e) => tracing::warn!("message from {} failed: {e}", edge.node_id()),
        }
    }

    // ── Recovery ────────────────────────────────────────────────────
    if opts.loss_pct > 0.0 {
        sim.update_settings(&SettingsUpdate {
            packet_loss_pct: Some(0.0),
            ..Default::default()
        })?;
        emit(&EventLinkRestored {
            event: "link_restored",
            loss_pct: 0.0,
            elapsed_s: start.elapsed().as_secs_f64(),
            timestamp: now_iso(),
        });
    }

    let policy = retransmit.policy();
    let clock = SimClock::start();
    for round in 1..=opts.retransmit_rounds {
        let mut pending_total = 0;
        for edge in &edges {
            if edge.queue().is_empty().await? {
                continue;
            }
            let report = edge.process_retransmits(clock.now_ms()).await?;
            let pending = edge.queue().len().await?;
            pending_total += pending;
            emit(&EventRetransmit {
                event: "retransmit",
                hub: edge.node_id().to_string(),
                round,
                pending,
                report,
                elapsed_s: start.elapsed().as_secs_f64(),
            });
        }
        if pending_total == 0 {
            break;
        }
        tokio::time::sleep(policy.delay_for(round)).await;
    }

    // ── Gossip ──────────────────────────────────────────────────────
    let report = main.broadcast_manifest().await?;
    emit(&EventBroadcast {
        event: "broadcast",
        report,
        elapsed_s: start.elapsed().as_secs_f64(),
    });

    for edge in &edges {
        match edge.sync_with_authority().await {
            Ok(report) => emit(&EventReconcile {
                event: "reconcile",
                hub: edge.node_id().to_string(),
                converged: report.is_converged(),
                report,
                elapsed_s: start.elapsed().as_secs_f64(),
            }),
            Err(e) => tracing::warn!("reconcile on {} failed: {e}", edge.node_id()),
        }
    }

    for edge in &edges {
        summary.still_pending += edge.queue().len().await?;
        summary
            .capsules_per_hub
            .push((edge.node_id().to_string(), edge.capsules().await?.len()));
    }
    summary.elapsed_s = start.elapsed().as_secs_f64();
    Ok(summary)
}
