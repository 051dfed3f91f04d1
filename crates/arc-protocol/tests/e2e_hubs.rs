//! End-to-end: authority and edge hubs exchanging packets through the
//! network simulator.

use std::sync::Arc;
use std::time::Duration;

use arc_protocol::{
    spawn_authority_tasks, spawn_edge_tasks, AnswerSource, CapsuleConfig, DeliveryStatus, MainHub, MainHubConfig,
    MiniHub, MiniHubConfig, Provenance, SeedEntry, SigningKeypair,
};
use arc_transport::{now_ms, NetworkSimulator, NodeType, SettingsUpdate, SimSettings};

struct Network {
    sim: Arc<NetworkSimulator>,
    main: Arc<MainHub>,
    edges: Vec<Arc<MiniHub>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

async fn network(loss_pct: f64, edge_count: usize, capsule: CapsuleConfig) -> Network {
    init_tracing();
    let settings = SimSettings::new()
        .packet_loss_pct(loss_pct)
        .latency_ms(50)
        .bandwidth_bytes_per_sec(100_000)
        .max_chunk_size_bytes(256);
    let sim = Arc::new(NetworkSimulator::with_seed(settings, 42).unwrap());

    let edge_ids: Vec<String> = (1..=edge_count).map(|i| format!("mini-hub-{i}")).collect();
    let main_config = MainHubConfig::new("main-hub")
        .known_mini_hubs(edge_ids.clone())
        .signing_keys(SigningKeypair::from_seed(&[7u8; 32]))
        .capsule(capsule.clone());
    let main = Arc::new(MainHub::new(main_config, sim.clone(), arc_protocol::open_in_memory().unwrap()).unwrap());
    sim.register("main-hub", main.clone(), NodeType::Main).await;

    let mut edges = Vec::new();
    for id in edge_ids {
        let config = MiniHubConfig::new(id.clone())
            .max_chunk_size_bytes(256)
            .capsule(capsule.clone());
        let edge = Arc::new(
            MiniHub::new(config, sim.clone(), main.clone(), arc_protocol::open_in_memory().unwrap()).unwrap(),
        );
        sim.register(id, edge.clone(), NodeType::Mini).await;
        edges.push(edge);
    }
    Network { sim, main, edges }
}

#[tokio::test(start_paused = true)]
async fn chunked_query_gets_authoritative_answer() {
    let net = network(0.0, 1, CapsuleConfig::default()).await;
    let edge = &net.edges[0];
    let question = format!("How should we store grain through the rainy season? {}", "Details ".repeat(40));

    let answer = edge.query("u1", &question, Some("village".into())).await.unwrap();
    assert_eq!(answer.source, AnswerSource::Authoritative);
    assert!(answer.answer.starts_with("[ARC-AI authoritative:"));

    let manifest = net.main.latest_manifest().await.unwrap();
    assert_eq!(manifest.capsule_ids, vec![answer.capsule_id.clone()]);

    let again = edge.query("u2", &question, None).await.unwrap();
    assert_eq!(again.source, AnswerSource::LocalCache);
    assert_eq!(again.capsule_id, answer.capsule_id);
}

#[tokio::test(start_paused = true)]
async fn message_relayed_to_other_edges() {
    let net = network(0.0, 3, CapsuleConfig::default()).await;

    let receipt = net.edges[0]
        .send_message("alice", Some("bob"), "Meet at the clinic at noon")
        .await
        .unwrap();
    assert_eq!(receipt.status, DeliveryStatus::Sent);

    for edge in &net.edges[1..] {
        let inbox = edge.inbox(Some("bob"), 10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message.message_id, receipt.message.message_id);
        assert_eq!(inbox[0].message.source_hub_id.as_deref(), Some("mini-hub-1"));
    }
    assert!(net.edges[0].inbox(None, 10).await.unwrap().is_empty());
    assert_eq!(net.edges[0].sent(Some("alice"), 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lossy_link_recovers_through_retransmit() {
    let net = network(100.0, 1, CapsuleConfig::default()).await;
    let edge = &net.edges[0];

    let answer = edge.query("u1", "Is the pass open?", None).await.unwrap();
    assert_eq!(answer.source, AnswerSource::Fallback);
    assert_eq!(edge.queue().len().await.unwrap(), 1);

    // still lossy: rescheduled, not dropped
    let report = edge.process_retransmits(now_ms() + 1_000).await.unwrap();
    assert_eq!(report.rescheduled, 1);

    net.sim
        .update_settings(&SettingsUpdate {
            packet_loss_pct: Some(0.0),
            ..Default::default()
        })
        .unwrap();
    let report = edge.process_retransmits(now_ms() + 60_000).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(edge.queue().is_empty().await.unwrap());

    let capsules = edge.capsules().await.unwrap();
    assert_eq!(capsules.len(), 1);
    assert_eq!(capsules[0].ingest_source, Provenance::Authoritative);

    let cached = edge.query("u1", "Is the pass open?", None).await.unwrap();
    assert_eq!(cached.source, AnswerSource::LocalCache);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retransmit_is_dropped() {
    let net = network(100.0, 1, CapsuleConfig::default()).await;
    let edge = &net.edges[0];
    let receipt = edge.send_message("alice", None, "anyone there?").await.unwrap();
    assert_eq!(receipt.status, DeliveryStatus::Queued);
    let queued = edge.queue().len().await.unwrap();
    assert!(queued >= 1);

    let mut now = now_ms();
    let mut exhausted = 0;
    for _ in 0..10 {
        now += 60_000;
        exhausted += edge.process_retransmits(now).await.unwrap().exhausted;
    }
    assert_eq!(exhausted, queued);
    assert!(edge.queue().is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn broadcast_pushes_capsules_to_every_edge() {
    let net = network(0.0, 2, CapsuleConfig::default()).await;
    net.main
        .seed(&[
            SeedEntry {
                question_text: "Where is the nearest pharmacy?".into(),
                answer_text: "Two streets east of the market.".into(),
            },
            SeedEntry {
                question_text: "When is the clinic open?".into(),
                answer_text: "Weekdays from eight to four.".into(),
            },
        ])
        .await
        .unwrap();

    let report = net.main.broadcast_manifest().await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    assert!(report.failed.is_empty());

    for edge in &net.edges {
        let capsules = edge.capsules().await.unwrap();
        assert_eq!(capsules.len(), 2);
        assert!(capsules.iter().all(|c| c.ingest_source == Provenance::Manifest));
    }
}

#[tokio::test(start_paused = true)]
async fn background_tasks_converge_and_stop() {
    let capsule = CapsuleConfig::default()
        .manifest_interval(Duration::from_secs(5))
        .gossip_interval(Duration::from_secs(7));
    let net = network(0.0, 2, capsule).await;
    net.main
        .seed(&[SeedEntry {
            question_text: "Is the water safe?".into(),
            answer_text: "Boil it first.".into(),
        }])
        .await
        .unwrap();

    let authority_tasks = spawn_authority_tasks(net.main.clone());
    let edge_tasks: Vec<_> = net.edges.iter().map(|e| spawn_edge_tasks(e.clone())).collect();
    assert_eq!(edge_tasks[0].len(), 3);

    tokio::time::sleep(Duration::from_secs(8)).await;
    for edge in &net.edges {
        assert_eq!(edge.capsules().await.unwrap().len(), 1);
    }

    authority_tasks.shutdown().await;
    for tasks in edge_tasks {
        tasks.shutdown().await;
    }
}
