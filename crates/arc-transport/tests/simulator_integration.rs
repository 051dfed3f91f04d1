//! Integration tests: simulator delivering into in-process sinks.

use std::sync::{Arc, Mutex};

use arc_transport::{
    AckStatus, HubAck, NetworkSimulator, NodeType, Packet, PacketMeta, PacketSink,
    ReassemblyBuffer, SettingsUpdate, SimSettings, TransportError,
};

/// Endpoint that reassembles chunks like a hub would.
struct AssemblingSink {
    buffer: ReassemblyBuffer,
    arrivals: Mutex<Vec<(u32, u32)>>,
    completed: Mutex<Vec<Vec<u8>>>,
}

impl AssemblingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: ReassemblyBuffer::new(),
            arrivals: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl PacketSink for AssemblingSink {
    async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError> {
        self.arrivals
            .lock()
            .unwrap()
            .push((packet.chunk_index, packet.total_chunks));
        match self.buffer.accept(&packet)? {
            Some(payload) => {
                self.completed.lock().unwrap().push(payload);
                Ok(HubAck::ack("Packet processed"))
            }
            None => Ok(HubAck::buffered()),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn settings() -> SimSettings {
    SimSettings::new()
        .latency_ms(20)
        .packet_loss_pct(0.0)
        .max_chunk_size_bytes(256)
        .bandwidth_bytes_per_sec(64 * 1024)
}

#[tokio::test(start_paused = true)]
async fn auto_chunked_payload_reassembles_at_destination() {
    init_tracing();
    let sim = NetworkSimulator::with_seed(settings(), 42).unwrap();
    let sink = AssemblingSink::new();
    sim.register("main-hub", sink.clone(), NodeType::Main).await;

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let packet = Packet::new("mini-hub-1", "main-hub", PacketMeta::for_query("h"), payload.clone());
    let report = sim.send("mini-hub-1", "main-hub", packet).await.unwrap();

    assert_eq!(report.status, AckStatus::Ack);
    assert_eq!(report.total_chunks, 4); // ceil(1000 / 256)
    assert_eq!(report.delivered_chunks, 4);
    assert_eq!(
        report.downstream_response.as_ref().and_then(|a| a.message.as_deref()),
        Some("Packet processed")
    );
    assert_eq!(*sink.completed.lock().unwrap(), vec![payload]);
    assert_eq!(
        *sink.arrivals.lock().unwrap(),
        vec![(0, 4), (1, 4), (2, 4), (3, 4)]
    );
}

#[tokio::test(start_paused = true)]
async fn loss_extremes_are_deterministic() {
    init_tracing();
    let sim = NetworkSimulator::new(settings()).unwrap();
    let sink = AssemblingSink::new();
    sim.register("main-hub", sink.clone(), NodeType::Main).await;

    for _ in 0..20 {
        let packet = Packet::new("mh", "main-hub", PacketMeta::default(), vec![1u8; 700]);
        let report = sim.send("mh", "main-hub", packet).await.unwrap();
        assert!(report.is_ack());
        assert_eq!(report.delivered_chunks, report.total_chunks);
    }

    sim.update_settings(&SettingsUpdate {
        packet_loss_pct: Some(100.0),
        ..Default::default()
    })
    .unwrap();

    for _ in 0..20 {
        let packet = Packet::new("mh", "main-hub", PacketMeta::default(), vec![1u8; 700]);
        let report = sim.send("mh", "main-hub", packet).await.unwrap();
        assert_eq!(report.status, AckStatus::Nak);
        assert!(report.delivered_chunks < report.total_chunks);
    }
}

#[tokio::test(start_paused = true)]
async fn partial_loss_leaves_receiver_waiting() {
    init_tracing();
    // Seeded so some sends fail mid-way; every NAK must report fewer
    // delivered chunks than the total.
    let sim = NetworkSimulator::with_seed(settings().packet_loss_pct(30.0), 9).unwrap();
    let sink = AssemblingSink::new();
    sim.register("main-hub", sink.clone(), NodeType::Main).await;

    let mut acks = 0;
    let mut partial = 0;
    for _ in 0..30 {
        let packet = Packet::new("mh", "main-hub", PacketMeta::default(), vec![5u8; 1024]);
        let report = sim.send("mh", "main-hub", packet).await.unwrap();
        if report.is_ack() {
            acks += 1;
        } else {
            assert!(report.delivered_chunks < report.total_chunks);
            if report.delivered_chunks > 0 {
                partial += 1;
            }
        }
    }
    assert_eq!(sink.completed.lock().unwrap().len(), acks);
    assert_eq!(sink.buffer.pending(), partial);
}

#[tokio::test(start_paused = true)]
async fn reordering_adds_bounded_jitter() {
    init_tracing();
    let sim = NetworkSimulator::with_seed(
        settings().latency_ms(100).enable_reordering(true),
        3,
    )
    .unwrap();
    sim.register("main-hub", AssemblingSink::new(), NodeType::Main)
        .await;

    let packet = Packet::new("mh", "main-hub", PacketMeta::default(), vec![0u8; 10]);
    let report = sim.send("mh", "main-hub", packet).await.unwrap();
    // base 100 ms, jitter within [0, 100) ms, transfer negligible
    assert!(report.latency_ms >= 100.0);
    assert!(report.latency_ms < 201.0);
}
