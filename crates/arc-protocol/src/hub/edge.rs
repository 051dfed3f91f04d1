/// Edge ("mini") hub.
///
/// Answers user queries from its local capsule cache, forwards misses to
/// the authority, and degrades to a labeled fallback answer when the
/// authority cannot be reached. Sends that fail land in the retransmit
/// queue; the manifest reconciler converges the capsule set independently.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use arc_transport::{now_ms, HubAck, Network, Packet, PacketMeta, PacketSink, ReassemblyBuffer, TransportError};

use super::{CAPSULE_INGESTED, PAYLOAD_PROCESSED};
use crate::capsule::{question_hash, Capsule, Provenance, CACHE_HIT_CONFIDENCE, FALLBACK_CONFIDENCE};
use crate::config::MiniHubConfig;
use crate::crypto::SessionCipher;
use crate::payload::{HubPayload, MessagePayload, QueryPayload, UserMessage};
use crate::queue::{RetransmitQueue, RetryOutcome};
use crate::reconcile::{AuthorityApi, ManifestReconciler, ReconcileReport};
use crate::store::{self, CapsuleSummary, Db, Direction, StoredMessage};
use crate::ArcProtocolError;

// ── Results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerSource {
    LocalCache,
    Authoritative,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub capsule_id: String,
    pub source: AnswerSource,
    pub confidence: f64,
}

impl QueryAnswer {
    fn from_capsule(capsule: &Capsule, source: AnswerSource, confidence: f64) -> Self {
        Self {
            answer: capsule.answer_text.clone(),
            capsule_id: capsule.capsule_id.clone(),
            source,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub message: UserMessage,
    pub status: DeliveryStatus,
}

/// What a complete inbound payload turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Capsule { capsule: Capsule, confidence: f64 },
    Manifest(ReconcileReport),
    Message(UserMessage),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetransmitReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Items whose queue bookkeeping failed; they stay in the queue.
    pub errors: usize,
}

/// Result of a synchronous send to the authority.
enum Dispatch {
    /// Every chunk acknowledged; carries the embedded reply, if any.
    Delivered(Option<Packet>),
    /// A chunk failed; it and the rest of the send were queued.
    Queued(String),
}

// ── Hub ──────────────────────────────────────────────────────────────

pub struct MiniHub {
    config: MiniHubConfig,
    network: Arc<dyn Network>,
    db: Db,
    cipher: SessionCipher,
    queue: RetransmitQueue,
    reassembly: ReassemblyBuffer,
    reconciler: ManifestReconciler,
}

impl MiniHub {
    pub fn new(
        config: MiniHubConfig,
        network: Arc<dyn Network>,
        authority: Arc<dyn AuthorityApi>,
        db: Db,
    ) -> Result<Self, ArcProtocolError> {
        config.validate()?;
        let cipher = SessionCipher::new(&config.session_key);
        let queue = RetransmitQueue::new(db.clone(), config.retransmit.policy());
        let reassembly = ReassemblyBuffer::with_ttl(config.reassembly_ttl);
        let reconciler = ManifestReconciler::new(
            config.node_id.clone(),
            db.clone(),
            authority,
            config.main_hub_verify_key.clone(),
        );
        Ok(Self {
            config,
            network,
            db,
            cipher,
            queue,
            reassembly,
            reconciler,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &MiniHubConfig {
        &self.config
    }

    pub fn queue(&self) -> &RetransmitQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &ManifestReconciler {
        &self.reconciler
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Answer `question`: fresh local capsule, else the authority, else a
    /// fallback.
    pub async fn query(
        &self,
        user_id: &str,
        question: &str,
        context: Option<String>,
    ) -> Result<QueryAnswer, ArcProtocolError> {
        let q_hash = question_hash(question);
        if let Some(cached) = self.cached_answer(&q_hash).await? {
            tracing::debug!("{}: cache hit for {q_hash}", self.config.node_id);
            return Ok(QueryAnswer::from_capsule(&cached, AnswerSource::LocalCache, CACHE_HIT_CONFIDENCE));
        }

        let payload = HubPayload::Query(QueryPayload {
            user_id: user_id.to_string(),
            question: question.to_string(),
            context,
        });
        match self.dispatch(&payload, PacketMeta::for_query(&q_hash)).await {
            Ok(Dispatch::Delivered(Some(reply))) => match self.handle_reply(&reply).await {
                Ok(Inbound::Capsule { capsule, confidence }) => {
                    return Ok(QueryAnswer::from_capsule(&capsule, AnswerSource::Authoritative, confidence));
                }
                Ok(other) => {
                    tracing::warn!("{}: unexpected reply to query: {other:?}", self.config.node_id);
                }
                Err(e) => tracing::warn!("{}: authority reply rejected: {e}", self.config.node_id),
            },
            Ok(Dispatch::Delivered(None)) => {
                tracing::warn!("{}: authority gave no answer for {q_hash}", self.config.node_id);
            }
            Ok(Dispatch::Queued(reason)) => {
                tracing::warn!("{}: query queued ({reason}), answering with fallback", self.config.node_id);
            }
            Err(e) => tracing::warn!("{}: query dispatch failed: {e}", self.config.node_id),
        }
        self.fallback_answer(question).await
    }

    async fn cached_answer(&self, q_hash: &str) -> Result<Option<Capsule>, ArcProtocolError> {
        let conn = self.db.lock().await;
        let trusted = store::fetch_trusted_by_hash(&conn, q_hash)?;
        Ok(trusted
            .map(|stored| stored.capsule)
            .filter(|c| c.is_fresh(now_ms(), self.config.capsule.capsule_ttl_days)))
    }

    /// Store a fallback capsule, replacing any earlier fallback for the
    /// same question.
    async fn fallback_answer(&self, question: &str) -> Result<QueryAnswer, ArcProtocolError> {
        let capsule = Capsule::fallback(question, self.config.node_id.clone(), now_ms());
        {
            let conn = self.db.lock().await;
            let tx = conn.unchecked_transaction()?;
            store::delete_fallback_for_hash(&tx, &capsule.question_hash)?;
            store::insert_capsule(&tx, &capsule, Provenance::Fallback)?;
            tx.commit()?;
        }
        Ok(QueryAnswer::from_capsule(&capsule, AnswerSource::Fallback, FALLBACK_CONFIDENCE))
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Record an outgoing message and hand it to the authority for relay.
    pub async fn send_message(
        &self,
        sender_id: &str,
        recipient_id: Option<&str>,
        content: &str,
    ) -> Result<MessageReceipt, ArcProtocolError> {
        let message = UserMessage {
            message_id: uuid::Uuid::new_v4().simple().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.map(String::from),
            content: content.to_string(),
            timestamp: now_ms(),
            source_hub_id: Some(self.config.node_id.clone()),
            target_hub_id: None,
        };
        {
            let conn = self.db.lock().await;
            store::insert_message(&conn, &message, Direction::Outgoing)?;
        }

        let payload = HubPayload::UserMessage(MessagePayload {
            message: message.clone(),
        });
        let status = match self.dispatch(&payload, PacketMeta::default()).await? {
            Dispatch::Delivered(_) => DeliveryStatus::Sent,
            Dispatch::Queued(reason) => {
                tracing::warn!("{}: message {} queued: {reason}", self.config.node_id, message.message_id);
                DeliveryStatus::Queued
            }
        };
        Ok(MessageReceipt { message, status })
    }

    pub async fn inbox(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<StoredMessage>, ArcProtocolError> {
        let conn = self.db.lock().await;
        Ok(store::fetch_messages(&conn, Some(Direction::Incoming), user_id, limit)?)
    }

    pub async fn sent(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<StoredMessage>, ArcProtocolError> {
        let conn = self.db.lock().await;
        Ok(store::fetch_messages(&conn, Some(Direction::Outgoing), user_id, limit)?)
    }

    pub async fn capsules(&self) -> Result<Vec<CapsuleSummary>, ArcProtocolError> {
        let conn = self.db.lock().await;
        Ok(store::list_capsules(&conn)?)
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Seal, chunk and send `payload` to the authority, chunk by chunk.
    ///
    /// On the first lost or failed chunk, that chunk and every later one
    /// are queued for retransmission.
    async fn dispatch(&self, payload: &HubPayload, meta: PacketMeta) -> Result<Dispatch, ArcProtocolError> {
        let sealed = payload.seal(&self.cipher)?;
        let chunks = Packet::chunked(
            &self.config.node_id,
            &self.config.main_hub_node_id,
            meta,
            &sealed,
            self.config.max_chunk_size_bytes,
        )?;

        let mut reply = None;
        for (position, chunk) in chunks.iter().enumerate() {
            let failure = match self
                .network
                .send(&self.config.node_id, &self.config.main_hub_node_id, chunk.clone())
                .await
            {
                Ok(report) if report.is_ack() => {
                    if let Some(downstream) = &report.downstream_response {
                        if !downstream.is_ack() {
                            return Err(ArcProtocolError::protocol(format!(
                                "{} rejected pkt {}: {}",
                                self.config.main_hub_node_id,
                                chunk.pkt_id,
                                downstream.message.as_deref().unwrap_or("NAK")
                            )));
                        }
                    }
                    reply = report.reply_packet().cloned();
                    continue;
                }
                Ok(report) => report.message.unwrap_or_else(|| "NAK".to_string()),
                Err(e) => e.to_string(),
            };

            let remaining = &chunks[position..];
            tracing::warn!(
                "{}: pkt={} chunk={} failed ({failure}), queueing {} chunk(s)",
                self.config.node_id,
                chunk.pkt_id,
                chunk.chunk_index,
                remaining.len()
            );
            if let Err(e) = self.queue.enqueue_all(remaining).await {
                tracing::error!("{}: could not queue pkt={}: {e}", self.config.node_id, chunk.pkt_id);
                return Err(e);
            }
            return Ok(Dispatch::Queued(failure));
        }

        if let Some(packet) = &reply {
            ensure_single_chunk(packet)?;
        }
        Ok(Dispatch::Delivered(reply))
    }

    /// Retry every queue item that is due at `now`.
    pub async fn process_retransmits(&self, now: u64) -> Result<RetransmitReport, ArcProtocolError> {
        let mut report = RetransmitReport::default();
        for item in self.queue.due(now).await? {
            let send = &item.payload;
            let result = self
                .network
                .send(&send.packet.src_id, &send.dst_id, send.packet.clone())
                .await;

            let failure = match result {
                Ok(sent) if sent.is_ack() => {
                    if let Some(downstream) = sent.downstream_response.as_ref().filter(|d| !d.is_ack()) {
                        tracing::warn!(
                            "{}: retransmitted pkt={} rejected downstream: {}",
                            self.config.node_id,
                            item.pkt_id,
                            downstream.message.as_deref().unwrap_or("NAK")
                        );
                    }
                    if let Some(reply) = sent.reply_packet() {
                        if let Err(e) = self.handle_reply(reply).await {
                            tracing::warn!(
                                "{}: reply to retransmitted pkt={} failed: {e}",
                                self.config.node_id,
                                item.pkt_id
                            );
                        }
                    }
                    report.delivered += 1;
                    if let Err(e) = self.queue.complete(&item).await {
                        tracing::error!(
                            "{}: could not remove delivered item {} (pkt={}): {e}",
                            self.config.node_id,
                            item.id,
                            item.pkt_id
                        );
                        report.errors += 1;
                    }
                    continue;
                }
                Ok(sent) => sent.message.unwrap_or_else(|| "NAK".to_string()),
                Err(e) => e.to_string(),
            };

            match self.queue.retry(&item, now).await {
                Err(e) => {
                    tracing::error!(
                        "{}: could not reschedule item {} (pkt={}): {e}",
                        self.config.node_id,
                        item.id,
                        item.pkt_id
                    );
                    report.errors += 1;
                }
                Ok(RetryOutcome::Rescheduled { attempt, next_retry }) => {
                    tracing::warn!(
                        "{}: retransmit pkt={} chunk={} failed ({failure}), attempt {attempt} at {next_retry}",
                        self.config.node_id,
                        item.pkt_id,
                        item.chunk_index
                    );
                    report.rescheduled += 1;
                }
                Ok(RetryOutcome::Exhausted) => {
                    tracing::error!(
                        "{}: dropping pkt={} chunk={} after {} attempts ({failure})",
                        self.config.node_id,
                        item.pkt_id,
                        item.chunk_index,
                        item.attempt
                    );
                    report.exhausted += 1;
                }
            }
        }
        Ok(report)
    }

    /// Poll the authority's manifest and pull what is missing.
    pub async fn sync_with_authority(&self) -> Result<ReconcileReport, ArcProtocolError> {
        self.reconciler.run_cycle().await
    }

    /// Drop stalled partial transfers.
    pub fn sweep_reassembly(&self) -> usize {
        self.reassembly.sweep_expired()
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Inbound packet endpoint.
    pub async fn receive_packet(&self, packet: Packet) -> HubAck {
        let pkt_id = packet.pkt_id.clone();
        let assembled = match self.reassembly.accept(&packet) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return HubAck::buffered(),
            Err(e) => {
                tracing::warn!("{}: bad chunk pkt={pkt_id}: {e}", self.config.node_id);
                return HubAck::nak(e.to_string());
            }
        };

        match self.handle_complete_packet(&assembled).await {
            Ok(Inbound::Capsule { .. }) => HubAck::ack(CAPSULE_INGESTED),
            Ok(_) => HubAck::ack(PAYLOAD_PROCESSED),
            Err(e) => {
                tracing::warn!("{}: rejected pkt={pkt_id}: {e}", self.config.node_id);
                HubAck::nak(e.to_string())
            }
        }
    }

    async fn handle_reply(&self, reply: &Packet) -> Result<Inbound, ArcProtocolError> {
        ensure_single_chunk(reply)?;
        self.handle_complete_packet(&reply.payload_enc).await
    }

    /// Open a fully assembled payload and act on it.
    pub async fn handle_complete_packet(&self, sealed: &[u8]) -> Result<Inbound, ArcProtocolError> {
        match HubPayload::open(&self.cipher, sealed)? {
            HubPayload::AuthoritativeResponse(response) => {
                let verify_key = self.reconciler.verify_key().await?;
                if !response.capsule.verify(&verify_key) {
                    tracing::error!(
                        "{}: capsule {} failed signature check",
                        self.config.node_id,
                        response.capsule.capsule_id
                    );
                    return Err(ArcProtocolError::InvalidSignature);
                }
                {
                    let conn = self.db.lock().await;
                    store::ingest_capsule(&conn, &response.capsule, Provenance::Authoritative)?;
                }
                Ok(Inbound::Capsule {
                    capsule: response.capsule,
                    confidence: response.confidence,
                })
            }
            HubPayload::Manifest(pushed) => {
                Ok(Inbound::Manifest(self.reconciler.sync_manifest(&pushed.manifest).await?))
            }
            HubPayload::UserMessage(MessagePayload { message }) => {
                let conn = self.db.lock().await;
                if !store::insert_message(&conn, &message, Direction::Incoming)? {
                    tracing::debug!("{}: duplicate message {}", self.config.node_id, message.message_id);
                }
                Ok(Inbound::Message(message))
            }
            other => Err(ArcProtocolError::UnsupportedPayload {
                kind: other.kind().to_string(),
            }),
        }
    }
}

fn ensure_single_chunk(reply: &Packet) -> Result<(), ArcProtocolError> {
    if reply.is_single_chunk() {
        Ok(())
    } else {
        Err(ArcProtocolError::protocol(format!(
            "chunked reply pkt {} ({} chunks) is not supported",
            reply.pkt_id, reply.total_chunks
        )))
    }
}

#[async_trait::async_trait]
impl PacketSink for MiniHub {
    async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError> {
        Ok(self.receive_packet(packet).await)
    }
}
