/// Authority ("main") hub.
///
/// Issues and signs capsules, keeps the cached manifest current, answers
/// queries with a single-chunk reply embedded in its ACK, relays user
/// messages between edge hubs and periodically broadcasts its manifest.
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use arc_transport::{now_ms, HubAck, Network, Packet, PacketMeta, PacketSink, ReassemblyBuffer, TransportError};

use super::{MESSAGE_RELAYED, RESPONSE_READY};
use crate::capsule::{authoritative_answer, question_hash, Capsule, Provenance, AUTHORITATIVE_CONFIDENCE};
use crate::config::MainHubConfig;
use crate::crypto::SessionCipher;
use crate::manifest::Manifest;
use crate::payload::{AuthoritativePayload, HubPayload, ManifestPayload, MessagePayload, QueryPayload, UserMessage};
use crate::reconcile::AuthorityApi;
use crate::store::{self, Db, Direction, LATEST_MANIFEST_KEY};
use crate::ArcProtocolError;

/// One question/answer pair for bulk issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub question_text: String,
    pub answer_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub manifest_size: usize,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct MainHub {
    config: MainHubConfig,
    network: Arc<dyn Network>,
    db: Db,
    cipher: SessionCipher,
    reassembly: ReassemblyBuffer,
}

impl MainHub {
    pub fn new(config: MainHubConfig, network: Arc<dyn Network>, db: Db) -> Result<Self, ArcProtocolError> {
        if config.node_id.is_empty() {
            return Err(ArcProtocolError::Config("main hub node id must not be empty".into()));
        }
        config.capsule.validate()?;
        let cipher = SessionCipher::new(&config.session_key);
        Ok(Self {
            config,
            network,
            db,
            cipher,
            reassembly: ReassemblyBuffer::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &MainHubConfig {
        &self.config
    }

    /// Base64 verify key matching every capsule signature.
    pub fn verify_key(&self) -> String {
        self.config.signing_keys.verify_key_base64()
    }

    // ── Capsules ─────────────────────────────────────────────────────

    /// Signed capsule answering `question`. An existing capsule for the
    /// same question hash is reused.
    pub async fn issue_capsule(&self, question: &str) -> Result<Capsule, ArcProtocolError> {
        let q_hash = question_hash(question);
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        if let Some(existing) = store::fetch_capsule_by_hash(&tx, &q_hash)? {
            return Ok(existing.capsule);
        }
        let capsule = self.sign_new(question, authoritative_answer(question))?;
        store::insert_capsule(&tx, &capsule, Provenance::Authoritative)?;
        refresh_manifest(&tx, &self.config.node_id)?;
        tx.commit()?;
        tracing::info!("{}: issued capsule {} for {q_hash}", self.config.node_id, capsule.capsule_id);
        Ok(capsule)
    }

    /// Issue one fresh capsule per entry.
    pub async fn seed(&self, entries: &[SeedEntry]) -> Result<Vec<Capsule>, ArcProtocolError> {
        let capsules = entries
            .iter()
            .map(|entry| self.sign_new(&entry.question_text, entry.answer_text.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        for capsule in &capsules {
            store::insert_capsule(&tx, capsule, Provenance::Authoritative)?;
        }
        refresh_manifest(&tx, &self.config.node_id)?;
        tx.commit()?;
        tracing::info!("{}: seeded {} capsules", self.config.node_id, capsules.len());
        Ok(capsules)
    }

    fn sign_new(&self, question: &str, answer: String) -> Result<Capsule, ArcProtocolError> {
        let mut capsule = Capsule::new(question, answer, self.config.node_id.clone(), now_ms());
        capsule.sign(&self.config.signing_keys)?;
        Ok(capsule)
    }

    /// Store a capsule and refresh the cached manifest in one transaction.
    pub async fn store_capsule(&self, capsule: &Capsule) -> Result<Manifest, ArcProtocolError> {
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        store::insert_capsule(&tx, capsule, Provenance::Authoritative)?;
        let manifest = refresh_manifest(&tx, &self.config.node_id)?;
        tx.commit()?;
        Ok(manifest)
    }

    pub async fn capsule(&self, capsule_id: &str) -> Result<Option<Capsule>, ArcProtocolError> {
        let conn = self.db.lock().await;
        Ok(store::fetch_capsule(&conn, capsule_id)?.map(|stored| stored.capsule))
    }

    /// Cached manifest, built and stored on first use.
    pub async fn latest_manifest(&self) -> Result<Manifest, ArcProtocolError> {
        let conn = self.db.lock().await;
        if let Some(json) = store::fetch_metadata(&conn, LATEST_MANIFEST_KEY)? {
            match serde_json::from_str(&json) {
                Ok(manifest) => return Ok(manifest),
                Err(e) => tracing::warn!("{}: cached manifest unreadable, rebuilding: {e}", self.config.node_id),
            }
        }
        refresh_manifest(&conn, &self.config.node_id)
    }

    /// Rebuild the manifest and push it to every known edge hub.
    ///
    /// Delivery failures are logged per destination and never abort the
    /// broadcast.
    pub async fn broadcast_manifest(&self) -> Result<BroadcastReport, ArcProtocolError> {
        let manifest = {
            let conn = self.db.lock().await;
            refresh_manifest(&conn, &self.config.node_id)?
        };
        let sealed = HubPayload::Manifest(ManifestPayload {
            manifest: manifest.clone(),
        })
        .seal(&self.cipher)?;

        let mut report = BroadcastReport {
            manifest_size: manifest.len(),
            ..Default::default()
        };
        for hub_id in &self.config.known_mini_hubs {
            let packet = Packet::new(&self.config.node_id, hub_id, PacketMeta::default(), sealed.clone());
            match self.network.send(&self.config.node_id, hub_id, packet).await {
                Ok(sent) if sent.is_ack() => report.delivered.push(hub_id.clone()),
                Ok(sent) => {
                    tracing::warn!(
                        "{}: manifest to {hub_id} not delivered: {}",
                        self.config.node_id,
                        sent.message.as_deref().unwrap_or("NAK")
                    );
                    report.failed.push(hub_id.clone());
                }
                Err(e) => {
                    tracing::warn!("{}: manifest to {hub_id} failed: {e}", self.config.node_id);
                    report.failed.push(hub_id.clone());
                }
            }
        }
        tracing::debug!(
            "{}: manifest broadcast size={} delivered={} failed={}",
            self.config.node_id,
            report.manifest_size,
            report.delivered.len(),
            report.failed.len()
        );
        Ok(report)
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Inbound packet endpoint.
    pub async fn receive_packet(&self, packet: Packet) -> HubAck {
        let assembled = match self.reassembly.accept(&packet) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return HubAck::buffered(),
            Err(e) => {
                tracing::warn!("{}: bad chunk pkt={}: {e}", self.config.node_id, packet.pkt_id);
                return HubAck::nak(e.to_string());
            }
        };
        match self.process_packet(&packet.src_id, &packet.meta, &assembled).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("{}: rejected pkt={} from {}: {e}", self.config.node_id, packet.pkt_id, packet.src_id);
                HubAck::nak(e.to_string())
            }
        }
    }

    /// Act on a fully assembled payload from `src_id`.
    pub async fn process_packet(
        &self,
        src_id: &str,
        meta: &PacketMeta,
        sealed: &[u8],
    ) -> Result<HubAck, ArcProtocolError> {
        match HubPayload::open(&self.cipher, sealed)? {
            HubPayload::Query(query) => self.answer_query(src_id, meta, &query).await,
            HubPayload::UserMessage(MessagePayload { message }) => {
                self.relay_message(src_id, message).await?;
                Ok(HubAck::ack(MESSAGE_RELAYED))
            }
            other => Err(ArcProtocolError::UnsupportedPayload {
                kind: other.kind().to_string(),
            }),
        }
    }

    async fn answer_query(
        &self,
        src_id: &str,
        meta: &PacketMeta,
        query: &QueryPayload,
    ) -> Result<HubAck, ArcProtocolError> {
        let capsule = self.issue_capsule(&query.question).await?;
        let reply_meta = PacketMeta {
            q_hash: Some(capsule.question_hash.clone()),
            priority: meta.priority,
        };
        let sealed = HubPayload::AuthoritativeResponse(AuthoritativePayload {
            capsule,
            confidence: AUTHORITATIVE_CONFIDENCE,
        })
        .seal(&self.cipher)?;
        let reply = Packet::new(&self.config.node_id, src_id, reply_meta, sealed);
        Ok(HubAck::with_reply(RESPONSE_READY, reply))
    }

    /// Store an incoming message and forward a copy to its target hub, or
    /// to every known edge hub except the one it came from.
    async fn relay_message(&self, src_id: &str, mut message: UserMessage) -> Result<Vec<String>, ArcProtocolError> {
        if message.source_hub_id.is_none() {
            message.source_hub_id = Some(src_id.to_string());
        }
        {
            let conn = self.db.lock().await;
            store::insert_message(&conn, &message, Direction::Incoming)?;
        }

        let origin = message.source_hub_id.clone().unwrap_or_else(|| src_id.to_string());
        let targets: Vec<String> = match &message.target_hub_id {
            Some(target) => vec![target.clone()],
            None => self.config.known_mini_hubs.clone(),
        };

        let mut relayed = Vec::new();
        for target in targets.into_iter().filter(|t| *t != origin && t != src_id) {
            let copy = UserMessage {
                target_hub_id: Some(target.clone()),
                ..message.clone()
            };
            let sealed = HubPayload::UserMessage(MessagePayload { message: copy.clone() }).seal(&self.cipher)?;
            let packet = Packet::new(&self.config.node_id, &target, PacketMeta::default(), sealed);
            match self.network.send(&self.config.node_id, &target, packet).await {
                Ok(sent) if sent.is_ack() => {
                    let conn = self.db.lock().await;
                    store::insert_message(&conn, &copy, Direction::Outgoing)?;
                    relayed.push(target);
                }
                Ok(sent) => tracing::warn!(
                    "{}: relay of {} to {target} not delivered: {}",
                    self.config.node_id,
                    message.message_id,
                    sent.message.as_deref().unwrap_or("NAK")
                ),
                Err(e) => tracing::warn!(
                    "{}: relay of {} to {target} failed: {e}",
                    self.config.node_id,
                    message.message_id
                ),
            }
        }
        Ok(relayed)
    }

    pub async fn messages(
        &self,
        direction: Option<Direction>,
        limit: usize,
    ) -> Result<Vec<store::StoredMessage>, ArcProtocolError> {
        let conn = self.db.lock().await;
        Ok(store::fetch_messages(&conn, direction, None, limit)?)
    }
}

/// Build the manifest from every stored capsule and cache it.
fn refresh_manifest(conn: &Connection, node_id: &str) -> Result<Manifest, ArcProtocolError> {
    let capsules = store::all_capsules(conn)?;
    let manifest = Manifest::build(node_id, &capsules, now_ms());
    let json = serde_json::to_string(&manifest).map_err(|e| ArcProtocolError::Serialization(e.to_string()))?;
    store::upsert_metadata(conn, LATEST_MANIFEST_KEY, &json)?;
    Ok(manifest)
}

#[async_trait::async_trait]
impl PacketSink for MainHub {
    async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError> {
        Ok(self.receive_packet(packet).await)
    }
}

#[async_trait::async_trait]
impl AuthorityApi for MainHub {
    async fn fetch_manifest(&self) -> Result<Manifest, ArcProtocolError> {
        self.latest_manifest().await
    }

    async fn fetch_capsule(&self, capsule_id: &str) -> Result<Capsule, ArcProtocolError> {
        self.capsule(capsule_id)
            .await?
            .ok_or_else(|| ArcProtocolError::NotFound(format!("capsule {capsule_id}")))
    }

    async fn fetch_verify_key(&self) -> Result<String, ArcProtocolError> {
        Ok(self.verify_key())
    }
}
