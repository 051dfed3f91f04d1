/// Manifest gossip reconciliation (edge side).
///
/// One cycle walks `Idle → Polling → Diffing → Fetching → Verifying →
/// Ingesting → Idle`. Per-capsule failures are logged and skipped; the
/// next cycle picks up whatever is still missing.
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::capsule::{Capsule, Provenance};
use crate::manifest::Manifest;
use crate::store::{self, Db, LATEST_MANIFEST_KEY};
use crate::ArcProtocolError;

/// Read side of the authority, as seen by an edge hub.
#[async_trait::async_trait]
pub trait AuthorityApi: Send + Sync {
    async fn fetch_manifest(&self) -> Result<Manifest, ArcProtocolError>;

    /// Full capsule by id. `NotFound` if the authority does not hold it.
    async fn fetch_capsule(&self, capsule_id: &str) -> Result<Capsule, ArcProtocolError>;

    /// Base64 Ed25519 verify key.
    async fn fetch_verify_key(&self) -> Result<String, ArcProtocolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    Idle,
    Polling,
    Diffing,
    Fetching,
    Verifying,
    Ingesting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Ids listed by the manifest but not held locally at diff time.
    pub missing: usize,
    pub ingested: Vec<String>,
    /// Fetched but failed verification.
    pub rejected: Vec<String>,
    /// Could not be fetched this cycle.
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.rejected.is_empty() && self.failed.is_empty()
    }
}

/// Resets the phase to `Idle` however a cycle ends.
struct PhaseGuard<'a>(&'a Mutex<ReconcilePhase>);

impl PhaseGuard<'_> {
    fn enter(&self, phase: ReconcilePhase) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.enter(ReconcilePhase::Idle);
    }
}

pub struct ManifestReconciler {
    node_id: String,
    db: Db,
    authority: Arc<dyn AuthorityApi>,
    configured_key: Option<String>,
    fetched_key: tokio::sync::Mutex<Option<String>>,
    phase: Mutex<ReconcilePhase>,
}

impl ManifestReconciler {
    pub fn new(
        node_id: impl Into<String>,
        db: Db,
        authority: Arc<dyn AuthorityApi>,
        verify_key: Option<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            db,
            authority,
            configured_key: verify_key,
            fetched_key: tokio::sync::Mutex::new(None),
            phase: Mutex::new(ReconcilePhase::Idle),
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured verify key, else the one published by the authority
    /// (fetched once, then cached).
    pub async fn verify_key(&self) -> Result<String, ArcProtocolError> {
        if let Some(key) = &self.configured_key {
            return Ok(key.clone());
        }
        let mut cached = self.fetched_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }
        let key = self.authority.fetch_verify_key().await.map_err(|e| {
            ArcProtocolError::authority(format!("verify key unavailable: {e}"))
        })?;
        tracing::info!("{}: fetched authority verify key", self.node_id);
        *cached = Some(key.clone());
        Ok(key)
    }

    /// Poll the authority's manifest and reconcile against it.
    pub async fn run_cycle(&self) -> Result<ReconcileReport, ArcProtocolError> {
        let guard = PhaseGuard(&self.phase);
        guard.enter(ReconcilePhase::Polling);
        let manifest = self.authority.fetch_manifest().await?;
        drop(guard);
        self.sync_manifest(&manifest).await
    }

    /// Pull, verify and ingest every capsule `manifest` lists that is not
    /// held locally.
    pub async fn sync_manifest(&self, manifest: &Manifest) -> Result<ReconcileReport, ArcProtocolError> {
        manifest.validate()?;
        let guard = PhaseGuard(&self.phase);
        guard.enter(ReconcilePhase::Diffing);

        let missing: Vec<String> = {
            let conn = self.db.lock().await;
            let json = serde_json::to_string(manifest)
                .map_err(|e| ArcProtocolError::Serialization(e.to_string()))?;
            store::upsert_metadata(&conn, LATEST_MANIFEST_KEY, &json)?;
            let local = store::capsule_ids(&conn)?;
            manifest.missing(&local).into_iter().map(String::from).collect()
        };

        let mut report = ReconcileReport {
            missing: missing.len(),
            ..Default::default()
        };
        if missing.is_empty() {
            tracing::debug!("{}: manifest {} fully held", self.node_id, manifest.node_id);
            return Ok(report);
        }

        let verify_key = self.verify_key().await?;
        tracing::info!(
            "{}: reconciling {} missing capsules from {}",
            self.node_id,
            missing.len(),
            manifest.node_id
        );

        for capsule_id in missing {
            guard.enter(ReconcilePhase::Fetching);
            let capsule = match self.authority.fetch_capsule(&capsule_id).await {
                Ok(capsule) => capsule,
                Err(e) => {
                    tracing::warn!("{}: fetch of capsule {capsule_id} failed: {e}", self.node_id);
                    report.failed.push(capsule_id);
                    continue;
                }
            };

            guard.enter(ReconcilePhase::Verifying);
            if capsule.capsule_id != capsule_id
                || !manifest.matches(&capsule)
                || !capsule.verify(&verify_key)
            {
                tracing::error!(
                    "{}: capsule {capsule_id} failed verification, discarded",
                    self.node_id
                );
                report.rejected.push(capsule_id);
                continue;
            }

            guard.enter(ReconcilePhase::Ingesting);
            let inserted = {
                let conn = self.db.lock().await;
                store::ingest_capsule(&conn, &capsule, Provenance::Manifest)
            };
            match inserted {
                Ok(true) => report.ingested.push(capsule_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("{}: ingest of capsule {capsule_id} failed: {e}", self.node_id);
                    report.failed.push(capsule_id);
                }
            }
        }

        tracing::info!(
            "{}: reconcile done ingested={} rejected={} failed={}",
            self.node_id,
            report.ingested.len(),
            report.rejected.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

// ── Mock authority (tests) ──────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use crate::crypto::SigningKeypair;

    /// In-memory authority holding a fixed capsule set.
    pub struct StaticAuthority {
        pub keys: SigningKeypair,
        capsules: Mutex<Vec<Capsule>>,
        unreachable: Mutex<HashSet<String>>,
        tampered: Mutex<HashMap<String, Capsule>>,
        pub key_fetches: Mutex<usize>,
    }

    impl StaticAuthority {
        pub fn new() -> Self {
            Self {
                keys: SigningKeypair::from_seed(&[9u8; 32]),
                capsules: Mutex::new(Vec::new()),
                unreachable: Mutex::new(HashSet::new()),
                tampered: Mutex::new(HashMap::new()),
                key_fetches: Mutex::new(0),
            }
        }

        pub fn issue(&self, question: &str, ts: u64) -> Capsule {
            let mut capsule = Capsule::new(question, format!("answer to {question}"), "main-hub", ts);
            capsule.sign(&self.keys).unwrap();
            self.capsules.lock().unwrap().push(capsule.clone());
            capsule
        }

        pub fn make_unreachable(&self, capsule_id: &str) {
            self.unreachable.lock().unwrap().insert(capsule_id.to_string());
        }

        pub fn restore(&self) {
            self.unreachable.lock().unwrap().clear();
        }

        /// Serve an altered copy of `capsule_id` from now on.
        pub fn tamper(&self, capsule_id: &str) {
            let capsules = self.capsules.lock().unwrap();
            let mut altered = capsules
                .iter()
                .find(|c| c.capsule_id == capsule_id)
                .unwrap()
                .clone();
            altered.answer_text.push_str(" (edited)");
            self.tampered.lock().unwrap().insert(capsule_id.to_string(), altered);
        }

        pub fn manifest(&self) -> Manifest {
            Manifest::build("main-hub", &self.capsules.lock().unwrap(), 1)
        }
    }

    #[async_trait::async_trait]
    impl AuthorityApi for StaticAuthority {
        async fn fetch_manifest(&self) -> Result<Manifest, ArcProtocolError> {
            Ok(self.manifest())
        }

        async fn fetch_capsule(&self, capsule_id: &str) -> Result<Capsule, ArcProtocolError> {
            if self.unreachable.lock().unwrap().contains(capsule_id) {
                return Err(ArcProtocolError::authority("mock: connection reset"));
            }
            if let Some(altered) = self.tampered.lock().unwrap().get(capsule_id) {
                return Ok(altered.clone());
            }
            self.capsules
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.capsule_id == capsule_id)
                .cloned()
                .ok_or_else(|| ArcProtocolError::NotFound(capsule_id.to_string()))
        }

        async fn fetch_verify_key(&self) -> Result<String, ArcProtocolError> {
            *self.key_fetches.lock().unwrap() += 1;
            Ok(self.keys.verify_key_base64())
        }
    }
}
