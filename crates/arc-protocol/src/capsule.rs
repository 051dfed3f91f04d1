/// Knowledge capsules: signed question/answer records issued by the authority.
///
/// The signing payload is the capsule as a JSON object without its
/// `signature` field, keys sorted, compact separators, UTF-8. Signer and
/// verifier both go through [`Capsule::canonical_bytes`].
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{verify_signature, SigningKeypair};
use crate::ArcProtocolError;

/// Sentinel signature carried by locally synthesized fallback capsules.
pub const FALLBACK_SIGNATURE: &str = "fallback";

pub const FALLBACK_CONFIDENCE: f64 = 0.15;
pub const AUTHORITATIVE_CONFIDENCE: f64 = 0.92;
pub const CACHE_HIT_CONFIDENCE: f64 = 0.88;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub capsule_id: String,
    pub question_hash: String,
    pub question_text: String,
    pub answer_text: String,
    #[serde(default)]
    pub compressed_embedding: Option<String>,
    pub source_id: String,
    /// Issue time (Unix milliseconds).
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl Capsule {
    /// Unsigned capsule for `question`, with a fresh id.
    pub fn new(
        question: &str,
        answer_text: impl Into<String>,
        source_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            capsule_id: uuid::Uuid::new_v4().simple().to_string(),
            question_hash: question_hash(question),
            question_text: question.to_string(),
            answer_text: answer_text.into(),
            compressed_embedding: None,
            source_id: source_id.into(),
            timestamp,
            signature: String::new(),
        }
    }

    /// Locally synthesized answer used when the authority is unreachable.
    pub fn fallback(question: &str, source_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            capsule_id: format!("fallback-{}", uuid::Uuid::new_v4().simple()),
            signature: FALLBACK_SIGNATURE.to_string(),
            ..Self::new(question, fallback_answer(question), source_id, timestamp)
        }
    }

    /// Sorted, compact JSON of every field except `signature`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ArcProtocolError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ArcProtocolError::Serialization(e.to_string()))?;
        let serde_json::Value::Object(fields) = value else {
            return Err(ArcProtocolError::Serialization("capsule is not an object".into()));
        };
        let sorted: BTreeMap<String, serde_json::Value> = fields
            .into_iter()
            .filter(|(key, _)| key != "signature")
            .collect();
        serde_json::to_vec(&sorted).map_err(|e| ArcProtocolError::Serialization(e.to_string()))
    }

    /// Clear the signature, canonicalize, sign, store the result.
    pub fn sign(&mut self, keys: &SigningKeypair) -> Result<(), ArcProtocolError> {
        self.signature.clear();
        let payload = self.canonical_bytes()?;
        self.signature = keys.sign(&payload);
        Ok(())
    }

    /// Check the signature against the authority's base64 verify key.
    ///
    /// Fallback capsules never verify.
    pub fn verify(&self, verify_key_b64: &str) -> bool {
        if self.is_fallback() {
            return false;
        }
        match self.canonical_bytes() {
            Ok(payload) => verify_signature(&payload, &self.signature, verify_key_b64),
            Err(_) => false,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.signature == FALLBACK_SIGNATURE
    }

    /// Manifest digest: hex SHA-256 of `capsule_id::answer_text::signature`.
    pub fn digest(&self) -> String {
        let source = format!("{}::{}::{}", self.capsule_id, self.answer_text, self.signature);
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    pub fn is_fresh(&self, now_ms: u64, ttl_days: u64) -> bool {
        let ttl_ms = ttl_days.saturating_mul(24 * 60 * 60 * 1000);
        now_ms.saturating_sub(self.timestamp) <= ttl_ms
    }
}

/// How a locally stored capsule was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Direct reply from the authority to a query.
    Authoritative,
    /// Pulled during manifest reconciliation.
    Manifest,
    /// Synthesized locally, never authoritative.
    Fallback,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Authoritative => "authoritative",
            Provenance::Manifest => "manifest",
            Provenance::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for Provenance {
    type Err = ArcProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authoritative" => Ok(Provenance::Authoritative),
            "manifest" => Ok(Provenance::Manifest),
            "fallback" => Ok(Provenance::Fallback),
            other => Err(ArcProtocolError::Deserialization(format!(
                "unknown provenance: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Question hashing and canned answers ─────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of the trimmed, lower-cased question.
pub fn question_hash(question: &str) -> String {
    sha256_hex(question.trim().to_lowercase().as_bytes())
}

pub fn fallback_answer(question: &str) -> String {
    let digest = sha256_hex(question.as_bytes());
    format!(
        "[Fallback:{}] Unable to reach main hub. Providing interim guidance.",
        &digest[..6]
    )
}

/// Deterministic stand-in for the authority's answer engine.
pub fn authoritative_answer(question: &str) -> String {
    let digest = sha256_hex(question.as_bytes());
    let reversed: String = question.chars().rev().collect();
    format!("[ARC-AI authoritative:{}] {reversed}", &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(keys: &SigningKeypair) -> Capsule {
        let mut capsule = Capsule::new("How do I purify water?", "Boil it.", "main-hub", 1_700_000_000_000);
        capsule.sign(keys).unwrap();
        capsule
    }

    #[test]
    fn canonical_bytes_sorted_without_signature() {
        let capsule = Capsule {
            capsule_id: "c1".into(),
            question_hash: "h".into(),
            question_text: "q".into(),
            answer_text: "a".into(),
            compressed_embedding: None,
            source_id: "main-hub".into(),
            timestamp: 5,
            signature: "sig".into(),
        };
        let text = String::from_utf8(capsule.canonical_bytes().unwrap()).unwrap();
        assert_eq!(
            text,
            r#"{"answer_text":"a","capsule_id":"c1","compressed_embedding":null,"question_hash":"h","question_text":"q","source_id":"main-hub","timestamp":5}"#
        );
    }

    #[test]
    fn signature_does_not_affect_canonical_form() {
        let keys = SigningKeypair::generate();
        let mut capsule = signed(&keys);
        let before = capsule.canonical_bytes().unwrap();
        capsule.signature = "other".into();
        assert_eq!(capsule.canonical_bytes().unwrap(), before);
    }

    #[test]
    fn signed_capsule_verifies() {
        let keys = SigningKeypair::generate();
        let capsule = signed(&keys);
        assert!(!capsule.signature.is_empty());
        assert!(capsule.verify(&keys.verify_key_base64()));
    }

    #[test]
    fn tampered_answer_fails() {
        let keys = SigningKeypair::generate();
        let mut capsule = signed(&keys);
        capsule.answer_text.push('!');
        assert!(!capsule.verify(&keys.verify_key_base64()));
    }

    #[test]
    fn fallback_never_verifies() {
        let keys = SigningKeypair::generate();
        let capsule = Capsule::fallback("help", "mini-hub-1", 1);
        assert!(capsule.is_fallback());
        assert!(capsule.capsule_id.starts_with("fallback-"));
        assert!(!capsule.verify(&keys.verify_key_base64()));
        assert!(capsule.answer_text.starts_with("[Fallback:"));
        assert!(capsule
            .answer_text
            .ends_with("] Unable to reach main hub. Providing interim guidance."));
    }

    #[test]
    fn question_hash_normalizes() {
        assert_eq!(question_hash("  Water? "), question_hash("water?"));
        assert_ne!(question_hash("water"), question_hash("fire"));
        assert_eq!(question_hash("x").len(), 64);
    }

    #[test]
    fn authoritative_answer_reverses_question() {
        let answer = authoritative_answer("abc");
        assert!(answer.starts_with("[ARC-AI authoritative:"));
        assert!(answer.ends_with("] cba"));
        // prefix + 8 hex + "] " + question
        assert_eq!(answer.len(), "[ARC-AI authoritative:".len() + 8 + 2 + 3);
    }

    #[test]
    fn digest_covers_id_answer_signature() {
        let keys = SigningKeypair::generate();
        let capsule = signed(&keys);
        let expected = hex::encode(Sha256::digest(
            format!("{}::{}::{}", capsule.capsule_id, capsule.answer_text, capsule.signature).as_bytes(),
        ));
        assert_eq!(capsule.digest(), expected);
    }

    #[test]
    fn freshness_window() {
        let day = 24 * 60 * 60 * 1000;
        let capsule = Capsule::new("q", "a", "main-hub", 10 * day);
        assert!(capsule.is_fresh(10 * day + 89 * day, 90));
        assert!(!capsule.is_fresh(10 * day + 91 * day, 90));
    }

    #[test]
    fn provenance_string_roundtrip() {
        for p in [Provenance::Authoritative, Provenance::Manifest, Provenance::Fallback] {
            assert_eq!(p.as_str().parse::<Provenance>().unwrap(), p);
        }
        assert!("other".parse::<Provenance>().is_err());
    }
}
