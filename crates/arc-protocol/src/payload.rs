/// Typed payloads carried (sealed) inside packets.
///
/// On the wire each payload is a JSON object discriminated by `"type"`.
use serde::{Deserialize, Serialize};

use crate::capsule::Capsule;
use crate::crypto::SessionCipher;
use crate::manifest::Manifest;
use crate::ArcProtocolError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub user_id: String,
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativePayload {
    pub capsule: Capsule,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub manifest: Manifest,
}

/// A user-to-user message relayed between hubs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub content: String,
    pub timestamp: u64,
    #[serde(default)]
    pub source_hub_id: Option<String>,
    #[serde(default)]
    pub target_hub_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: UserMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubPayload {
    Query(QueryPayload),
    AuthoritativeResponse(AuthoritativePayload),
    Manifest(ManifestPayload),
    UserMessage(MessagePayload),
}

const KNOWN_KINDS: [&str; 4] = ["query", "authoritative_response", "manifest", "user_message"];

impl HubPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            HubPayload::Query(_) => "query",
            HubPayload::AuthoritativeResponse(_) => "authoritative_response",
            HubPayload::Manifest(_) => "manifest",
            HubPayload::UserMessage(_) => "user_message",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ArcProtocolError> {
        serde_json::to_vec(self).map_err(|e| ArcProtocolError::Serialization(e.to_string()))
    }

    /// Parse a payload. Unknown or missing `type` is `UnsupportedPayload`.
    pub fn from_json(data: &[u8]) -> Result<Self, ArcProtocolError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<missing>");
        if !KNOWN_KINDS.contains(&kind) {
            return Err(ArcProtocolError::UnsupportedPayload {
                kind: kind.to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize and seal into `nonce ++ ciphertext`.
    pub fn seal(&self, cipher: &SessionCipher) -> Result<Vec<u8>, ArcProtocolError> {
        cipher.seal_bytes(&self.to_json()?)
    }

    /// Open sealed bytes and parse the payload inside.
    pub fn open(cipher: &SessionCipher, sealed: &[u8]) -> Result<Self, ArcProtocolError> {
        Self::from_json(&cipher.open_bytes(sealed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    fn query() -> HubPayload {
        HubPayload::Query(QueryPayload {
            user_id: "u1".into(),
            question: "How far is the well?".into(),
            context: None,
        })
    }

    #[test]
    fn type_tag_on_the_wire() {
        let json: serde_json::Value = serde_json::from_slice(&query().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "query");
        assert_eq!(json["question"], "How far is the well?");
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let err = HubPayload::from_json(br#"{"type":"telemetry","x":1}"#).unwrap_err();
        assert!(matches!(err, ArcProtocolError::UnsupportedPayload { kind } if kind == "telemetry"));
    }

    #[test]
    fn missing_type_is_unsupported() {
        let err = HubPayload::from_json(br#"{"question":"q"}"#).unwrap_err();
        assert!(matches!(err, ArcProtocolError::UnsupportedPayload { .. }));
    }

    #[test]
    fn malformed_known_type_is_deserialization_error() {
        let err = HubPayload::from_json(br#"{"type":"query"}"#).unwrap_err();
        assert!(matches!(err, ArcProtocolError::Deserialization(_)));
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = SessionCipher::new(&SessionKey::default());
        let message = HubPayload::UserMessage(MessagePayload {
            message: UserMessage {
                message_id: "m1".into(),
                sender_id: "alice".into(),
                recipient_id: Some("bob".into()),
                content: "water at dawn".into(),
                timestamp: 7,
                source_hub_id: Some("mini-hub-1".into()),
                target_hub_id: None,
            },
        });
        let sealed = message.seal(&cipher).unwrap();
        let opened = HubPayload::open(&cipher, &sealed).unwrap();
        assert_eq!(opened, message);
        assert_eq!(opened.kind(), "user_message");
    }
}
