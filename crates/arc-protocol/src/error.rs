/// Protocol-level errors for ARC-AI hubs.
///
/// Wraps transport errors and adds protocol-specific variants
/// (crypto, signatures, payload dispatch, storage).
#[derive(Debug, thiserror::Error)]
pub enum ArcProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] arc_transport::TransportError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unsupported payload type: {kind}")]
    UnsupportedPayload { kind: String },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("authority unavailable: {reason}")]
    Authority { reason: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl ArcProtocolError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        ArcProtocolError::Protocol {
            reason: reason.into(),
        }
    }

    pub fn authority(reason: impl Into<String>) -> Self {
        ArcProtocolError::Authority {
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for ArcProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ArcProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ArcProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ArcProtocolError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ArcProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ArcProtocolError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_crypto() {
        let err = ArcProtocolError::Crypto("decryption failed".into());
        assert_eq!(err.to_string(), "crypto error: decryption failed");
    }

    #[test]
    fn test_display_invalid_signature() {
        let err = ArcProtocolError::InvalidSignature;
        assert_eq!(err.to_string(), "signature verification failed");
    }

    #[test]
    fn test_display_unsupported_payload() {
        let err = ArcProtocolError::UnsupportedPayload {
            kind: "telemetry".into(),
        };
        assert_eq!(err.to_string(), "unsupported payload type: telemetry");
    }

    #[test]
    fn test_display_protocol() {
        let err = ArcProtocolError::protocol("chunked reply in ACK");
        assert_eq!(err.to_string(), "protocol violation: chunked reply in ACK");
    }

    #[test]
    fn test_transport_wraps() {
        let err: ArcProtocolError = arc_transport::TransportError::NotRegistered {
            node_id: "main-hub".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "transport error: destination not registered: main-hub"
        );
    }
}
