/// Errors returned by the ARC-AI transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("destination not registered: {node_id}")]
    NotRegistered { node_id: String },

    #[error("invalid chunk size: {size} (must be positive)")]
    InvalidChunkSize { size: usize },

    #[error("chunk {index} exceeds maximum size: {size} bytes (max {max})")]
    ChunkTooLarge { index: u32, size: usize, max: usize },

    #[error("missing chunks for reassembly: have {received} of {expected}")]
    MissingChunks { expected: u32, received: usize },

    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidChunkPosition { index: u32, total: u32 },

    #[error("chunk count mismatch for {pkt_id}: expected {expected}, got {actual}")]
    ChunkCountMismatch {
        pkt_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Delivery(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_not_registered() {
        let err = TransportError::NotRegistered {
            node_id: "mh1".into(),
        };
        assert_eq!(err.to_string(), "destination not registered: mh1");
    }

    #[test]
    fn display_missing_chunks() {
        let err = TransportError::MissingChunks {
            expected: 3,
            received: 2,
        };
        assert_eq!(err.to_string(), "missing chunks for reassembly: have 2 of 3");
    }

    #[test]
    fn display_chunk_too_large() {
        let err = TransportError::ChunkTooLarge {
            index: 1,
            size: 900,
            max: 800,
        };
        assert_eq!(
            err.to_string(),
            "chunk 1 exceeds maximum size: 900 bytes (max 800)"
        );
    }
}
