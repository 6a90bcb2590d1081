//! Typed errors for backend clients and the vector store.
//!
//! Backend clients (embedding, generation, reranking, web search) return
//! `Result<T, BackendError>` so each caller decides explicitly how to
//! degrade. Higher layers wrap these in `anyhow::Error` with context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("{0} is disabled")]
    Disabled(String),
}

impl BackendError {
    pub fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn decode(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request could succeed (network, 429, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode { .. } | Self::Disabled(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection '{collection}' was created with metric '{existing}', not '{requested}'")]
    MetricMismatch {
        collection: String,
        existing: String,
        requested: String,
    },

    #[error("upsert batch has {ids} ids, {texts} texts and {metadata} metadata entries")]
    LengthMismatch {
        ids: usize,
        texts: usize,
        metadata: usize,
    },

    #[error("collection '{collection}' holds {expected}-dimensional vectors, got {got}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        got: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let rate_limited = BackendError::Status {
            endpoint: "e".into(),
            status: 429,
            body: String::new(),
        };
        let server = BackendError::Status {
            endpoint: "e".into(),
            status: 503,
            body: String::new(),
        };
        let client = BackendError::Status {
            endpoint: "e".into(),
            status: 404,
            body: String::new(),
        };
        assert!(rate_limited.is_transient());
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!BackendError::decode("e", "bad json").is_transient());
    }

    #[test]
    fn test_display_includes_status_and_body() {
        let err = BackendError::Status {
            endpoint: "http://localhost:11434/api/generate".into(),
            status: 500,
            body: "model not loaded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("model not loaded"));
    }
}
