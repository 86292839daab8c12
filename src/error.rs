//! Error types for the retrieval and answering engine.

/// Failures reported by the embedding or generation capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Backoff signal from the provider; worth retrying with smaller batches.
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    /// Provider could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Any other provider-side failure.
    #[error("provider failed: {0}")]
    Failed(String),
    /// Provider returned vectors of the wrong shape.
    #[error("provider returned {got} vectors of dimension {dimension}, expected {expected}")]
    DimensionMismatch {
        expected: usize,
        dimension: usize,
        got: usize,
    },
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

/// Failures of the vector index and its persistence.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),
    #[error("entry codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Bad caller input (empty query, out-of-range `top_k`); never retried.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The transaction store collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),
}
