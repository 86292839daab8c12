//! Embedding capability consumed by the indexer and retriever.

use sha2::{Digest, Sha256};

use crate::config::Number;
use crate::error::ProviderError;
use crate::vector_ops::normalize_vector;

/// Maps texts to fixed-dimension vectors. Calls are blocking and batched.
pub trait Embedder: Send + Sync {
    /// Identifier persisted as the index fingerprint.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, ProviderError>;

    fn embed_one(&self, text: &str) -> Result<Vec<Number>, ProviderError> {
        let mut vectors = self.embed(&[text.to_string()])?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(ProviderError::Failed(
                "expected exactly one embedding".to_string(),
            )),
        }
    }
}

/// Checks a provider response against the requested batch before it reaches the index.
pub fn check_batch(
    embedder: &dyn Embedder,
    requested: usize,
    vectors: &[Vec<Number>],
) -> Result<(), ProviderError> {
    let expected = embedder.dimensions();
    let bad_dimension = vectors.iter().find(|v| v.len() != expected).map(Vec::len);
    if vectors.len() != requested || bad_dimension.is_some() {
        return Err(ProviderError::DimensionMismatch {
            expected,
            dimension: bad_dimension.unwrap_or(expected),
            got: vectors.len(),
        });
    }
    Ok(())
}

/// Offline embedder: each lower-cased token is hashed with SHA-256 into one of
/// `dimensions` signed buckets, then the vector is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model_id: format!("hashing-sha256-d{dimensions}"),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<Number> {
        let mut vector = vec![0.0; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_vector(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}
