//! User-scoped nearest-neighbour lookup over the shared vector index.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{Number, RetrievalOptions};
use crate::database::{SearchHit, VectorStore};
use crate::document::format_line;
use crate::embedding::Embedder;
use crate::error::ProviderError;

/// A retrieved transaction with its metadata coerced back to native types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMatch {
    pub id: i64,
    pub user_id: i64,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub category: String,
    pub amount: f64,
    pub note: String,
    /// Cosine distance to the query; lower is closer.
    pub score: Number,
}

impl TransactionMatch {
    fn from_hit(hit: &SearchHit) -> Option<Self> {
        let metadata = &hit.entry.metadata;
        Some(Self {
            id: metadata.id.trim().parse().ok()?,
            user_id: metadata.user_id.trim().parse().ok()?,
            date: metadata.date.clone(),
            kind: metadata.kind.clone(),
            category: metadata.category.clone(),
            amount: metadata.amount.trim().parse().unwrap_or(0.0),
            note: metadata.note.clone(),
            score: hit.distance,
        })
    }

    /// Same canonical line the indexer embeds.
    pub fn context_line(&self) -> String {
        format_line(
            &self.id.to_string(),
            &self.user_id.to_string(),
            &self.date,
            &self.kind,
            &self.category,
            self.amount,
            &self.note,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Retriever {
    options: RetrievalOptions,
}

impl Retriever {
    pub fn new(options: RetrievalOptions) -> Self {
        Self { options }
    }

    fn scoped_query(&self, user_id: i64, query: &str) -> String {
        if self.options.user_scope_prefix {
            format!("user:{user_id} {query}")
        } else {
            query.to_string()
        }
    }

    /// Up to `top_k` distinct transactions owned by `user_id`, closest first.
    ///
    /// The index is searched for `top_k * over_fetch_factor` neighbours; when
    /// filtering leaves fewer than `top_k` and the index has more to give, the
    /// fetch size doubles for up to `max_widen_rounds` more searches.
    pub fn retrieve(
        &self,
        index: &dyn VectorStore,
        embedder: &dyn Embedder,
        user_id: i64,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<TransactionMatch>, ProviderError> {
        if top_k == 0 || index.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = embedder.embed_one(&self.scoped_query(user_id, query))?;
        let total = index.len();
        let mut fetch = top_k.saturating_mul(self.options.over_fetch_factor).max(top_k);
        let mut round = 0;

        loop {
            let hits = index.search(&query_embedding, fetch);
            let matches = self.filter_hits(&hits, user_id, top_k);
            let exhausted = fetch >= total || round >= self.options.max_widen_rounds;
            if matches.len() >= top_k || exhausted {
                log::info!(
                    "retrieved {} matches for user_id={user_id} (fetched {fetch} of {total}) query='{}'",
                    matches.len(),
                    query.chars().take(60).collect::<String>()
                );
                return Ok(matches);
            }
            round += 1;
            fetch = fetch.saturating_mul(2).min(total);
            log::debug!("widening search for user_id={user_id} to k={fetch}");
        }
    }

    fn filter_hits(&self, hits: &[SearchHit], user_id: i64, top_k: usize) -> Vec<TransactionMatch> {
        let mut seen = HashSet::new();
        let mut matches = Vec::with_capacity(top_k);
        for hit in hits {
            let Some(candidate) = TransactionMatch::from_hit(hit) else {
                log::warn!(
                    "skipping entry with unparsable metadata id={:?} user_id={:?}",
                    hit.entry.metadata.id,
                    hit.entry.metadata.user_id
                );
                continue;
            };
            if candidate.user_id != user_id || !seen.insert(candidate.id) {
                continue;
            }
            matches.push(candidate);
            if matches.len() >= top_k {
                break;
            }
        }
        matches
    }
}
