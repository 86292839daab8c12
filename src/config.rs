use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Exact,
    Ann,
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMethod::Exact => write!(f, "exact"),
            SearchMethod::Ann => write!(f, "ann"),
        }
    }
}

/// Knobs for the on-disk vector index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub search_method: SearchMethod,
    pub ann_num_projections: usize,
    pub ann_num_tables: usize,
    pub map_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            search_method: SearchMethod::Exact,
            ann_num_projections: 12,
            ann_num_tables: 4,
            map_size: 1024 * 1024 * 1024,
        }
    }
}

/// Knobs for user-scoped retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub over_fetch_factor: usize,
    pub max_widen_rounds: usize,
    pub user_scope_prefix: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            over_fetch_factor: 2,
            max_widen_rounds: 2,
            user_scope_prefix: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub index_dir: PathBuf,
    pub transactions_path: PathBuf,
    pub dimensions: usize,
    pub top_k: usize,
    pub max_top_k: usize,
    pub search_method: SearchMethod,
    pub ann_num_projections: usize,
    pub ann_num_tables: usize,
    pub over_fetch_factor: usize,
    pub max_widen_rounds: usize,
    pub retry_batch_size: usize,
    pub retry_max_attempts: usize,
    pub retry_pause_ms: u64,
    pub map_size_mb: usize,
    pub user_scope_prefix: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("finrag_store"),
            transactions_path: PathBuf::from("transactions.jsonl"),
            dimensions: 256,
            top_k: 10,
            max_top_k: 100,
            search_method: SearchMethod::Exact,
            ann_num_projections: 12,
            ann_num_tables: 4,
            over_fetch_factor: 2,
            max_widen_rounds: 2,
            retry_batch_size: 10,
            retry_max_attempts: 3,
            retry_pause_ms: 500,
            map_size_mb: 1024,
            user_scope_prefix: true,
        }
    }
}

impl Settings {
    /// Reads `finrag_config.*` from the working directory, then `FINRAG_*`
    /// environment variables on top of it.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(ConfigFile::with_name("finrag_config").required(false))
            .add_source(Environment::with_prefix("FINRAG").try_parsing(true))
            .build()
            .context("Failed to read finrag configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Invalid finrag configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 || self.dimensions % 8 != 0 {
            anyhow::bail!("FINRAG_DIMENSIONS must be a positive multiple of 8.");
        }
        if self.retry_batch_size == 0 {
            anyhow::bail!("FINRAG_RETRY_BATCH_SIZE must be at least 1.");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("FINRAG_RETRY_MAX_ATTEMPTS must be at least 1.");
        }
        if self.over_fetch_factor == 0 {
            anyhow::bail!("FINRAG_OVER_FETCH_FACTOR must be at least 1.");
        }
        if self.ann_num_projections == 0 || self.ann_num_projections > 63 {
            anyhow::bail!("FINRAG_ANN_NUM_PROJECTIONS must be between 1 and 63.");
        }
        if self.ann_num_tables == 0 {
            anyhow::bail!("FINRAG_ANN_NUM_TABLES must be at least 1.");
        }
        Ok(())
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            search_method: self.search_method,
            ann_num_projections: self.ann_num_projections,
            ann_num_tables: self.ann_num_tables,
            map_size: self.map_size_mb * 1024 * 1024,
        }
    }

    pub fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            over_fetch_factor: self.over_fetch_factor,
            max_widen_rounds: self.max_widen_rounds,
            user_scope_prefix: self.user_scope_prefix,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_batch_size,
            self.retry_max_attempts,
            Duration::from_millis(self.retry_pause_ms),
        )
    }

    pub fn print_config(&self) {
        println!("index_dir={}", self.index_dir.display());
        println!("transactions_path={}", self.transactions_path.display());
        println!("dimensions={}", self.dimensions);
        println!("top_k={}", self.top_k);
        println!("max_top_k={}", self.max_top_k);
        println!("search_method={}", self.search_method);
        println!("ann_num_projections={}", self.ann_num_projections);
        println!("ann_num_tables={}", self.ann_num_tables);
        println!("over_fetch_factor={}", self.over_fetch_factor);
        println!("max_widen_rounds={}", self.max_widen_rounds);
        println!("retry_batch_size={}", self.retry_batch_size);
        println!("retry_max_attempts={}", self.retry_max_attempts);
        println!("retry_pause_ms={}", self.retry_pause_ms);
        println!("map_size_mb={}", self.map_size_mb);
        println!("user_scope_prefix={}", self.user_scope_prefix);
    }
}
