//! Retrieval-augmented answers over a user's personal finance transactions.

pub mod ann;
pub mod config;
pub mod database;
pub mod document;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod generation;
pub mod orchestrator;
pub mod retriever;
pub mod retry;
pub mod storage;
pub mod synthesizer;
pub mod vector_ops;

pub use config::Settings;
pub use database::{IndexStats, VectorIndex, VectorStore};
pub use document::{IndexedDocument, TransactionRecord, TransactionType};
pub use embedding::{Embedder, HashingEmbedder};
pub use error::{IndexError, ProviderError, RagError};
pub use generation::{Generator, TemplateGenerator};
pub use orchestrator::{BuildState, QueryResponse, RagService, NOT_INDEXED_MESSAGE};
pub use retriever::TransactionMatch;
pub use storage::{
    ConversationStore, InMemoryConversationStore, InMemoryTransactionStore, JsonlTransactionStore,
    TransactionStore,
};
