//! End-to-end pipeline: relevance gate, retrieval, answer synthesis, and the
//! index lifecycle behind them.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{RetrievalOptions, Settings};
use crate::database::{IndexStats, VectorEntry, VectorIndex, VectorStore};
use crate::document::{IndexedDocument, TransactionRecord};
use crate::embedding::Embedder;
use crate::error::{ProviderError, RagError};
use crate::gate::RelevanceGate;
use crate::generation::Generator;
use crate::retriever::{Retriever, TransactionMatch};
use crate::retry::{embed_in_batches, RetryPolicy};
use crate::storage::{ConversationStore, ConversationTurn, TransactionStore};
use crate::synthesizer::{degraded_answer, AnswerSynthesizer, OUT_OF_SCOPE_MESSAGE};

pub const NOT_INDEXED_MESSAGE: &str =
    "Your financial data hasn't been indexed yet. Please build the index first.";

/// State of the most recent index build for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Empty,
    Indexing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub matches: Vec<TransactionMatch>,
}

impl QueryResponse {
    fn answer_only(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            matches: Vec::new(),
        }
    }
}

/// Owns the shared vector index. Mutations (rebuild, add, save) run one at a
/// time under `mutation`; searches and stats take the read side of `index`.
pub struct RagService<V: VectorStore = VectorIndex> {
    index: RwLock<V>,
    mutation: Mutex<()>,
    build_states: Mutex<HashMap<i64, BuildState>>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn TransactionStore>,
    conversations: Option<Arc<dyn ConversationStore>>,
    gate: RelevanceGate,
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
    retry: RetryPolicy,
    max_top_k: usize,
}

impl RagService<VectorIndex> {
    /// Loads (or starts) the index in `settings.index_dir`, fingerprinted with
    /// the embedder's model id.
    pub fn open(
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        let index = VectorIndex::create_or_load(
            &settings.index_dir,
            embedder.model_id(),
            embedder.dimensions(),
            settings.index_options(),
        );
        Self::new(index, embedder, generator, store)
            .with_retrieval_options(settings.retrieval_options())
            .with_retry_policy(settings.retry_policy())
            .with_max_top_k(settings.max_top_k)
    }
}

impl<V: VectorStore> RagService<V> {
    pub fn new(
        index: V,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        let gate = RelevanceGate::default();
        Self {
            index: RwLock::new(index),
            mutation: Mutex::new(()),
            build_states: Mutex::new(HashMap::new()),
            embedder,
            generator,
            store,
            conversations: None,
            synthesizer: AnswerSynthesizer::new(gate.clone()),
            gate,
            retriever: Retriever::default(),
            retry: RetryPolicy::default(),
            max_top_k: Settings::default().max_top_k,
        }
    }

    pub fn with_conversations(mut self, conversations: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(conversations);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retrieval_options(mut self, options: RetrievalOptions) -> Self {
        self.retriever = Retriever::new(options);
        self
    }

    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k;
        self
    }

    fn set_state(&self, user_id: i64, state: BuildState) {
        log::debug!("index build for user {user_id} -> {state:?}");
        self.build_states.lock().insert(user_id, state);
    }

    pub fn build_state(&self, user_id: i64) -> BuildState {
        if let Some(state) = self.build_states.lock().get(&user_id) {
            return *state;
        }
        if self.index.read().count_for_user(user_id) > 0 {
            BuildState::Ready
        } else {
            BuildState::Empty
        }
    }

    /// Indexes every stored transaction of `user_id`, replacing the user's
    /// previous entries when `reindex` is set. Returns how many were indexed.
    pub fn index_user_transactions(&self, user_id: i64, reindex: bool) -> Result<usize, RagError> {
        let _mutation = self.mutation.lock();
        log::info!("indexing transactions for user {user_id}, reindex={reindex}");

        let transactions = self.store.get_transactions(user_id)?;
        if transactions.is_empty() {
            log::info!("no transactions found for user {user_id}");
            return Ok(0);
        }

        self.set_state(user_id, BuildState::Indexing);
        let documents: Vec<IndexedDocument> = transactions
            .iter()
            .map(IndexedDocument::from_transaction)
            .collect();
        log::info!("created {} documents for user {user_id}", documents.len());

        if reindex {
            if let Err(err) = self.index.write().remove_user(user_id) {
                self.set_state(user_id, BuildState::Empty);
                return Err(err.into());
            }
        }

        let committed = match self.embed_and_add(&documents) {
            Ok(committed) => committed,
            Err(err) => {
                let state = if self.index.read().count_for_user(user_id) > 0 {
                    BuildState::Ready
                } else {
                    BuildState::Empty
                };
                self.set_state(user_id, state);
                return Err(err);
            }
        };

        self.set_state(user_id, BuildState::Ready);
        self.index.write().save()?;
        log::info!(
            "indexed {committed} documents for user {user_id}; index holds {}",
            self.index.read().len()
        );
        Ok(committed)
    }

    /// Embeds `documents` under the retry policy and adds each committed batch.
    /// Fails only when no batch made it into the index.
    fn embed_and_add(&self, documents: &[IndexedDocument]) -> Result<usize, RagError> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let outcome = embed_in_batches(
            self.embedder.as_ref(),
            &texts,
            &self.retry,
            &std::thread::sleep,
            |range, vectors| {
                let entries = documents[range]
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(document, embedding)| VectorEntry::new(document, embedding))
                    .collect();
                self.index.write().add(entries)
            },
        );

        match (outcome.committed, outcome.failure) {
            (0, failure) => Err(failure.unwrap_or_else(|| {
                ProviderError::Failed("no embedding batch was committed".to_string()).into()
            })),
            (committed, Some(failure)) => {
                log::warn!(
                    "partial index build: {committed} of {} documents committed ({failure})",
                    documents.len()
                );
                Ok(committed)
            }
            (committed, None) => Ok(committed),
        }
    }

    /// Best-effort single-record path; failures are logged and reported as `false`.
    pub fn add_transaction_to_index(&self, transaction: &TransactionRecord) -> bool {
        match self.try_add_transaction(transaction) {
            Ok(()) => {
                log::info!(
                    "added transaction {} to index for user_id={}",
                    transaction.id,
                    transaction.user_id
                );
                true
            }
            Err(err) => {
                log::error!("error adding transaction {} to index: {err}", transaction.id);
                false
            }
        }
    }

    fn try_add_transaction(&self, transaction: &TransactionRecord) -> Result<(), RagError> {
        let _mutation = self.mutation.lock();
        let document = IndexedDocument::from_transaction(transaction);
        self.embed_and_add(std::slice::from_ref(&document))?;
        self.index.write().save()?;
        Ok(())
    }

    /// Gate, retrieve, answer. Provider trouble yields a degraded answer rather
    /// than an error; only invalid input is rejected.
    pub fn query_with_rag(
        &self,
        user_id: i64,
        query: &str,
        top_k: usize,
    ) -> Result<QueryResponse, RagError> {
        if query.trim().is_empty() {
            return Err(RagError::Validation("query must not be empty".to_string()));
        }
        if top_k > self.max_top_k {
            return Err(RagError::Validation(format!(
                "top_k must be at most {}, got {top_k}",
                self.max_top_k
            )));
        }

        let response = self.answer(user_id, query, top_k);
        if let Some(conversations) = self.conversations.as_ref() {
            conversations.append(user_id, ConversationTurn::new(query, response.answer.clone()));
        }
        Ok(response)
    }

    fn answer(&self, user_id: i64, query: &str, top_k: usize) -> QueryResponse {
        if !self.gate.is_relevant(query) {
            log::info!("out-of-scope query from user_id={user_id}");
            return QueryResponse::answer_only(OUT_OF_SCOPE_MESSAGE);
        }

        let retrieved = {
            let index = self.index.read();
            if index.count_for_user(user_id) == 0 {
                return QueryResponse::answer_only(NOT_INDEXED_MESSAGE);
            }
            self.retriever
                .retrieve(&*index, self.embedder.as_ref(), user_id, query, top_k)
        };

        let matches = match retrieved {
            Ok(matches) => matches,
            Err(err) => {
                log::error!("retrieval failed for user_id={user_id}: {err}");
                return QueryResponse::answer_only(degraded_answer(&err.to_string()));
            }
        };

        let answer = self
            .synthesizer
            .synthesize(self.generator.as_ref(), user_id, query, &matches);
        QueryResponse { answer, matches }
    }

    pub fn get_index_stats(&self) -> IndexStats {
        self.index.read().stats()
    }

    pub fn conversation(&self, user_id: i64) -> Vec<ConversationTurn> {
        self.conversations
            .as_ref()
            .map(|c| c.get(user_id))
            .unwrap_or_default()
    }

    pub fn clear_conversation(&self, user_id: i64) -> bool {
        self.conversations
            .as_ref()
            .is_some_and(|c| c.clear(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexOptions, Number};
    use crate::database::SearchHit;
    use crate::document::TransactionType;
    use crate::error::IndexError;
    use crate::embedding::HashingEmbedder;
    use crate::generation::TemplateGenerator;
    use crate::storage::{InMemoryConversationStore, InMemoryTransactionStore};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Hashing embedder that can be switched into a failing state.
    struct SwitchableEmbedder {
        inner: HashingEmbedder,
        failing: AtomicBool,
    }

    impl SwitchableEmbedder {
        fn new(failing: bool) -> Self {
            Self {
                inner: HashingEmbedder::new(64),
                failing: AtomicBool::new(failing),
            }
        }
    }

    impl Embedder for SwitchableEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, ProviderError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("embedding service down".into()));
            }
            self.inner.embed(texts)
        }
    }

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    impl Generator for CountingGenerator {
        fn generate(&self, system: &str, context: &str, query: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TemplateGenerator.generate(system, context, query)
        }
    }

    fn record(id: i64, user_id: i64, kind: TransactionType, category: &str, amount: f64) -> TransactionRecord {
        TransactionRecord {
            id,
            user_id,
            date: Some("2024-08-01".to_string()),
            category: Some(category.to_string()),
            note: None,
            amount: Some(amount),
            kind: Some(kind),
        }
    }

    fn sample_records() -> Vec<TransactionRecord> {
        vec![
            record(1, 1, TransactionType::Expense, "food", 50.0),
            record(2, 1, TransactionType::Income, "salary", 3000.0),
            record(3, 1, TransactionType::Expense, "coffee", 20.0),
        ]
    }

    struct Fixture {
        _temp: TempDir,
        embedder: Arc<SwitchableEmbedder>,
        generator: Arc<CountingGenerator>,
        store: Arc<InMemoryTransactionStore>,
        service: RagService,
    }

    fn fixture(records: Vec<TransactionRecord>, failing: bool) -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let embedder = Arc::new(SwitchableEmbedder::new(failing));
        let generator = Arc::new(CountingGenerator::default());
        let store = Arc::new(InMemoryTransactionStore::new(records));
        let index = VectorIndex::create_or_load(
            temp.path(),
            embedder.model_id(),
            embedder.dimensions(),
            IndexOptions::default(),
        );
        let service = RagService::new(index, embedder.clone(), generator.clone(), store.clone())
            .with_retry_policy(RetryPolicy::immediate(10, 1))
            .with_conversations(Arc::new(InMemoryConversationStore::default()));
        Fixture {
            _temp: temp,
            embedder,
            generator,
            store,
            service,
        }
    }

    #[test]
    fn indexes_and_answers_spending_question() {
        let f = fixture(sample_records(), false);
        assert_eq!(f.service.build_state(1), BuildState::Empty);
        assert_eq!(f.service.index_user_transactions(1, false).expect("index"), 3);
        assert_eq!(f.service.build_state(1), BuildState::Ready);

        let response = f
            .service
            .query_with_rag(1, "how much did I spend on food", 5)
            .expect("query");
        assert_eq!(response.matches.len(), 3);
        assert!(response.matches.iter().all(|m| m.user_id == 1));
        assert!(response.answer.contains('$'));
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unindexed_user_gets_fixed_message() {
        let f = fixture(sample_records(), false);
        let response = f.service.query_with_rag(1, "what did I spend", 5).expect("query");
        assert_eq!(response.answer, NOT_INDEXED_MESSAGE);
        assert!(response.matches.is_empty());
    }

    #[test]
    fn out_of_scope_query_never_reaches_generator() {
        let f = fixture(sample_records(), false);
        f.service.index_user_transactions(1, false).expect("index");
        let response = f
            .service
            .query_with_rag(1, "what is the capital of France", 5)
            .expect("query");
        assert_eq!(response.answer, OUT_OF_SCOPE_MESSAGE);
        assert!(response.matches.is_empty());
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_queries_are_rejected() {
        let f = fixture(sample_records(), false);
        assert!(matches!(
            f.service.query_with_rag(1, "   ", 5),
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            f.service.query_with_rag(1, "food spending", 1000),
            Err(RagError::Validation(_))
        ));
    }

    #[test]
    fn zero_top_k_yields_no_matches_answer() {
        let f = fixture(sample_records(), false);
        f.service.index_user_transactions(1, false).expect("index");
        let response = f.service.query_with_rag(1, "food spending", 0).expect("query");
        assert_eq!(response.answer, crate::synthesizer::NO_MATCHES_MESSAGE);
        assert!(response.matches.is_empty());
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reindex_replaces_previous_entries() {
        let f = fixture(sample_records(), false);
        f.service.index_user_transactions(1, false).expect("index");
        f.store.insert(record(4, 1, TransactionType::Expense, "rent", 900.0));
        assert_eq!(f.service.index_user_transactions(1, true).expect("reindex"), 4);
        assert_eq!(f.service.get_index_stats().total_documents, 4);
    }

    #[test]
    fn user_without_transactions_indexes_nothing() {
        let f = fixture(sample_records(), false);
        assert_eq!(f.service.index_user_transactions(42, false).expect("index"), 0);
        assert_eq!(f.service.build_state(42), BuildState::Empty);
    }

    #[test]
    fn total_embedding_failure_leaves_user_empty() {
        let f = fixture(sample_records(), true);
        let err = f.service.index_user_transactions(1, false).unwrap_err();
        assert!(matches!(err, RagError::Provider(ProviderError::Unavailable(_))));
        assert_eq!(f.service.build_state(1), BuildState::Empty);
        assert_eq!(f.service.get_index_stats().total_documents, 0);
    }

    #[test]
    fn single_add_reports_success_and_failure() {
        let f = fixture(Vec::new(), false);
        let tx = record(9, 2, TransactionType::Expense, "groceries", 12.0);
        assert!(f.service.add_transaction_to_index(&tx));
        assert_eq!(f.service.get_index_stats().total_documents, 1);

        f.embedder.failing.store(true, Ordering::SeqCst);
        assert!(!f.service.add_transaction_to_index(&record(10, 2, TransactionType::Expense, "fuel", 40.0)));
        assert_eq!(f.service.get_index_stats().total_documents, 1);
    }

    #[test]
    fn query_embedding_failure_degrades() {
        let f = fixture(sample_records(), false);
        f.service.index_user_transactions(1, false).expect("index");
        f.embedder.failing.store(true, Ordering::SeqCst);

        let response = f.service.query_with_rag(1, "food spending", 5).expect("query");
        assert!(response.answer.starts_with("I had trouble analyzing your transactions."));
        assert!(response.matches.is_empty());
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conversation_is_recorded_and_cleared() {
        let f = fixture(sample_records(), false);
        f.service.query_with_rag(1, "my food budget", 3).expect("query");
        let turns = f.service.conversation(1);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].query, "my food budget");
        assert_eq!(turns[0].answer, NOT_INDEXED_MESSAGE);
        assert!(f.service.clear_conversation(1));
        assert!(f.service.conversation(1).is_empty());
    }

    /// Delegates to a real index but fails every save.
    struct UnsavableIndex {
        inner: VectorIndex,
    }

    impl VectorStore for UnsavableIndex {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn count_for_user(&self, user_id: i64) -> usize {
            self.inner.count_for_user(user_id)
        }

        fn add(&mut self, entries: Vec<VectorEntry>) -> Result<(), IndexError> {
            self.inner.add(entries)
        }

        fn remove_user(&mut self, user_id: i64) -> Result<usize, IndexError> {
            self.inner.remove_user(user_id)
        }

        fn search(&self, query_embedding: &[Number], k: usize) -> Vec<SearchHit> {
            self.inner.search(query_embedding, k)
        }

        fn save(&mut self) -> Result<(), IndexError> {
            Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn stats(&self) -> IndexStats {
            self.inner.stats()
        }
    }

    fn unsavable_service(temp: &TempDir, records: Vec<TransactionRecord>) -> RagService<UnsavableIndex> {
        let embedder = Arc::new(HashingEmbedder::new(64));
        let inner = VectorIndex::create_or_load(
            temp.path(),
            embedder.model_id(),
            embedder.dimensions(),
            IndexOptions::default(),
        );
        RagService::new(
            UnsavableIndex { inner },
            embedder,
            Arc::new(TemplateGenerator),
            Arc::new(InMemoryTransactionStore::new(records)),
        )
        .with_retry_policy(RetryPolicy::immediate(10, 1))
    }

    #[test]
    fn save_failure_is_surfaced_and_index_stays_usable() {
        let temp = TempDir::new().expect("tempdir");
        let service = unsavable_service(&temp, sample_records());

        let err = service.index_user_transactions(1, false).unwrap_err();
        assert!(matches!(err, RagError::Index(IndexError::Io(_))));
        assert_eq!(service.build_state(1), BuildState::Ready);

        let response = service
            .query_with_rag(1, "how much did I spend on food", 5)
            .expect("query");
        assert_eq!(response.matches.len(), 3);
    }

    #[test]
    fn single_add_with_failing_save_reports_false() {
        let temp = TempDir::new().expect("tempdir");
        let service = unsavable_service(&temp, Vec::new());
        let tx = record(9, 2, TransactionType::Expense, "groceries", 12.0);

        assert!(!service.add_transaction_to_index(&tx));
        assert_eq!(service.get_index_stats().total_documents, 1);
    }

    #[test]
    fn index_rejection_is_reported_as_index_error() {
        let temp = TempDir::new().expect("tempdir");
        let embedder = Arc::new(HashingEmbedder::new(64));
        let index = VectorIndex::create_or_load(temp.path(), "narrow", 32, IndexOptions::default());
        let service = RagService::new(
            index,
            embedder,
            Arc::new(TemplateGenerator),
            Arc::new(InMemoryTransactionStore::new(sample_records())),
        )
        .with_retry_policy(RetryPolicy::immediate(10, 3));

        let err = service.index_user_transactions(1, false).unwrap_err();
        assert!(matches!(
            err,
            RagError::Index(IndexError::DimensionMismatch { expected: 32, got: 64 })
        ));
        assert_eq!(service.build_state(1), BuildState::Empty);
    }

    #[test]
    fn concurrent_builds_and_queries_stay_isolated() {
        let users: Vec<i64> = (1..=4).collect();
        let records: Vec<_> = users
            .iter()
            .flat_map(|&user| {
                (0..5).map(move |i| {
                    let category = if i % 2 == 0 { "food" } else { "rent" };
                    record(user * 100 + i, user, TransactionType::Expense, category, 10.0 + i as f64)
                })
            })
            .collect();
        let f = fixture(records, false);
        let service = &f.service;

        std::thread::scope(|scope| {
            let builders: Vec<_> = users
                .iter()
                .map(|&user| scope.spawn(move || service.index_user_transactions(user, false)))
                .collect();
            let readers: Vec<_> = users
                .iter()
                .map(|&user| {
                    scope.spawn(move || {
                        for _ in 0..10 {
                            let response = service
                                .query_with_rag(user, "food spending", 10)
                                .expect("query");
                            assert!(response.matches.iter().all(|m| m.user_id == user));
                            assert!(response.matches.len() <= 5);
                        }
                    })
                })
                .collect();

            for builder in builders {
                assert_eq!(builder.join().expect("builder thread").expect("index"), 5);
            }
            for reader in readers {
                reader.join().expect("reader thread");
            }
        });

        let stats = service.get_index_stats();
        assert_eq!(stats.total_documents, 20);
        for user in &users {
            assert_eq!(stats.users.get(&user.to_string()), Some(&5));
            assert_eq!(service.build_state(*user), BuildState::Ready);
            let response = service.query_with_rag(*user, "rent spending", 10).expect("query");
            assert_eq!(response.matches.len(), 5);
            assert!(response.matches.iter().all(|m| m.user_id == *user));
        }
    }
}
