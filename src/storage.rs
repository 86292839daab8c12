//! Collaborators the engine reads transactions from and records conversations in.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::document::TransactionRecord;
use crate::error::RagError;

/// Read side of the relational transaction store.
pub trait TransactionStore: Send + Sync {
    fn get_transactions(&self, user_id: i64) -> Result<Vec<TransactionRecord>, RagError>;

    fn get_transaction(&self, id: i64) -> Result<Option<TransactionRecord>, RagError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    records: RwLock<Vec<TransactionRecord>>,
}

impl InMemoryTransactionStore {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn insert(&self, record: TransactionRecord) {
        self.records.write().push(record);
    }
}

impl TransactionStore for InMemoryTransactionStore {
    fn get_transactions(&self, user_id: i64) -> Result<Vec<TransactionRecord>, RagError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    fn get_transaction(&self, id: i64) -> Result<Option<TransactionRecord>, RagError> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }
}

/// One JSON transaction per line. A missing file reads as no transactions.
#[derive(Debug, Clone)]
pub struct JsonlTransactionStore {
    path: PathBuf,
}

impl JsonlTransactionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<Vec<TransactionRecord>, RagError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|err| storage_error(&self.path, err))?;
        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| storage_error(&self.path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|err| {
                RagError::Storage(format!("{} line {}: {err}", self.path.display(), number + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn append(&self, record: &TransactionRecord) -> Result<(), RagError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| storage_error(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| storage_error(&self.path, err))?;
        let line = serde_json::to_string(record)
            .map_err(|err| RagError::Storage(err.to_string()))?;
        writeln!(file, "{line}").map_err(|err| storage_error(&self.path, err))?;
        Ok(())
    }
}

fn storage_error(path: &Path, err: std::io::Error) -> RagError {
    RagError::Storage(format!("{}: {err}", path.display()))
}

impl TransactionStore for JsonlTransactionStore {
    fn get_transactions(&self, user_id: i64) -> Result<Vec<TransactionRecord>, RagError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect())
    }

    fn get_transaction(&self, id: i64) -> Result<Option<TransactionRecord>, RagError> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            created_at: Utc::now(),
        }
    }
}

pub trait ConversationStore: Send + Sync {
    fn append(&self, user_id: i64, turn: ConversationTurn);

    /// Turns in the order they were appended.
    fn get(&self, user_id: i64) -> Vec<ConversationTurn>;

    /// Returns whether the user had any history.
    fn clear(&self, user_id: i64) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    turns: RwLock<HashMap<i64, Vec<ConversationTurn>>>,
}

impl ConversationStore for InMemoryConversationStore {
    fn append(&self, user_id: i64, turn: ConversationTurn) {
        self.turns.write().entry(user_id).or_default().push(turn);
    }

    fn get(&self, user_id: i64) -> Vec<ConversationTurn> {
        self.turns.read().get(&user_id).cloned().unwrap_or_default()
    }

    fn clear(&self, user_id: i64) -> bool {
        self.turns
            .write()
            .remove(&user_id)
            .is_some_and(|turns| !turns.is_empty())
    }
}
