//! Transaction records and their indexed text/metadata form.

use serde::{Deserialize, Serialize};
use std::fmt;

const UNKNOWN_DATE: &str = "unknown_date";
const UNKNOWN_TYPE: &str = "unknown_type";
const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Income,
    Expense,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Income => write!(f, "Income"),
            TransactionType::Expense => write!(f, "Expense"),
        }
    }
}

/// A row from the transaction store. Everything except the ids may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionType>,
}

/// Stringified view of a transaction stored next to its vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub user_id: String,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub category: String,
    pub amount: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl IndexedDocument {
    pub fn from_transaction(transaction: &TransactionRecord) -> Self {
        Self {
            content: format_transaction(transaction),
            metadata: create_metadata(transaction),
        }
    }
}

/// Formats the fields in their canonical order. Output depends on field values only.
pub fn format_transaction(transaction: &TransactionRecord) -> String {
    let kind = transaction
        .kind
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| UNKNOWN_TYPE.to_string());
    format_line(
        &transaction.id.to_string(),
        &transaction.user_id.to_string(),
        transaction.date.as_deref().unwrap_or(UNKNOWN_DATE),
        &kind,
        transaction.category.as_deref().unwrap_or(UNCATEGORIZED),
        transaction.amount.unwrap_or(0.0),
        transaction.note.as_deref().unwrap_or(""),
    )
}

pub fn create_metadata(transaction: &TransactionRecord) -> DocumentMetadata {
    DocumentMetadata {
        id: transaction.id.to_string(),
        user_id: transaction.user_id.to_string(),
        date: transaction
            .date
            .clone()
            .unwrap_or_else(|| UNKNOWN_DATE.to_string()),
        kind: transaction.kind.map(|kind| kind.to_string()).unwrap_or_default(),
        category: transaction.category.clone().unwrap_or_default(),
        amount: format!("{:?}", transaction.amount.unwrap_or(0.0)),
        note: transaction.note.clone().unwrap_or_default(),
    }
}

/// Shared by the indexer and the context block handed to the generator.
pub(crate) fn format_line(
    id: &str,
    user_id: &str,
    date: &str,
    kind: &str,
    category: &str,
    amount: f64,
    note: &str,
) -> String {
    format!(
        "Transaction ID: {id} | User: {user_id} | Date: {date} | Type: {kind} | \
         Category: {category} | Amount: ${amount:.2} | Note: {note}"
    )
}
