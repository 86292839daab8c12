use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::io::{self, BufRead};
use std::sync::Arc;

use finrag::{
    HashingEmbedder, JsonlTransactionStore, RagService, Settings, TemplateGenerator,
    TransactionRecord,
};

#[derive(Parser)]
#[command(name = "finrag")]
#[command(version = "0.1")]
#[command(about = "Ask questions about your transactions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every stored transaction of a user
    Index {
        #[arg(long)]
        user: i64,
        /// Drop the user's existing entries first
        #[arg(long)]
        reindex: bool,
    },
    /// Read transactions as JSON lines from stdin, store and index them
    Add,
    /// Answer a question from the user's indexed transactions
    Query {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(required = true)]
        text: Vec<String>,
    },
    Stats,
    Config,
}

fn open_service(settings: &Settings, store: Arc<JsonlTransactionStore>) -> RagService {
    RagService::open(
        settings,
        Arc::new(HashingEmbedder::new(settings.dimensions)),
        Arc::new(TemplateGenerator),
        store,
    )
}

fn index_command(settings: &Settings, user: i64, reindex: bool) -> Result<()> {
    let store = Arc::new(JsonlTransactionStore::new(&settings.transactions_path));
    let service = open_service(settings, store);
    let indexed = service
        .index_user_transactions(user, reindex)
        .with_context(|| format!("Failed to index transactions for user {user}"))?;

    let output = serde_json::json!({
        "user_id": user,
        "indexed": indexed,
        "state": service.build_state(user),
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn add_command(settings: &Settings) -> Result<()> {
    let store = Arc::new(JsonlTransactionStore::new(&settings.transactions_path));
    let service = open_service(settings, store.clone());
    let mut added_ids = HashSet::new();
    let mut indexed = 0usize;

    for (number, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TransactionRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid transaction on line {}", number + 1))?;
        if !added_ids.insert(record.id) {
            log::warn!("duplicate transaction id {} found; skipping", record.id);
            continue;
        }
        store.append(&record)?;
        if service.add_transaction_to_index(&record) {
            indexed += 1;
        }
    }

    let output = serde_json::json!({
        "added": added_ids.len(),
        "indexed": indexed,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn query_command(settings: &Settings, user: i64, top_k: Option<usize>, text: &[String]) -> Result<()> {
    let store = Arc::new(JsonlTransactionStore::new(&settings.transactions_path));
    let service = open_service(settings, store);
    let query = text.join(" ");
    let top_k = top_k.unwrap_or(settings.top_k);
    let response = service.query_with_rag(user, &query, top_k)?;

    let output = serde_json::json!({
        "query": query,
        "user_id": user,
        "answer": response.answer,
        "results": response.matches,
        "actual_results_count": response.matches.len(),
        "requested_results_count": top_k,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn stats_command(settings: &Settings) -> Result<()> {
    let store = Arc::new(JsonlTransactionStore::new(&settings.transactions_path));
    let stats = open_service(settings, store).get_index_stats();
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let settings = Settings::load()?;

    match args.command {
        Commands::Index { user, reindex } => index_command(&settings, user, reindex)?,
        Commands::Add => add_command(&settings)?,
        Commands::Query { user, top_k, text } => query_command(&settings, user, top_k, &text)?,
        Commands::Stats => stats_command(&settings)?,
        Commands::Config => settings.print_config(),
    }
    Ok(())
}
