//! Grounded answer generation over retrieved transactions.

use crate::gate::RelevanceGate;
use crate::generation::Generator;
use crate::retriever::TransactionMatch;

pub const OUT_OF_SCOPE_MESSAGE: &str =
    "I can only answer questions related to your expenses and financial insights.";

pub const NO_MATCHES_MESSAGE: &str = "I couldn't find any relevant transactions to answer your question. \
     Try rephrasing or ask about different transactions.";

const ERROR_DETAIL_CHARS: usize = 100;

/// Fixed apology returned instead of an error when generation fails.
pub fn degraded_answer(detail: &str) -> String {
    let detail: String = detail.chars().take(ERROR_DETAIL_CHARS).collect();
    format!("I had trouble analyzing your transactions. Please try again. Technical details: {detail}")
}

pub fn system_instructions() -> String {
    format!(
        "You are a friendly personal finance assistant.\n\
         Answer using ONLY the transactions provided in the context.\n\
         \n\
         SCOPE RULE:\n\
         - If the question is outside personal finance, transactions, budgets, or spending/income insights, \
         respond EXACTLY with: {OUT_OF_SCOPE_MESSAGE}\n\
         - Do not answer general knowledge or unrelated questions.\n\
         \n\
         Response guidelines:\n\
         - Start with a direct answer and use specific numbers and dates from the transactions.\n\
         - Bold currency amounts, e.g. **$123.45**, with two decimals.\n\
         - Keep it concise (around 150-200 words).\n\
         - If data is limited, say so. Do not invent transactions."
    )
}

pub fn context_block(matches: &[TransactionMatch]) -> String {
    matches
        .iter()
        .map(TransactionMatch::context_line)
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct AnswerSynthesizer {
    gate: RelevanceGate,
}

impl AnswerSynthesizer {
    pub fn new(gate: RelevanceGate) -> Self {
        Self { gate }
    }

    /// Never fails: refusals and provider errors become fixed answer texts.
    pub fn synthesize(
        &self,
        generator: &dyn Generator,
        user_id: i64,
        query: &str,
        matches: &[TransactionMatch],
    ) -> String {
        if !self.gate.is_relevant(query) {
            return OUT_OF_SCOPE_MESSAGE.to_string();
        }
        if matches.is_empty() {
            return NO_MATCHES_MESSAGE.to_string();
        }

        let context = context_block(matches);
        match generator.generate(&system_instructions(), &context, query) {
            Ok(answer) => answer,
            Err(err) => {
                log::error!("error generating answer for user_id={user_id}: {err}");
                degraded_answer(&err.to_string())
            }
        }
    }
}

impl Default for AnswerSynthesizer {
    fn default() -> Self {
        Self::new(RelevanceGate::default())
    }
}
