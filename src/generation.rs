//! Text generation capability used by the answer synthesizer.

use crate::error::ProviderError;

pub trait Generator: Send + Sync {
    /// Produces an answer to `query` conditioned on `system_instructions` and `context`.
    fn generate(
        &self,
        system_instructions: &str,
        context: &str,
        query: &str,
    ) -> Result<String, ProviderError>;
}

/// Offline generator that answers by totalling the context lines it is given.
///
/// It reads the `Type:` and `Amount: $` fields of each context line, so it only
/// understands the canonical transaction format.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

impl Generator for TemplateGenerator {
    fn generate(
        &self,
        _system_instructions: &str,
        context: &str,
        query: &str,
    ) -> Result<String, ProviderError> {
        let lines: Vec<ContextLine> = context.lines().filter_map(ContextLine::parse).collect();
        if lines.is_empty() {
            return Err(ProviderError::Failed(
                "context contained no transactions".to_string(),
            ));
        }

        let expenses: f64 = lines.iter().filter(|l| l.kind == "Expense").map(|l| l.amount).sum();
        let income: f64 = lines.iter().filter(|l| l.kind == "Income").map(|l| l.amount).sum();

        let mut answer = format!(
            "For \"{}\" I found {} matching transaction{}.",
            query.trim(),
            lines.len(),
            if lines.len() == 1 { "" } else { "s" }
        );
        if expenses > 0.0 {
            answer.push_str(&format!(" Spending totals **${expenses:.2}**."));
        }
        if income > 0.0 {
            answer.push_str(&format!(" Income totals **${income:.2}**."));
        }
        for line in &lines {
            answer.push_str(&format!(
                "\n- {} {} ({}): **${:.2}**",
                line.date, line.category, line.kind, line.amount
            ));
        }
        Ok(answer)
    }
}

struct ContextLine<'a> {
    date: &'a str,
    kind: &'a str,
    category: &'a str,
    amount: f64,
}

impl<'a> ContextLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let mut date = None;
        let mut kind = None;
        let mut category = None;
        let mut amount = None;
        for field in line.split(" | ") {
            let Some((key, value)) = field.split_once(": ") else {
                continue;
            };
            match key.trim() {
                "Date" => date = Some(value),
                "Type" => kind = Some(value),
                "Category" => category = Some(value),
                "Amount" => amount = value.trim_start_matches('$').parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            date: date?,
            kind: kind?,
            category: category?,
            amount: amount?,
        })
    }
}
