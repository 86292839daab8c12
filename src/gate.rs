//! Lexical relevance gate deciding whether a question is about personal finance.

/// Finance vocabulary plus time words and month names.
pub const FINANCE_KEYWORDS: &[&str] = &[
    "expense", "expenses", "spend", "spent", "spending",
    "income", "earn", "earned", "salary", "wage", "paycheck",
    "budget", "savings", "save", "balance",
    "transaction", "transactions", "category", "categories",
    "rent", "food", "grocery", "groceries", "entertainment",
    "subscription", "subscriptions", "utilities", "electricity",
    "water", "gas", "fuel", "transport", "travel", "restaurant",
    "coffee", "bill", "bills", "due",
    "trend", "average", "total", "sum", "breakdown", "insight", "insights",
    "forecast", "recommendation", "recommendations",
    "daily", "weekly", "monthly", "yearly", "quarter",
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

pub const CURRENCY_MARKERS: &[&str] = &["$", "usd", "dollar", "dollars"];

/// Question openers tied to quantities and totals.
pub const QUESTION_PHRASES: &[&str] = &[
    "how much", "how many", "what is my", "show me", "compare",
    "list my", "sum of", "total of", "spending on", "income from",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRule {
    Keyword,
    CurrencyMarker,
    Phrase,
}

/// The rule and table term that admitted a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateMatch {
    pub rule: GateRule,
    pub term: &'static str,
}

/// Case-insensitive substring matcher over three term tables. Deterministic and
/// independent of any index state.
#[derive(Debug, Clone)]
pub struct RelevanceGate {
    keywords: &'static [&'static str],
    currency_markers: &'static [&'static str],
    phrases: &'static [&'static str],
}

impl Default for RelevanceGate {
    fn default() -> Self {
        Self {
            keywords: FINANCE_KEYWORDS,
            currency_markers: CURRENCY_MARKERS,
            phrases: QUESTION_PHRASES,
        }
    }
}

impl RelevanceGate {
    pub fn new(
        keywords: &'static [&'static str],
        currency_markers: &'static [&'static str],
        phrases: &'static [&'static str],
    ) -> Self {
        Self {
            keywords,
            currency_markers,
            phrases,
        }
    }

    pub fn is_relevant(&self, query: &str) -> bool {
        self.explain(query).is_some()
    }

    /// First matching rule, checked in keyword, currency, phrase order.
    pub fn explain(&self, query: &str) -> Option<GateMatch> {
        if query.trim().is_empty() {
            return None;
        }
        let query = query.to_lowercase();
        let tables = [
            (GateRule::Keyword, self.keywords),
            (GateRule::CurrencyMarker, self.currency_markers),
            (GateRule::Phrase, self.phrases),
        ];
        tables.into_iter().find_map(|(rule, terms)| {
            terms
                .iter()
                .find(|term| query.contains(*term))
                .map(|&term| GateMatch { rule, term })
        })
    }
}
