//! Query Router
//!
//! Classifies user queries as either:
//! - Fast: greetings, thanks, farewells, acknowledgements ("hello", "thanks!")
//! - Agentic: everything else, including anything that mentions markets,
//!   assets or the user's portfolios
//!
//! Misrouting a substantive request to the fast path would under-serve it,
//! so anything that does not clearly match a conversational pattern is Agentic.

use crate::history::{last_assistant_message, ConversationMessage};
use crate::models::Route;

/// Default low-complexity patterns, matched on the normalized query.
const CONVERSATIONAL_PATTERNS: &[&str] = &[
    // Greetings
    "hi", "hello", "hey", "hiya", "good morning", "good afternoon", "good evening",
    "how are you", "whats up", "how is it going",
    // Gratitude
    "thanks", "thank you", "thx", "much appreciated", "cheers",
    // Farewells
    "bye", "goodbye", "see you", "see you later", "good night",
    // Acknowledgements
    "ok", "okay", "cool", "great", "nice", "got it", "sounds good", "perfect",
    "yes", "no", "sure",
    // Meta
    "who are you", "what can you do",
];

/// Acknowledgements that may be answers to a clarifying question.
const ACKNOWLEDGEMENTS: &[&str] = &["ok", "okay", "yes", "no", "sure", "sounds good", "perfect"];

/// Any of these turns a pattern match back into an agentic query.
const FINANCIAL_KEYWORDS: &[&str] = &[
    "price", "stock", "share", "crypto", "bitcoin", "btc", "eth", "portfolio", "market",
    "news", "invest", "buy", "sell", "profit", "loss", "pnl", "p&l", "return", "dividend",
    "earnings", "balance", "position", "value", "risk", "fund", "etf", "index", "rate",
];

/// Words allowed to trail a pattern ("thanks a lot", "hello there").
const FILLER_WORDS: &[&str] = &[
    "there", "a", "lot", "so", "much", "very", "again", "all", "everyone", "you", "for",
    "the", "help", "bot", "mate", "friend", "then", "now",
];

const MAX_TRAILING_WORDS: usize = 2;

#[derive(Debug, Clone)]
pub struct QueryRouter {
    patterns: Vec<String>,
}

impl QueryRouter {
    pub fn new() -> Self {
        Self::with_patterns(CONVERSATIONAL_PATTERNS.iter().map(|p| p.to_string()))
    }

    /// Router over a custom pattern set. Patterns are normalized the same way as queries.
    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        // Longest first so "good morning" wins over "good".
        patterns.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        patterns.dedup();
        Self { patterns }
    }

    /// Classify a query. Pure and deterministic.
    pub fn classify(&self, query: &str, recent_history: &[ConversationMessage]) -> Route {
        let normalized = normalize(query);
        if normalized.is_empty() {
            return Route::Agentic;
        }

        if FINANCIAL_KEYWORDS.iter().any(|kw| contains_word(&normalized, kw)) {
            return Route::Agentic;
        }

        let Some(pattern) = self.matching_pattern(&normalized) else {
            return Route::Agentic;
        };

        // "yes" right after the assistant asked something is a real answer.
        let is_acknowledgement = ACKNOWLEDGEMENTS.iter().any(|a| *a == pattern);
        if is_acknowledgement && assistant_asked_question(recent_history) {
            return Route::Agentic;
        }

        Route::Fast
    }

    fn matching_pattern(&self, normalized: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| {
                if normalized == pattern.as_str() {
                    return true;
                }
                match normalized.strip_prefix(pattern.as_str()) {
                    Some(rest) if rest.starts_with(' ') => {
                        let trailing: Vec<&str> = rest.split_whitespace().collect();
                        trailing.len() <= MAX_TRAILING_WORDS
                            && trailing.iter().all(|w| FILLER_WORDS.contains(w))
                    }
                    _ => false,
                }
            })
            .map(|p| p.as_str())
    }
}

impl Default for QueryRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase, strip punctuation (apostrophes vanish), collapse whitespace.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| if c.is_alphanumeric() || c == '&' { c } else { ' ' })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(' ').any(|w| w == word || w.strip_suffix('s') == Some(word))
}

fn assistant_asked_question(history: &[ConversationMessage]) -> bool {
    last_assistant_message(history)
        .map(|m| m.content.trim_end().ends_with('?'))
        .unwrap_or(false)
}
