use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Rows(usize),
    Empty,
    Failed(String),
}

/// One question and what came of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    /// The statement that was executed or blocked, if one got that far.
    pub sql: Option<String>,
    pub outcome: Outcome,
    pub asked_at: DateTime<Utc>,
}

/// Explicit, caller-owned chat state. The oldest exchanges are dropped once
/// `max_entries` is exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    entries: Vec<Exchange>,
    max_entries: usize,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn record(&mut self, exchange: Exchange) {
        self.entries.push(exchange);
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
    }

    pub fn entries(&self) -> &[Exchange] {
        &self.entries
    }

    /// The last `n` exchanges, oldest first.
    pub fn recent(&self, n: usize) -> &[Exchange] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(question: &str) -> Exchange {
        Exchange {
            question: question.to_string(),
            sql: Some("SELECT 1 LIMIT 500".to_string()),
            outcome: Outcome::Rows(1),
            asked_at: Utc::now(),
        }
    }

    #[test]
    fn test_bounded() {
        let mut conv = Conversation::with_capacity(3);
        for q in ["a", "b", "c", "d", "e"] {
            conv.record(exchange(q));
        }
        assert_eq!(conv.len(), 3);
        let questions: Vec<&str> = conv.entries().iter().map(|e| e.question.as_str()).collect();
        assert_eq!(questions, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_recent() {
        let mut conv = Conversation::new();
        assert!(conv.recent(3).is_empty());
        conv.record(exchange("a"));
        conv.record(exchange("b"));
        assert_eq!(conv.recent(3).len(), 2);
        assert_eq!(conv.recent(1)[0].question, "b");
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(Outcome::Failed("boom".into())).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["detail"], "boom");
        let json = serde_json::to_value(Outcome::Empty).unwrap();
        assert_eq!(json["kind"], "empty");
    }
}
