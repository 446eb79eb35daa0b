use serde::{Deserialize, Serialize};
use std::fmt;

use super::token::{tokenize, tokenize_with, Quoting, Token, TokenKind};

/// Words that must never appear as a bare keyword in a guarded statement.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "ALTER", "INSERT", "UPDATE", "DELETE", "PRAGMA", "ATTACH", "DETACH",
];

/// Why a candidate statement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "keyword", rename_all = "snake_case")]
pub enum RejectReason {
    NonSelect,
    MultipleStatements,
    ForbiddenKeyword(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NonSelect => write!(f, "non-SELECT statement"),
            RejectReason::MultipleStatements => write!(f, "multiple statements"),
            RejectReason::ForbiddenKeyword(word) => write!(f, "forbidden keyword: {}", word),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted,
    /// Never empty. Forbidden keywords come first, then multiple
    /// statements, then a missing SELECT.
    Rejected(Vec<RejectReason>),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted)
    }

    pub fn primary_reason(&self) -> Option<&RejectReason> {
        match self {
            ValidationVerdict::Accepted => None,
            ValidationVerdict::Rejected(reasons) => reasons.first(),
        }
    }
}

/// Run every check against the statement and collect all failures.
///
/// When brackets or backslashes make the quoting ambiguous, the statement is
/// checked under both readings and fails if either reading fails.
pub fn validate(sql: &str) -> ValidationVerdict {
    let mut readings = vec![tokenize(sql)];
    if Quoting::is_ambiguous(sql) {
        readings.push(tokenize_with(sql, Quoting::Backslash));
    }

    let mut reasons: Vec<RejectReason> = Vec::new();
    for word in readings.iter().flat_map(|tokens| forbidden_keywords(tokens)) {
        let reason = RejectReason::ForbiddenKeyword(word);
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    if readings.iter().any(|tokens| has_trailing_statement(tokens)) {
        reasons.push(RejectReason::MultipleStatements);
    }
    if !readings.iter().all(|tokens| starts_with_select(tokens)) {
        reasons.push(RejectReason::NonSelect);
    }

    if reasons.is_empty() {
        ValidationVerdict::Accepted
    } else {
        ValidationVerdict::Rejected(reasons)
    }
}

fn starts_with_select(tokens: &[Token<'_>]) -> bool {
    tokens
        .iter()
        .find(|t| t.kind != TokenKind::Whitespace)
        .map(|t| t.is_keyword("SELECT"))
        .unwrap_or(false)
}

/// A terminator followed by anything other than whitespace or comments.
fn has_trailing_statement(tokens: &[Token<'_>]) -> bool {
    match tokens.iter().position(|t| t.kind == TokenKind::Semicolon) {
        Some(idx) => tokens[idx + 1..].iter().any(|t| !t.is_trivia()),
        None => false,
    }
}

/// Distinct forbidden keywords in order of first appearance, upper-cased.
fn forbidden_keywords(tokens: &[Token<'_>]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Word) {
        if let Some(word) = FORBIDDEN_KEYWORDS
            .iter()
            .find(|kw| token.text.eq_ignore_ascii_case(kw))
        {
            if !found.iter().any(|f| f == word) {
                found.push(word.to_string());
            }
        }
    }
    found
}
