//! Row-cap enforcement and LIMIT clause recognition.

use tracing::{debug, warn};

use super::token::{
    append_clause, contains_top_level_keyword, next_significant, tokenize, Token, TokenKind,
};
use super::GuardPolicy;

/// A `LIMIT <int>` clause, optionally with `OFFSET <int>` or SQLite's
/// `LIMIT <offset>, <count>` form. Positions are token indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitClause {
    pub start: usize,
    /// One past the last token of the clause.
    pub end: usize,
    pub count: u64,
    pub offset: Option<u64>,
}

impl LimitClause {
    /// Canonical text of the clause.
    pub fn render(&self) -> String {
        match self.offset {
            Some(offset) => format!("LIMIT {} OFFSET {}", self.count, offset),
            None => format!("LIMIT {}", self.count),
        }
    }
}

/// All LIMIT clauses with integer arguments, in source order, at any depth.
pub fn limit_clauses(tokens: &[Token<'_>]) -> Vec<LimitClause> {
    let mut clauses = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if !tokens[i].is_keyword("LIMIT") {
            i += 1;
            continue;
        }
        let Some((first_idx, first)) = integer_after(tokens, i + 1) else {
            i += 1;
            continue;
        };

        let mut clause = LimitClause {
            start: i,
            end: first_idx + 1,
            count: first,
            offset: None,
        };
        if let Some(next) = next_significant(tokens, first_idx + 1) {
            if tokens[next].is_keyword("OFFSET") {
                if let Some((idx, offset)) = integer_after(tokens, next + 1) {
                    clause.end = idx + 1;
                    clause.offset = Some(offset);
                }
            } else if tokens[next].kind == TokenKind::Comma {
                if let Some((idx, count)) = integer_after(tokens, next + 1) {
                    clause.end = idx + 1;
                    clause.count = count;
                    clause.offset = Some(first);
                }
            }
        }

        i = clause.end;
        clauses.push(clause);
    }
    clauses
}

fn integer_after(tokens: &[Token<'_>], from: usize) -> Option<(usize, u64)> {
    let idx = next_significant(tokens, from)?;
    tokens[idx].integer_value().map(|v| (idx, v))
}

/// The clause that closes the statement, if the statement ends with one.
/// Trailing comments do not count as content.
pub fn trailing_limit(sql: &str) -> Option<LimitClause> {
    let tokens = tokenize(sql);
    limit_clauses(&tokens)
        .last()
        .copied()
        .filter(|c| next_significant(&tokens, c.end).is_none())
}

pub fn ends_with_limit(sql: &str) -> bool {
    trailing_limit(sql).is_some()
}

/// Make sure the repaired statement is bounded.
///
/// A trailing LIMIT is kept as written, even above `max_rows`; the execution
/// boundary caps the fetched rows independently. A LIMIT with a non-literal
/// argument is also left alone since appending another would not parse.
/// LIMITs inside parentheses bound their subquery only and do not count.
pub fn enforce_row_cap(sql: &str, policy: &GuardPolicy) -> String {
    if let Some(clause) = trailing_limit(sql) {
        if clause.count > policy.max_rows() as u64 {
            debug!(
                limit = clause.count,
                max_rows = policy.max_rows(),
                "keeping model LIMIT above the row cap"
            );
        }
        return sql.to_string();
    }

    if contains_top_level_keyword(sql, "LIMIT") {
        warn!("statement has a LIMIT without an integer argument; not appending a row cap");
        return sql.to_string();
    }

    append_clause(sql, &format!("LIMIT {}", policy.max_rows()))
}
