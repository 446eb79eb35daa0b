/// Deterministic repairs for defects language models commonly produce.
///
/// The passes run in a fixed order because each assumes its predecessors
/// already ran:
///
/// 1. `LIMIT n )` inside a subquery or IN-list loses the LIMIT
/// 2. a stray comma before `ORDER BY` / `LIMIT` is removed
/// 3. LIMIT clauses are collapsed into one, carrying the last value, at the end
/// 4. trailing commas are stripped
///
/// The whole sequence is repeated until the text stops changing, which makes
/// [`repair`] idempotent.
use super::limit::limit_clauses;
use super::token::{
    append_clause, last_significant, next_significant, paren_depths, separate, strip_terminator,
    tokenize, trim_end_in_place, Token, TokenKind,
};

const MAX_ROUNDS: usize = 32;

pub fn repair(sql: &str) -> String {
    let mut current = strip_terminator(sql);
    for _ in 0..MAX_ROUNDS {
        let next = repair_round(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn repair_round(sql: &str) -> String {
    let s = until_stable(sql, drop_limit_before_paren);
    let s = until_stable(&s, drop_comma_before_clause);
    let s = collapse_limits(&s);
    strip_trailing_commas(&s)
}

/// Passes 1 and 2 can expose a new match once one is removed
/// (`LIMIT 5 LIMIT 3)`), so they run to a fixed point.
fn until_stable(sql: &str, pass: fn(&str) -> String) -> String {
    let mut current = sql.to_string();
    for _ in 0..MAX_ROUNDS {
        let next = pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// `... LIMIT 3)` → `...)`
fn drop_limit_before_paren(sql: &str) -> String {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < tokens.len() {
        if tokens[i].is_keyword("LIMIT") {
            let close = next_significant(&tokens, i + 1)
                .filter(|&n| tokens[n].integer_value().is_some())
                .and_then(|n| next_significant(&tokens, n + 1))
                .filter(|&c| tokens[c].kind == TokenKind::RParen);
            if let Some(close) = close {
                trim_end_in_place(&mut out);
                i = close;
                continue;
            }
        }
        out.push_str(tokens[i].text);
        i += 1;
    }
    out
}

/// `a, ORDER BY a` → `a ORDER BY a`; `a, LIMIT 5` → `a LIMIT 5`
fn drop_comma_before_clause(sql: &str) -> String {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < tokens.len() {
        if tokens[i].kind == TokenKind::Comma {
            if let Some(next) = next_significant(&tokens, i + 1) {
                if starts_order_by(&tokens, next) || tokens[next].is_keyword("LIMIT") {
                    for between in &tokens[i + 1..next] {
                        if between.kind != TokenKind::Whitespace {
                            separate(&mut out);
                            out.push_str(between.text);
                        }
                    }
                    separate(&mut out);
                    i = next;
                    continue;
                }
            }
        }
        out.push_str(tokens[i].text);
        i += 1;
    }
    out
}

fn starts_order_by(tokens: &[Token<'_>], idx: usize) -> bool {
    tokens[idx].is_keyword("ORDER")
        && next_significant(tokens, idx + 1)
            .map(|n| tokens[n].is_keyword("BY"))
            .unwrap_or(false)
}

/// Keep a single LIMIT, valued like the last one written, as the final
/// clause. A lone LIMIT that already closes the statement is left untouched.
///
/// A LIMIT with an OFFSET inside parentheses selects which rows the
/// subquery yields, so it stays where it is and takes no part in collapsing.
fn collapse_limits(sql: &str) -> String {
    let tokens = tokenize(sql);
    let depths = paren_depths(&tokens);
    let clauses: Vec<_> = limit_clauses(&tokens)
        .into_iter()
        .filter(|c| c.offset.is_none() || depths[c.start] == 0)
        .collect();
    let Some(survivor) = clauses.last().copied() else {
        return sql.to_string();
    };
    let already_final = next_significant(&tokens, survivor.end).is_none();
    if clauses.len() == 1 && already_final {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len());
    let mut pending = clauses.iter().peekable();
    let mut i = 0;
    while i < tokens.len() {
        if let Some(clause) = pending.next_if(|c| c.start == i) {
            trim_end_in_place(&mut out);
            i = clause.end;
            continue;
        }
        out.push_str(tokens[i].text);
        i += 1;
    }

    append_clause(&out, &survivor.render())
}

fn strip_trailing_commas(sql: &str) -> String {
    let mut current = sql.trim_end().to_string();
    loop {
        let tokens = tokenize(&current);
        let comma = match last_significant(&tokens) {
            Some(i) if tokens[i].kind == TokenKind::Comma => tokens[i],
            _ => return current,
        };
        let mut rebuilt = current[..comma.offset].to_string();
        trim_end_in_place(&mut rebuilt);
        let rest = current[comma.end()..].trim();
        if !rest.is_empty() {
            separate(&mut rebuilt);
            rebuilt.push_str(rest);
        }
        current = rebuilt.trim_end().to_string();
    }
}
