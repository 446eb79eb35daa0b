/// SQL pretty-printer for display and audit logs.
///
/// Works on the guard's token stream rather than an AST: keywords are
/// upper-cased, whitespace runs collapse to one space, each major clause
/// starts a new line and subqueries are indented. `sqlparser` is only used
/// to decide whether the statement is well-formed enough to be worth
/// reformatting. Anything that fails that check, or whose tokens would come
/// out different, is returned untouched.
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;
use tracing::debug;

use super::token::{next_significant, tokenize, tokenize_with, Quoting, Token, TokenKind};

const INDENT: &str = "    ";

const KEYWORDS: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "CROSS", "DESC", "DISTINCT",
    "ELSE", "END", "EXCEPT", "EXISTS", "FROM", "FULL", "GLOB", "GROUP", "HAVING", "IN", "INNER",
    "INTERSECT", "IS", "JOIN", "LEFT", "LIKE", "LIMIT", "NATURAL", "NOT", "NULL", "OFFSET", "ON",
    "OR", "ORDER", "OUTER", "OVER", "PARTITION", "RIGHT", "SELECT", "THEN", "UNION", "USING",
    "WHEN", "WHERE", "WITH",
];

/// Keywords that open a new line at the statement's own nesting level.
const CLAUSE_STARTERS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "HAVING", "LIMIT", "UNION", "INTERSECT", "EXCEPT",
];

const JOIN_MODIFIERS: &[&str] = &["LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "FULL", "NATURAL"];

/// Reformat a statement, or return it unchanged when it cannot be safely
/// reformatted. Never fails.
pub fn format_statement(sql: &str) -> String {
    match try_format(sql) {
        Some(pretty) => pretty,
        None => sql.to_string(),
    }
}

fn try_format(sql: &str) -> Option<String> {
    let statements = match SqlParser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "leaving statement unformatted");
            return None;
        }
    };
    if statements.len() != 1 {
        debug!(count = statements.len(), "leaving multi-statement text unformatted");
        return None;
    }

    let pretty = reindent(sql);
    if same_tokens(sql, &pretty) {
        Some(pretty)
    } else {
        debug!("formatter changed token stream, discarding");
        None
    }
}

fn reindent(sql: &str) -> String {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len() + 16);
    // One entry per open parenthesis; true when it encloses a subquery.
    let mut parens: Vec<bool> = Vec::new();
    let mut pending_space = false;
    let mut prev: Option<Token<'_>> = None;

    for (i, tok) in tokens.iter().enumerate() {
        if tok.kind == TokenKind::Whitespace {
            pending_space = true;
            continue;
        }

        let depth = subquery_depth(&parens);
        let at_statement_level = parens.last().map_or(true, |&sub| sub);
        let opens_subquery_body = matches!(prev, Some(p) if p.kind == TokenKind::LParen)
            && parens.last() == Some(&true);
        let closes_subquery = tok.kind == TokenKind::RParen && parens.last() == Some(&true);

        let separator = if out.is_empty() {
            String::new()
        } else if closes_subquery {
            newline(depth.saturating_sub(1))
        } else if opens_subquery_body
            || matches!(prev, Some(p) if p.kind == TokenKind::LineComment)
            || (at_statement_level && breaks_clause(&tokens, i, prev))
        {
            newline(depth)
        } else if pending_space {
            " ".to_string()
        } else {
            String::new()
        };
        out.push_str(&separator);

        if tok.kind == TokenKind::Word && is_keyword(tok.text) {
            out.push_str(&tok.text.to_ascii_uppercase());
        } else {
            out.push_str(tok.text);
        }

        match tok.kind {
            TokenKind::LParen => {
                let sub = next_significant(&tokens, i + 1)
                    .map(|n| tokens[n].is_keyword("SELECT") || tokens[n].is_keyword("WITH"))
                    .unwrap_or(false);
                parens.push(sub);
            }
            TokenKind::RParen => {
                parens.pop();
            }
            _ => {}
        }

        pending_space = false;
        prev = Some(*tok);
    }

    out
}

fn subquery_depth(parens: &[bool]) -> usize {
    parens.iter().filter(|&&sub| sub).count()
}

fn newline(depth: usize) -> String {
    format!("\n{}", INDENT.repeat(depth))
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn breaks_clause(tokens: &[Token<'_>], idx: usize, prev: Option<Token<'_>>) -> bool {
    let tok = &tokens[idx];
    if tok.kind != TokenKind::Word {
        return false;
    }
    let next_is = |kw: &str| {
        next_significant(tokens, idx + 1)
            .map(|n| tokens[n].is_keyword(kw))
            .unwrap_or(false)
    };

    if CLAUSE_STARTERS.iter().any(|k| tok.is_keyword(k)) {
        // SELECT right after UNION stays on the UNION line.
        let after_set_op = prev
            .map(|p| p.is_keyword("UNION") || p.is_keyword("ALL") || p.is_keyword("INTERSECT") || p.is_keyword("EXCEPT"))
            .unwrap_or(false);
        return !(tok.is_keyword("SELECT") && after_set_op);
    }
    if tok.is_keyword("GROUP") || tok.is_keyword("ORDER") {
        return next_is("BY");
    }
    if tok.is_keyword("JOIN") {
        let modified = prev
            .map(|p| JOIN_MODIFIERS.iter().any(|m| p.is_keyword(m)))
            .unwrap_or(false);
        return !modified;
    }
    if JOIN_MODIFIERS.iter().any(|m| tok.is_keyword(m)) && !tok.is_keyword("OUTER") {
        return next_is("JOIN") || next_is("OUTER");
    }
    false
}

/// Token streams equal up to whitespace and keyword case.
/// Equal up to whitespace and keyword case, under every quoting reading the
/// validator applies to either text.
fn same_tokens(a: &str, b: &str) -> bool {
    let mut readings = vec![Quoting::Sqlite];
    if Quoting::is_ambiguous(a) || Quoting::is_ambiguous(b) {
        readings.push(Quoting::Backslash);
    }
    readings
        .into_iter()
        .all(|quoting| same_tokens_with(a, b, quoting))
}

fn same_tokens_with(a: &str, b: &str, quoting: Quoting) -> bool {
    let left: Vec<Token<'_>> = tokenize_with(a, quoting)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Whitespace)
        .collect();
    let right: Vec<Token<'_>> = tokenize_with(b, quoting)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Whitespace)
        .collect();
    left.len() == right.len()
        && left.iter().zip(&right).all(|(l, r)| {
            l.kind == r.kind
                && if l.kind == TokenKind::Word {
                    l.text.eq_ignore_ascii_case(r.text)
                } else {
                    l.text == r.text
                }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::validate::validate;

    #[test]
    fn test_clauses_on_own_lines() {
        let pretty = format_statement(
            "select category, sum(price) from items where price > 10 group by category order by 2 desc limit 5",
        );
        assert_eq!(
            pretty,
            "SELECT category, sum(price)\nFROM items\nWHERE price > 10\nGROUP BY category\nORDER BY 2 DESC\nLIMIT 5"
        );
    }

    #[test]
    fn test_joins_break_lines() {
        let pretty = format_statement(
            "SELECT o.id FROM orders o LEFT JOIN items i ON i.order_id = o.id JOIN products p ON p.id = i.product_id",
        );
        assert_eq!(
            pretty,
            "SELECT o.id\nFROM orders o\nLEFT JOIN items i ON i.order_id = o.id\nJOIN products p ON p.id = i.product_id"
        );
    }

    #[test]
    fn test_subquery_is_indented() {
        let pretty = format_statement(
            "SELECT city FROM customers WHERE id IN (SELECT id FROM x WHERE y = 1) LIMIT 500",
        );
        assert_eq!(
            pretty,
            "SELECT city\nFROM customers\nWHERE id IN (\n    SELECT id\n    FROM x\n    WHERE y = 1\n)\nLIMIT 500"
        );
    }

    #[test]
    fn test_function_parens_do_not_break() {
        let pretty = format_statement("SELECT COUNT(DISTINCT customer_id) FROM orders");
        assert_eq!(pretty, "SELECT COUNT(DISTINCT customer_id)\nFROM orders");
    }

    #[test]
    fn test_literals_untouched() {
        let pretty = format_statement("select 'from  where' as s from t");
        assert_eq!(pretty, "SELECT 'from  where' AS s\nFROM t");
    }

    #[test]
    fn test_unparseable_is_returned_unchanged() {
        let sql = "SELECT a FROM WHERE";
        assert_eq!(format_statement(sql), sql);
        let sql = "SELECT 1; SELECT 2";
        assert_eq!(format_statement(sql), sql);
    }

    #[test]
    fn test_line_comment_keeps_its_newline() {
        let pretty = format_statement("SELECT a -- first column\nFROM t");
        assert_eq!(pretty, "SELECT a -- first column\nFROM t");
    }

    #[test]
    fn test_formatting_preserves_verdict() {
        let accepted = [
            "select a from t limit 5",
            "SELECT * FROM orders WHERE status = 'delete me' LIMIT 500",
            "SELECT a FROM t WHERE b IN (SELECT b FROM u) ORDER BY a LIMIT 3",
            "SELECT x.update FROM x",
            "SELECT a FROM t -- drop later\nWHERE b = 1",
            "SELECT [order id] FROM t LIMIT 5",
            "SELECT 1; -- note",
        ];
        let rejected = [
            "SELECT a FROM t; DROP TABLE t",
            "UPDATE t SET a = 1",
            "SELECT 1 /* c */; DROP TABLE t",
            "SELECT a FROM t -- note\n; DELETE FROM t",
            "DELETE FROM t",
            "SELECT 1; SELECT 2",
            "select a from t where b = 1 limit 5; pragma user_version",
            "SELECT [it's] FROM t; DROP TABLE t",
            "SELECT E'\\'' AS q; DROP TABLE t; --'",
            "SELECT a FROM t WHERE b = 'open; ATTACH DATABASE x AS y",
            "-- lead\nSELECT a FROM t",
        ];
        for sql in accepted {
            let formatted = format_statement(sql);
            assert!(validate(sql).is_accepted(), "{}", sql);
            assert_eq!(validate(&formatted), validate(sql), "{} => {}", sql, formatted);
        }
        for sql in rejected {
            let formatted = format_statement(sql);
            assert!(!validate(sql).is_accepted(), "{}", sql);
            assert_eq!(validate(&formatted), validate(sql), "{} => {}", sql, formatted);
        }
    }

    #[test]
    fn test_backslash_reading_blocks_reformat() {
        // Reindenting would put a newline inside what the backslash
        // reading sees as one string.
        let sql = "select 'a\\' , b from t where c = 'x'";
        assert_eq!(format_statement(sql), sql);
        assert!(!same_tokens(sql, &reindent(sql)));
    }
}
