//! Turns untrusted model output into one bounded, read-only SELECT.
//!
//! The pipeline is fixed: extract → validate → repair → cap → format, then
//! execute through [`crate::db::execute_bounded`]. Every stage is a pure
//! function of its input and the [`GuardPolicy`]; the only persistent state
//! is the policy itself.

mod extract;
mod format;
mod limit;
mod repair;
pub mod token;
mod validate;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::{execute_bounded, DataStore, QueryResult};
use crate::error::GuardError;

pub use extract::{extract_candidate, CandidateStatement};
pub use format::format_statement;
pub use limit::{ends_with_limit, enforce_row_cap, limit_clauses, trailing_limit, LimitClause};
pub use repair::repair;
pub use validate::{validate, RejectReason, ValidationVerdict, FORBIDDEN_KEYWORDS};

pub const DEFAULT_MAX_ROWS: usize = 500;

/// Limits applied to every guarded statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardPolicy {
    max_rows: usize,
}

impl GuardPolicy {
    pub fn new(max_rows: usize) -> anyhow::Result<Self> {
        if max_rows == 0 {
            anyhow::bail!("max_rows must be a positive integer");
        }
        Ok(Self { max_rows })
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Extracted,
    Validated,
    Repaired,
    Capped,
    Formatted,
    Executed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Extracted => "extracted",
            Stage::Validated => "validated",
            Stage::Repaired => "repaired",
            Stage::Capped => "capped",
            Stage::Formatted => "formatted",
            Stage::Executed => "executed",
        };
        f.write_str(name)
    }
}

/// A statement that passed the guard and is ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedStatement {
    pub candidate: CandidateStatement,
    /// The repaired, capped statement. This is what gets executed.
    pub sql: String,
    /// `sql` pretty-printed for display and audit.
    pub display: String,
}

#[derive(Debug, Clone)]
pub struct GuardedResult {
    pub statement: GuardedStatement,
    pub result: QueryResult,
}

/// Stateless apart from its policy; share it by reference.
#[derive(Debug, Clone, Default)]
pub struct Guard {
    policy: GuardPolicy,
}

impl Guard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Run every pre-execution stage on raw model output.
    pub fn prepare(&self, raw: &str) -> Result<GuardedStatement, GuardError> {
        debug!(stage = %Stage::Received, bytes = raw.len());

        let candidate = extract_candidate(raw)?;
        debug!(stage = %Stage::Extracted, from_fence = candidate.from_fence, sql = %candidate.text);

        if let ValidationVerdict::Rejected(reasons) = validate(&candidate.text) {
            info!(reasons = ?reasons, sql = %candidate.text, "blocked query");
            return Err(GuardError::ValidationRejected {
                reasons,
                sql: candidate.text,
            });
        }
        debug!(stage = %Stage::Validated);

        let repaired = repair(&candidate.text);
        debug!(stage = %Stage::Repaired, sql = %repaired);

        let sql = enforce_row_cap(&repaired, &self.policy);
        debug!(stage = %Stage::Capped, sql = %sql);

        let display = format_statement(&sql);
        debug!(stage = %Stage::Formatted);

        Ok(GuardedStatement {
            candidate,
            sql,
            display,
        })
    }

    /// Prepare and execute, capping fetched rows at the policy limit.
    pub async fn run(
        &self,
        raw: &str,
        store: &dyn DataStore,
        timeout: Option<Duration>,
    ) -> Result<GuardedResult, GuardError> {
        let statement = self.prepare(raw)?;
        let result =
            execute_bounded(store, &statement.sql, Some(self.policy.max_rows()), timeout).await?;
        debug!(stage = %Stage::Executed, rows = result.row_count, truncated = result.truncated);
        Ok(GuardedResult { statement, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn guard() -> Guard {
        Guard::new(GuardPolicy::new(500).unwrap())
    }

    #[test]
    fn test_policy_rejects_zero() {
        assert!(GuardPolicy::new(0).is_err());
        assert_eq!(GuardPolicy::default().max_rows(), 500);
    }

    #[test]
    fn test_stacked_drop_is_blocked_verbatim() {
        let raw = "SELECT * FROM orders; DROP TABLE orders;";
        let err = guard().prepare(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationRejected);
        assert_eq!(err.offending_sql(), Some(raw));
        assert_eq!(
            err.reject_reason(),
            Some(&RejectReason::ForbiddenKeyword("DROP".into()))
        );
    }

    #[test]
    fn test_fenced_output_with_double_limit() {
        let raw = "Sure! ```sql\nSELECT category, SUM(price) FROM items GROUP BY category LIMIT 10 LIMIT 5\n```";
        let stmt = guard().prepare(raw).unwrap();
        assert!(stmt.candidate.from_fence);
        assert!(!stmt.sql.contains("```"));
        assert!(stmt.sql.ends_with("GROUP BY category LIMIT 5"));
        assert_eq!(stmt.sql.matches("LIMIT").count(), 1);
    }

    #[test]
    fn test_inner_limit_removed_and_cap_appended() {
        let raw = "SELECT city FROM customers WHERE id IN (SELECT id FROM x LIMIT 3)";
        let stmt = guard().prepare(raw).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT city FROM customers WHERE id IN (SELECT id FROM x) LIMIT 500"
        );
    }

    #[test]
    fn test_empty_input_fails_before_validation() {
        for raw in ["", "   \n\t "] {
            let err = guard().prepare(raw).unwrap_err();
            assert_eq!(err, GuardError::ExtractionEmpty);
        }
    }

    #[test]
    fn test_unbounded_select_gets_exactly_one_cap() {
        let guard = Guard::new(GuardPolicy::new(42).unwrap());
        for raw in [
            "SELECT * FROM orders",
            "select a, b, from t",
            "SELECT a FROM t ORDER BY a, ;",
            "SELECT a FROM t -- everything",
        ] {
            let stmt = guard.prepare(raw).unwrap();
            let tokens = token::tokenize(&stmt.sql);
            let clauses = limit_clauses(&tokens);
            assert_eq!(clauses.len(), 1, "{}", stmt.sql);
            assert_eq!(clauses[0].count, 42);
            assert!(ends_with_limit(&stmt.sql), "{}", stmt.sql);
        }
    }

    #[test]
    fn test_display_is_formatted_and_sql_is_not() {
        let stmt = guard().prepare("select a from t where b = 1").unwrap();
        assert_eq!(stmt.sql, "select a from t where b = 1 LIMIT 500");
        assert_eq!(stmt.display, "SELECT a\nFROM t\nWHERE b = 1\nLIMIT 500");
    }

    #[test]
    fn test_display_keeps_verdict() {
        for raw in [
            "SELECT a FROM t WHERE note = 'drop'",
            "SELECT x FROM (SELECT x FROM y LIMIT 2) z",
            "SELECT a FROM t LIMIT 10 OFFSET 5",
            "SELECT a FROM t WHERE a IN (SELECT a FROM t LIMIT 2 OFFSET 1)",
        ] {
            let stmt = guard().prepare(raw).unwrap();
            assert!(validate(&stmt.display).is_accepted(), "{}", stmt.display);
            assert_eq!(validate(&stmt.display), validate(&stmt.sql));
        }
    }

    #[test]
    fn test_hidden_second_statement_is_blocked() {
        for raw in [
            "SELECT [it's] FROM t; DROP TABLE t",
            "SELECT E'\\'' AS q; DROP TABLE t; --'",
            "SELECT 'open; DROP TABLE t",
            "SELECT 1 /* open; DROP TABLE t",
        ] {
            let err = guard().prepare(raw).unwrap_err();
            assert_eq!(
                err.reject_reason(),
                Some(&RejectReason::ForbiddenKeyword("DROP".into())),
                "{}",
                raw
            );
        }
    }

    fn sqlite_fixture(rows: usize) -> (tempfile::TempDir, crate::db::SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER, price REAL);")
            .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO items VALUES (?1, ?2)",
                rusqlite::params![i as i64, i as f64 * 1.5],
            )
            .unwrap();
        }
        (dir, crate::db::SqliteStore::new(path))
    }

    #[tokio::test]
    async fn test_run_caps_unbounded_select() {
        let (_dir, store) = sqlite_fixture(30);
        let guard = Guard::new(GuardPolicy::new(10).unwrap());

        let done = guard
            .run("```sql\nSELECT id FROM items ORDER BY id;\n```", &store, None)
            .await
            .unwrap();
        assert_eq!(done.statement.sql, "SELECT id FROM items ORDER BY id LIMIT 10");
        assert_eq!(done.result.row_count, 10);
        assert!(done.result.truncated);
    }

    #[tokio::test]
    async fn test_run_fetch_cap_holds_for_large_limit() {
        let (_dir, store) = sqlite_fixture(30);
        let guard = Guard::new(GuardPolicy::new(10).unwrap());

        let done = guard
            .run("SELECT id FROM items LIMIT 25", &store, None)
            .await
            .unwrap();
        assert_eq!(done.statement.sql, "SELECT id FROM items LIMIT 25");
        assert_eq!(done.result.row_count, 10);
    }

    #[tokio::test]
    async fn test_run_reports_execution_error_with_sql() {
        let (_dir, store) = sqlite_fixture(1);
        let err = guard()
            .run("SELECT nope FROM items", &store, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert_eq!(err.offending_sql(), Some("SELECT nope FROM items LIMIT 500"));
        assert!(err.message().contains("nope"));
    }

    #[tokio::test]
    async fn test_run_subquery_offset_selects_same_rows() {
        use crate::db::{CellValue, DataStore, QueryOptions};

        let (_dir, store) = sqlite_fixture(5);
        let raw = "SELECT id FROM items WHERE id IN \
                   (SELECT id FROM items ORDER BY id DESC LIMIT 2 OFFSET 1) ORDER BY id";

        let done = guard().run(raw, &store, None).await.unwrap();
        assert_eq!(done.statement.sql, format!("{} LIMIT 500", raw));

        let direct = store
            .execute_select(raw, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(done.result.rows, direct.rows);
        assert_eq!(
            done.result.rows,
            vec![vec![CellValue::Int64(2)], vec![CellValue::Int64(3)]]
        );
    }

    #[tokio::test]
    async fn test_run_bracket_identifier_cannot_smuggle_delete() {
        let (_dir, store) = sqlite_fixture(3);
        let err = guard()
            .run("SELECT [it's] FROM items; DELETE FROM items", &store, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationRejected);

        let done = guard()
            .run("SELECT COUNT(*) FROM items", &store, None)
            .await
            .unwrap();
        assert_eq!(done.result.rows[0][0], crate::db::CellValue::Int64(3));
    }

    #[tokio::test]
    async fn test_run_blocked_query_never_reaches_store() {
        let (_dir, store) = sqlite_fixture(3);
        let err = guard()
            .run("SELECT * FROM items; DELETE FROM items", &store, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationRejected);

        let done = guard()
            .run("SELECT COUNT(*) FROM items", &store, None)
            .await
            .unwrap();
        assert_eq!(done.result.rows[0][0], crate::db::CellValue::Int64(3));
    }
}
