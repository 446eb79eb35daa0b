use std::time::Duration;
use tracing::{info, warn};

use super::{DataStore, QueryOptions, QueryResult};
use crate::error::GuardError;
use crate::guard::token::{append_clause, contains_top_level_keyword, strip_terminator};

/// Execute a finalized statement against a read-only store.
///
/// One trailing terminator is dropped and, when `max_rows` is given and the
/// statement has no LIMIT outside parentheses, `LIMIT <max_rows>` is appended. The store
/// never materializes more than `max_rows` rows regardless of what the
/// statement asks for. Failures carry the exact text that was executed.
pub async fn execute_bounded(
    store: &dyn DataStore,
    sql: &str,
    max_rows: Option<usize>,
    timeout: Option<Duration>,
) -> Result<QueryResult, GuardError> {
    let mut statement = strip_terminator(sql);
    if let Some(cap) = max_rows {
        if !contains_top_level_keyword(&statement, "LIMIT") {
            statement = append_clause(&statement, &format!("LIMIT {}", cap));
        }
    }

    info!(store = %store.label(), sql = %statement, "executing");
    let options = QueryOptions { max_rows, timeout };
    match store.execute_select(&statement, options).await {
        Ok(mut result) => {
            result.truncated = max_rows.is_some_and(|cap| result.row_count >= cap);
            info!(
                rows = result.row_count,
                truncated = result.truncated,
                elapsed_ms = result.execution_time.as_millis() as u64,
                "query finished"
            );
            Ok(result)
        }
        Err(e) => {
            warn!(error = %e, "query failed");
            Err(GuardError::Execution {
                message: e.to_string(),
                sql: statement,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CellValue, ColumnInfo};
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records what it was asked to run and returns `rows` rows, capped.
    struct RecordingStore {
        rows: usize,
        fail: Option<&'static str>,
        seen: Mutex<Vec<(String, QueryOptions)>>,
    }

    impl RecordingStore {
        fn new(rows: usize) -> Self {
            Self {
                rows,
                fail: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn last_sql(&self) -> String {
            self.seen.lock().unwrap().last().unwrap().0.clone()
        }
    }

    #[async_trait]
    impl DataStore for RecordingStore {
        fn label(&self) -> String {
            "recording".into()
        }

        async fn execute_select(
            &self,
            sql: &str,
            options: QueryOptions,
        ) -> Result<QueryResult, StoreError> {
            self.seen.lock().unwrap().push((sql.to_string(), options));
            if let Some(message) = self.fail {
                return Err(StoreError::Postgres(message.into()));
            }
            let n = options.max_rows.map_or(self.rows, |cap| cap.min(self.rows));
            let rows = (0..n).map(|i| vec![CellValue::Int64(i as i64)]).collect();
            Ok(QueryResult::new(
                vec![ColumnInfo::new("n", "INTEGER")],
                rows,
                Duration::ZERO,
            ))
        }

        async fn describe_schema(&self) -> Result<String, StoreError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_appends_cap_and_strips_terminator() {
        let store = RecordingStore::new(3);
        let result = execute_bounded(&store, "SELECT n FROM t;", Some(10), None)
            .await
            .unwrap();
        assert_eq!(store.last_sql(), "SELECT n FROM t LIMIT 10");
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_large_limit_is_capped_at_fetch() {
        let store = RecordingStore::new(10_000);
        let result = execute_bounded(&store, "SELECT n FROM t LIMIT 10000", Some(500), None)
            .await
            .unwrap();
        assert_eq!(store.last_sql(), "SELECT n FROM t LIMIT 10000");
        assert_eq!(result.row_count, 500);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_no_cap_passes_sql_through() {
        let store = RecordingStore::new(2);
        execute_bounded(&store, "SELECT 1", None, None).await.unwrap();
        assert_eq!(store.last_sql(), "SELECT 1");
    }

    #[tokio::test]
    async fn test_failure_carries_executed_sql() {
        let mut store = RecordingStore::new(0);
        store.fail = Some("relation \"nope\" does not exist");
        let err = execute_bounded(&store, "SELECT * FROM nope;", Some(5), None)
            .await
            .unwrap_err();
        match err {
            GuardError::Execution { message, sql } => {
                assert_eq!(message, "relation \"nope\" does not exist");
                assert_eq!(sql, "SELECT * FROM nope LIMIT 5");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_forwarded() {
        let store = RecordingStore::new(1);
        let timeout = Some(Duration::from_secs(20));
        execute_bounded(&store, "SELECT 1", Some(1), timeout)
            .await
            .unwrap();
        let seen = store.seen.lock().unwrap();
        assert_eq!(seen[0].1.timeout, timeout);
        assert_eq!(seen[0].1.max_rows, Some(1));
    }
}
