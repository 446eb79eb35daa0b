mod boundary;
mod postgres;
mod result;
mod sqlite;

pub use boundary::*;
pub use postgres::*;
pub use result::*;
pub use sqlite::*;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// Per-call execution limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Stop materializing rows once this many were fetched.
    pub max_rows: Option<usize>,
    pub timeout: Option<Duration>,
}

/// A read-only handle to the dataset. Implementations open a fresh
/// connection per call and must refuse writes.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Short human-readable description of the target, for logs and banners.
    fn label(&self) -> String;

    async fn execute_select(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, StoreError>;

    /// Table and column listing in the `-- table` / `  column TYPE` layout
    /// used in model prompts.
    async fn describe_schema(&self) -> Result<String, StoreError>;
}

pub(crate) fn push_table_schema(out: &mut String, table: &str, columns: &[(String, String)]) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str("-- ");
    out.push_str(table);
    for (name, type_name) in columns {
        out.push_str("\n  ");
        out.push_str(name);
        out.push(' ');
        out.push_str(type_name);
    }
}
