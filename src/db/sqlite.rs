use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use super::{push_table_schema, CellValue, ColumnInfo, DataStore, QueryOptions, QueryResult};
use crate::error::StoreError;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only SQLite dataset. Every call opens its own connection on a
/// blocking worker.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::Connect(format!(
                "database file not found: {}",
                self.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    fn label(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    async fn execute_select(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, StoreError> {
        let store = self.clone();
        let sql = sql.to_string();
        let (handle_tx, handle_rx) = oneshot::channel();

        let task = tokio::task::spawn_blocking(move || {
            let conn = store.open()?;
            let _ = handle_tx.send(conn.get_interrupt_handle());
            run_query(&conn, &sql, options.max_rows)
        });

        let joined = match options.timeout {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    if let Ok(handle) = handle_rx.await {
                        handle.interrupt();
                    }
                    debug!(?limit, "interrupted sqlite query");
                    return Err(StoreError::Timeout(limit));
                }
            },
        };

        joined.map_err(|e| StoreError::Worker(e.to_string()))?
    }

    async fn describe_schema(&self) -> Result<String, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.open()?;
            schema_text(&conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    max_rows: Option<usize>,
) -> Result<QueryResult, StoreError> {
    let start = Instant::now();
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = names.len();

    let mut rows = stmt.query([])?;
    let mut out: Vec<Vec<CellValue>> = Vec::new();
    let mut types: Vec<Option<&'static str>> = vec![None; width];

    loop {
        if max_rows.is_some_and(|cap| out.len() >= cap) {
            break;
        }
        let Some(row) = rows.next()? else {
            break;
        };
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            let value = row.get_ref(i)?;
            if types[i].is_none() {
                types[i] = storage_class(&value);
            }
            values.push(cell_from_ref(value));
        }
        out.push(values);
    }

    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, ty)| ColumnInfo::new(name, ty.unwrap_or("NULL")))
        .collect();

    Ok(QueryResult::new(columns, out, start.elapsed()))
}

fn storage_class(value: &ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

fn cell_from_ref(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int64(i),
        ValueRef::Real(f) => CellValue::Float64(f),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Bytes(b.to_vec()),
    }
}

fn schema_text(conn: &Connection) -> Result<String, StoreError> {
    let mut tables_stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY 1",
    )?;
    let tables = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns_stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let mut out = String::new();
    for table in &tables {
        let columns = columns_stmt
            .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        push_table_schema(&mut out, table, &columns);
    }
    Ok(out)
}
