use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use super::{push_table_schema, CellValue, ColumnInfo, DataStore, QueryOptions, QueryResult};
use crate::error::StoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `prefer`/`require` modes.
    pub accept_invalid_certs: bool,
    /// PEM bundle of extra trusted roots.
    pub ca_cert_path: Option<String>,
}

/// Serialized with libpq's `sslmode` spellings. Every mode but `disable`
/// negotiates TLS; `accept_invalid_certs` is ignored by the two verify modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("olist"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

/// Read-only PostgreSQL dataset. Each call connects, runs one statement in a
/// `READ ONLY` transaction and disconnects.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    config: PostgresConfig,
}

impl PostgresStore {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    async fn run(&self, sql: &str, options: QueryOptions) -> Result<QueryResult, StoreError> {
        let start = Instant::now();
        let mut client = create_client(&self.config).await?;
        let pg_err = |e: tokio_postgres::Error| StoreError::Postgres(describe_pg_error(&e, sql));

        let tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(pg_err)?;
        if let Some(timeout) = options.timeout {
            tx.batch_execute(&format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis()
            ))
            .await
            .map_err(pg_err)?;
        }

        let stmt = tx.prepare(sql).await.map_err(pg_err)?;
        let rows = match options.max_rows {
            Some(0) => Vec::new(),
            Some(cap) => {
                let portal = tx.bind(&stmt, &[]).await.map_err(pg_err)?;
                let cap = i32::try_from(cap).unwrap_or(i32::MAX);
                tx.query_portal(&portal, cap).await.map_err(pg_err)?
            }
            None => tx.query(&stmt, &[]).await.map_err(pg_err)?,
        };
        tx.rollback().await.map_err(pg_err)?;

        let columns: Vec<ColumnInfo> = stmt
            .columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_().name()))
            .collect();
        let values = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| extract_value(row, i, col.type_()))
                    .collect()
            })
            .collect();

        Ok(QueryResult::new(columns, values, start.elapsed()))
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    fn label(&self) -> String {
        format!("postgres:{}", self.config.display_string())
    }

    async fn execute_select(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, StoreError> {
        match options.timeout {
            // statement_timeout covers the server side; this covers connect
            // and transfer.
            Some(limit) => tokio::time::timeout(limit + CONNECT_TIMEOUT, self.run(sql, options))
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => self.run(sql, options).await,
        }
    }

    async fn describe_schema(&self) -> Result<String, StoreError> {
        const COLUMNS_SQL: &str = "SELECT table_name::text, column_name::text, data_type::text \
             FROM information_schema.columns \
             WHERE table_schema = 'public' \
             ORDER BY table_name, ordinal_position";

        let client = create_client(&self.config).await?;
        let rows = client
            .query(COLUMNS_SQL, &[])
            .await
            .map_err(|e| StoreError::Postgres(describe_pg_error(&e, COLUMNS_SQL)))?;

        let mut out = String::new();
        let mut current: Option<String> = None;
        let mut columns: Vec<(String, String)> = Vec::new();
        for row in &rows {
            let table: String = row.get(0);
            if current.as_deref() != Some(table.as_str()) {
                if let Some(done) = current.take() {
                    push_table_schema(&mut out, &done, &columns);
                    columns.clear();
                }
                current = Some(table);
            }
            columns.push((row.get(1), row.get(2)));
        }
        if let Some(done) = current {
            push_table_schema(&mut out, &done, &columns);
        }
        Ok(out)
    }
}

/// Create a PostgreSQL client. The connection task is spawned onto the
/// current runtime and ends when the client is dropped.
pub async fn create_client(config: &PostgresConfig) -> Result<Client, StoreError> {
    let conn_string = config.connection_string();
    let connect_err = |e: tokio_postgres::Error| StoreError::Connect(e.to_string());
    let timed_out = |_| {
        StoreError::Connect(format!(
            "connection timed out after {}s",
            CONNECT_TIMEOUT.as_secs()
        ))
    };

    debug!(server = %config.display_string(), ssl_mode = ?config.ssl_mode, "connecting");
    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(timed_out)?
                    .map_err(connect_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection error");
                }
            });
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let strict = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(timed_out)?
                    .map_err(connect_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection error");
                }
            });
            client
        }
    };

    Ok(client)
}

/// `strict_verify` is set for verify-ca/verify-full, where invalid
/// certificates are never accepted.
fn build_tls_connector(
    config: &PostgresConfig,
    strict_verify: bool,
) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path).map_err(|e| {
            StoreError::Connect(format!("failed to read CA certificate file {}: {}", ca_path, e))
        })?;
        for block in pem_blocks(&pem) {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .map_err(|e| StoreError::Connect(format!("failed to parse certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| StoreError::Connect(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one string per certificate.
fn pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in pem.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            current = Some(String::new());
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line.trim());
            block.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
        }
    }
    blocks
}

/// Quote a value for use in a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Server errors read as `<class> [SQLSTATE]: message`, followed by the
/// error position, detail and hint when the server sent them. Client-side
/// failures keep their cause.
fn describe_pg_error(err: &tokio_postgres::Error, query: &str) -> String {
    let Some(db) = err.as_db_error() else {
        return match err.source() {
            Some(cause) => format!("{}: {}", err, cause),
            None => err.to_string(),
        };
    };
    let at = match db.position() {
        Some(ErrorPosition::Original(pos)) => Some(line_col(query, *pos as usize)),
        _ => None,
    };
    render_server_error(db.code().code(), db.message(), at, db.detail(), db.hint())
}

fn render_server_error(
    code: &str,
    message: &str,
    at: Option<(usize, usize)>,
    detail: Option<&str>,
    hint: Option<&str>,
) -> String {
    let mut out = format!("{} [{}]: {}", sqlstate_class(code), code, message);
    if let Some((line, col)) = at {
        out.push_str(&format!("\n  at line {}, column {}", line, col));
    }
    if let Some(detail) = detail {
        out.push_str(&format!("\n  detail: {}", detail));
    }
    if let Some(hint) = hint {
        out.push_str(&format!("\n  hint: {}", hint));
    }
    out
}

fn sqlstate_class(code: &str) -> &'static str {
    match code.get(..2) {
        Some("42") if code == "42601" => "syntax error",
        Some("42") => "invalid reference",
        Some("22") | Some("23") => "data error",
        Some("25") | Some("40") => "transaction error",
        Some("53") | Some("54") => "resource limit",
        Some("57") => "query canceled",
        Some("08") => "connection error",
        _ => "database error",
    }
}

/// Line and column (1-based) of a 1-based character position.
fn line_col(query: &str, position: usize) -> (usize, usize) {
    query
        .chars()
        .take(position.saturating_sub(1))
        .fold((1, 1), |(line, col), ch| {
            if ch == '\n' {
                (line + 1, 1)
            } else {
                (line, col + 1)
            }
        })
}

/// NUMERIC decoded from the binary wire format into its decimal text.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        if raw.len() < 8 {
            return Err("numeric value too short".into());
        }
        let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
        let ndigits = word(0) as usize;
        let weight = word(2) as i16 as i32;
        let sign = word(4);
        let dscale = word(6) as usize;
        if raw.len() < 8 + ndigits * 2 {
            return Err("numeric value truncated".into());
        }
        if sign == 0xC000 {
            return Ok(PgNumeric("NaN".into()));
        }
        let digit = |idx: i32| -> u16 {
            if idx >= 0 && (idx as usize) < ndigits {
                word(8 + idx as usize * 2)
            } else {
                0
            }
        };

        let mut text = String::new();
        if sign == 0x4000 {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            text.push_str(&digit(0).to_string());
            for idx in 1..=weight {
                text.push_str(&format!("{:04}", digit(idx)));
            }
        }
        if dscale > 0 {
            let mut fraction = String::new();
            for group in 0..(dscale + 3) / 4 {
                fraction.push_str(&format!("{:04}", digit(weight + 1 + group as i32)));
            }
            fraction.truncate(dscale);
            text.push('.');
            text.push_str(&fraction);
        }
        Ok(PgNumeric(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<PgNumeric>>(idx)
            .ok()
            .flatten()
            .map(|n| match n.0.parse::<f64>() {
                Ok(f) => CellValue::Float64(f),
                Err(_) => CellValue::Text(n.0),
            })
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    }
}
