//! Error taxonomy for a single guarded request.
//!
//! Every stage returns its own failure kind; nothing is retried and the
//! offending SQL travels with the error so callers can show exactly what was
//! blocked or what ran.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::guard::RejectReason;

/// Terminal failure of one guarded request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardError {
    #[error("no SELECT statement found in model output")]
    ExtractionEmpty,

    #[error("Blocked query: {}", join_reasons(.reasons))]
    ValidationRejected {
        reasons: Vec<RejectReason>,
        sql: String,
    },

    #[error("{message}\n\nWhile executing SQL:\n{sql}")]
    Execution { message: String, sql: String },

    #[error("model provider error{}: {message}", format_status(.status))]
    UpstreamModel { status: Option<u16>, message: String },
}

/// Discriminant of [`GuardError`], stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ExtractionEmpty,
    ValidationRejected,
    ExecutionError,
    UpstreamModelError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ExtractionEmpty => write!(f, "extraction_empty"),
            ErrorKind::ValidationRejected => write!(f, "validation_rejected"),
            ErrorKind::ExecutionError => write!(f, "execution_error"),
            ErrorKind::UpstreamModelError => write!(f, "upstream_model_error"),
        }
    }
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::ExtractionEmpty => ErrorKind::ExtractionEmpty,
            GuardError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            GuardError::Execution { .. } => ErrorKind::ExecutionError,
            GuardError::UpstreamModel { .. } => ErrorKind::UpstreamModelError,
        }
    }

    /// The SQL that was rejected or executed, if the failure involved any.
    pub fn offending_sql(&self) -> Option<&str> {
        match self {
            GuardError::ValidationRejected { sql, .. } | GuardError::Execution { sql, .. }
                if !sql.is_empty() =>
            {
                Some(sql)
            }
            _ => None,
        }
    }

    /// The primary rejection reason, for validation failures.
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            GuardError::ValidationRejected { reasons, .. } => reasons.first(),
            _ => None,
        }
    }

    /// Human-readable message without the SQL appended.
    pub fn message(&self) -> String {
        match self {
            GuardError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_failure(&self) -> GuardFailure {
        GuardFailure {
            kind: self.kind(),
            message: self.message(),
            offending_sql: self.offending_sql().map(str::to_string),
        }
    }
}

/// Serializable failure record handed to presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub offending_sql: Option<String>,
}

impl From<&GuardError> for GuardFailure {
    fn from(err: &GuardError) -> Self {
        err.to_failure()
    }
}

/// Failures raised by a data store before the boundary attaches the SQL.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("query worker failed: {0}")]
    Worker(String),
}

fn join_reasons(reasons: &[RejectReason]) -> String {
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}
