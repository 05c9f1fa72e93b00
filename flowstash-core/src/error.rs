// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine error types

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowstashError>;

/// Errors surfaced by the write engine
#[derive(Debug, Error)]
pub enum FlowstashError {
    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Failed to ensure base row for stream '{stream_id}': {reason}")]
    BaseRow { stream_id: String, reason: String },

    #[error("Insert failed: {message}")]
    InsertFailed { message: String, transient: bool },

    // Queue errors
    #[error("Write queue closed")]
    QueueClosed,

    #[error("Work unit panicked: {0}")]
    WorkerPanic(String),

    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl FlowstashError {
    /// True for SQLite busy/locked contention, which a later attempt may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            FlowstashError::Storage(e) => is_busy(e),
            FlowstashError::BaseRow { reason, .. } => reason.contains("database is locked"),
            FlowstashError::InsertFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Owned copy for handing one batch failure to many waiters.
    pub fn to_insert_failure(&self) -> FlowstashError {
        FlowstashError::InsertFailed {
            message: self.to_string(),
            transient: self.is_transient(),
        }
    }

    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, FlowstashError::SchemaMismatch(_))
    }
}

/// Classify a rusqlite error as lock contention.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) || msg
                .as_deref()
                .map(|m| m.contains("database is locked"))
                .unwrap_or(false)
        }
        other => other.to_string().contains("database is locked"),
    }
}
