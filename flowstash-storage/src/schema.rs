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

//! Connection setup and DDL for the two reference tables.
//!
//! ```text
//! http_flows                         stream_events
//! ┌──────────────────────────┐       ┌───────────────────────┐
//! │ id (PK, autoincrement)   │       │ id (PK)               │
//! │ hidden_index, hash       │       │ stream_id (UNIQUE)    │
//! │ url, path, method, ...   │       │ event_type            │
//! │ request, response, tags  │       │ content BLOB          │
//! └──────────────────────────┘       └───────────────────────┘
//!          ▲ rowid
//! http_flows_fts (FTS5, trigram), maintained by the search index updater
//! ```

use flowstash_core::{FlowstashError, Result, StorageConfig};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// Bump on breaking DDL changes. A database written by a newer version is
/// refused rather than migrated.
pub const SCHEMA_VERSION: i32 = 1;

const CREATE_HTTP_FLOWS: &str = r#"
CREATE TABLE IF NOT EXISTS http_flows (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at   TEXT,
    updated_at   TEXT,
    hidden_index TEXT,
    hash         TEXT,
    is_https     INTEGER NOT NULL DEFAULT 0,
    url          TEXT,
    path         TEXT,
    method       TEXT,
    status_code  INTEGER NOT NULL DEFAULT 0,
    source_type  TEXT,
    runtime_id   TEXT,
    request      TEXT,
    response     TEXT,
    remote_addr  TEXT,
    tags         TEXT,
    body_length  INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_HTTP_FLOWS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_http_flows_hash ON http_flows(hash);
CREATE INDEX IF NOT EXISTS idx_http_flows_source_updated_at ON http_flows(source_type, updated_at);
CREATE INDEX IF NOT EXISTS idx_http_flows_runtime_id_updated_at ON http_flows(runtime_id, updated_at);
"#;

/// NULL `stream_id` marks a keyless row; UNIQUE admits any number of NULLs.
const CREATE_STREAM_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS stream_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id  TEXT UNIQUE,
    event_type TEXT,
    content    BLOB,
    created_at TEXT,
    updated_at TEXT
)
"#;

/// Open (or create) the database file and apply connection pragmas.
pub fn open_connection(config: &StorageConfig) -> Result<Connection> {
    let conn = if is_memory_path(&config.path) {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    };
    configure(&conn, config.busy_timeout())?;
    Ok(conn)
}

fn is_memory_path(path: &Path) -> bool {
    path.as_os_str() == ":memory:"
}

/// WAL with NORMAL sync: one fsync per checkpoint, not per commit.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "Configured connection");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

/// Create tables and indexes if missing, and stamp the schema version.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(FlowstashError::SchemaMismatch(format!(
            "database schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    conn.execute_batch(CREATE_HTTP_FLOWS)?;
    conn.execute_batch(CREATE_HTTP_FLOWS_INDEXES)?;
    conn.execute_batch(CREATE_STREAM_EVENTS)?;

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
