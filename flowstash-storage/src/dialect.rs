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

//! SQL dialects
//!
//! The engine talks to the store through a small capability set: how to
//! quote, how to append bytes to a column in place, whether multi-row inserts
//! are allowed, and how to ask the store for its live columns and parameter
//! ceiling. The embedded dialect is the primary target; the networked dialect
//! appends with `CONCAT` and inserts one row at a time.

use flowstash_core::{DialectKind, Result, DEFAULT_PARAM_LIMIT};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::fmt;
use std::sync::Arc;

/// Ceiling used by the networked server protocol (u16 placeholder count).
pub const NETWORKED_PARAM_LIMIT: usize = 65_535;

const MAX_VARIABLE_NUMBER: &str = "MAX_VARIABLE_NUMBER=";

pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn kind(&self) -> DialectKind;

    fn quote_ident(&self, name: &str) -> String;

    /// SQL expression appending one bound parameter to `column`, or None when
    /// the caller has to read-modify-write.
    fn append_expression(&self, column: &str) -> Option<String>;

    /// Whether one statement may carry many VALUES tuples.
    fn supports_bulk_insert(&self) -> bool;

    /// Upper bound on bind parameters in one statement.
    fn param_limit(&self, conn: &Connection) -> Result<usize>;

    /// Columns currently present on `table`, in declaration order.
    fn live_columns(&self, conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        let cols = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    fn last_insert_id(&self, conn: &Connection) -> i64 {
        conn.last_insert_rowid()
    }

    /// Insert one row. Returns (rows affected, new id).
    fn insert_row(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[&str],
        values: Vec<Value>,
    ) -> Result<(usize, i64)> {
        let cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_ident(table),
            cols,
            placeholders
        );
        let affected = conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(values))?;
        Ok((affected, self.last_insert_id(conn)))
    }

    /// `UPDATE table SET col = ?, ... WHERE id = ?`. Returns rows affected.
    fn update_columns_by_id(
        &self,
        conn: &Connection,
        table: &str,
        id: i64,
        changes: Vec<(String, Value)>,
    ) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        let sets = changes
            .iter()
            .map(|(c, _)| format!("{} = ?", self.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.quote_ident(table),
            sets,
            self.quote_ident("id")
        );
        let mut values: Vec<Value> = changes.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Integer(id));
        let affected = conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(values))?;
        Ok(affected)
    }
}

/// Single-file embedded engine (SQLite).
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedDialect;

impl SqlDialect for EmbeddedDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Embedded
    }

    fn quote_ident(&self, name: &str) -> String {
        flowstash_core::quote_ident(name)
    }

    fn append_expression(&self, column: &str) -> Option<String> {
        Some(format!("COALESCE({}, X'') || ?", self.quote_ident(column)))
    }

    fn supports_bulk_insert(&self) -> bool {
        true
    }

    fn param_limit(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare("PRAGMA compile_options")?;
        let options = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(parse_param_limit(&options).unwrap_or(DEFAULT_PARAM_LIMIT))
    }
}

/// Networked server fallback. Uses backtick quoting and `CONCAT` appends, and
/// never batches inserts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkedDialect;

impl SqlDialect for NetworkedDialect {
    fn name(&self) -> &'static str {
        "networked"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Networked
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn append_expression(&self, column: &str) -> Option<String> {
        Some(format!("CONCAT(COALESCE({}, ''), ?)", self.quote_ident(column)))
    }

    fn supports_bulk_insert(&self) -> bool {
        false
    }

    fn param_limit(&self, _conn: &Connection) -> Result<usize> {
        Ok(NETWORKED_PARAM_LIMIT)
    }
}

pub fn dialect_for(kind: DialectKind) -> Arc<dyn SqlDialect> {
    match kind {
        DialectKind::Embedded => Arc::new(EmbeddedDialect),
        DialectKind::Networked => Arc::new(NetworkedDialect),
    }
}

/// Pull `MAX_VARIABLE_NUMBER=N` out of `PRAGMA compile_options` output.
pub fn parse_param_limit<S: AsRef<str>>(options: &[S]) -> Option<usize> {
    options.iter().find_map(|opt| {
        opt.as_ref()
            .strip_prefix(MAX_VARIABLE_NUMBER)
            .and_then(|n| n.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
    })
}
