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

//! Insert plans
//!
//! A plan is the intersection of a row type's fields with the live columns
//! of its table, plus the statement shape that fits the engine's bind
//! parameter ceiling. Plans never change once built.

use crate::dialect::SqlDialect;
use dashmap::DashMap;
use flowstash_core::{BatchRow, FlowstashError, Result};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::Arc;

/// Plans by table name, shared by every writer of one engine.
pub type PlanCache = DashMap<String, Arc<InsertPlan>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanColumn {
    pub name: String,
    pub quoted: String,
    /// Index into the row type's `field_names()`.
    pub field_idx: usize,
}

#[derive(Debug)]
pub struct InsertPlan {
    table: String,
    quoted_table: String,
    columns: Vec<PlanColumn>,
    /// `(?, ?, ...)` for one row
    row_placeholders: String,
    max_rows: usize,
}

/// Rows per statement so that rows * columns stays within `param_limit`.
/// Never below one, even when a single row alone exceeds the limit.
pub fn rows_per_statement(param_limit: usize, columns: usize) -> usize {
    if columns == 0 {
        return 1;
    }
    (param_limit / columns).max(1)
}

impl InsertPlan {
    pub fn build(
        dialect: &dyn SqlDialect,
        conn: &Connection,
        table: &str,
        fields: &[&str],
        param_limit: usize,
    ) -> Result<Self> {
        let live: HashSet<String> = dialect
            .live_columns(conn, table)?
            .into_iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let columns: Vec<PlanColumn> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| live.contains(&f.to_ascii_lowercase()))
            .map(|(idx, f)| PlanColumn {
                name: f.to_string(),
                quoted: dialect.quote_ident(f),
                field_idx: idx,
            })
            .collect();

        if columns.is_empty() {
            return Err(FlowstashError::SchemaMismatch(format!(
                "table {} has none of the {} insertable columns",
                table,
                fields.len()
            )));
        }
        if columns.len() < fields.len() {
            tracing::warn!(
                table,
                usable = columns.len(),
                declared = fields.len(),
                "Table is missing columns, inserting the subset it has"
            );
        }

        let row_placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let max_rows = rows_per_statement(param_limit, columns.len());

        Ok(Self {
            table: table.to_string(),
            quoted_table: dialect.quote_ident(table),
            columns,
            row_placeholders,
            max_rows,
        })
    }

    pub fn for_row<R: BatchRow>(
        dialect: &dyn SqlDialect,
        conn: &Connection,
        param_limit: usize,
    ) -> Result<Self> {
        Self::build(dialect, conn, R::table_name(), R::field_names(), param_limit)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[PlanColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Multi-row INSERT for `rows` rows (`rows <= max_rows`).
    pub fn statement(&self, rows: usize) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| c.quoted.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let values = vec![self.row_placeholders.as_str(); rows.max(1)].join(", ");
        format!("INSERT INTO {} ({}) VALUES {}", self.quoted_table, cols, values)
    }

    pub fn row_values<R: BatchRow>(&self, row: &R) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| row.field_value(c.field_idx))
            .collect()
    }

    /// Bind values for a chunk, row-major.
    pub fn bind_values<'a, R, I>(&self, rows: I) -> Vec<Value>
    where
        R: BatchRow + 'a,
        I: IntoIterator<Item = &'a R>,
    {
        let mut values = Vec::new();
        for row in rows {
            values.extend(self.columns.iter().map(|c| row.field_value(c.field_idx)));
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::EmbeddedDialect;
    use flowstash_core::HttpFlow;
    use proptest::prelude::*;

    fn partial_table() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE http_flows (id INTEGER PRIMARY KEY AUTOINCREMENT, url TEXT, METHOD TEXT, extra TEXT)",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_plan_uses_live_subset_in_field_order() {
        let conn = partial_table();
        let plan = InsertPlan::for_row::<HttpFlow>(&EmbeddedDialect, &conn, 999).unwrap();
        assert_eq!(plan.column_names(), vec!["url", "method"]);
        assert_eq!(plan.max_rows(), 499);
        assert_eq!(
            plan.statement(2),
            "INSERT INTO \"http_flows\" (\"url\", \"method\") VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn test_bind_values_follow_columns() {
        let conn = partial_table();
        let plan = InsertPlan::for_row::<HttpFlow>(&EmbeddedDialect, &conn, 999).unwrap();
        let rows = vec![HttpFlow::new("GET", "http://a/"), HttpFlow::new("POST", "http://b/")];
        assert_eq!(
            plan.bind_values(&rows),
            vec![
                Value::Text("http://a/".into()),
                Value::Text("GET".into()),
                Value::Text("http://b/".into()),
                Value::Text("POST".into()),
            ]
        );
    }

    #[test]
    fn test_missing_table_is_schema_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        let err = InsertPlan::for_row::<HttpFlow>(&EmbeddedDialect, &conn, 999).unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_rows_per_statement_floor() {
        assert_eq!(rows_per_statement(999, 16), 62);
        assert_eq!(rows_per_statement(10, 16), 1);
        assert_eq!(rows_per_statement(16, 16), 1);
        assert_eq!(rows_per_statement(32, 16), 2);
    }

    proptest! {
        #[test]
        fn prop_plan_never_exceeds_param_limit(limit in 1usize..100_000, cols in 1usize..200) {
            let rows = rows_per_statement(limit, cols);
            prop_assert!(rows >= 1);
            if cols <= limit {
                prop_assert!(rows * cols <= limit);
                // and it is the largest such count
                prop_assert!((rows + 1) * cols > limit);
            }
        }
    }
}
