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

//! Row abstraction used by the bulk insert writer.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

/// A row that can be written through the batched insert path.
///
/// Field order is stable: `field_value(i)` returns the value for
/// `field_names()[i]`. The auto-increment id is never part of the field list.
pub trait BatchRow: Send + 'static {
    /// Unquoted base table name.
    fn table_name() -> &'static str;

    /// Insertable columns, in bind order.
    fn field_names() -> &'static [&'static str];

    fn field_value(&self, idx: usize) -> Value;

    fn row_id(&self) -> Option<i64>;

    fn set_row_id(&mut self, id: i64);

    /// Fill timestamps and computed columns before the row is bound.
    fn prepare_insert(&mut self, _now: DateTime<Utc>) {}

    /// Columns mirrored into the full-text shadow table. Empty = not indexed.
    fn index_columns() -> &'static [&'static str] {
        &[]
    }

    /// Position of `name` in `field_names()`.
    fn field_index(name: &str) -> Option<usize> {
        Self::field_names().iter().position(|f| *f == name)
    }
}

/// Quote an identifier for SQLite by doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
