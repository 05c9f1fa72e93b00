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

//! Flowstash Storage
//!
//! Write-batching engine over SQLite. Every write goes through one bounded
//! queue consumed by a dedicated thread that owns the connection; three
//! pipelines feed it:
//!
//! - [`StreamBuffer`]: coalesces fragments of a stream into one row
//! - [`BulkInsertWriter`]: batches row inserts into multi-row statements
//! - [`FtsUpdater`]: keeps the full-text shadow table in step, off the hot path
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flowstash_core::{HttpFlow, StreamEvent};
//! use flowstash_storage::WriteEngine;
//!
//! let engine = WriteEngine::open_in_memory().await?;
//! engine.append(StreamEvent::new("chat-1", "hel")).await?;
//! engine.append(StreamEvent::new("chat-1", "lo").finished()).await?;
//! let flow = engine.insert_flow(HttpFlow::new("GET", "https://example.com/")).await?;
//! engine.shutdown().await?;
//! ```

pub mod bulk_insert;
pub mod dialect;
pub mod engine;
pub mod schema;
pub mod search_index;
pub mod stats;
pub mod stream_buffer;
pub mod write_queue;

pub use bulk_insert::{BulkInsertWriter, InsertCompletion, InsertPlan, PlanCache};
pub use dialect::{dialect_for, EmbeddedDialect, NetworkedDialect, SqlDialect};
pub use engine::WriteEngine;
pub use schema::{ensure_schema, open_connection, SCHEMA_VERSION};
pub use search_index::{FtsJob, FtsUpdater};
pub use stats::{PipelineStats, PipelineStatsSnapshot};
pub use stream_buffer::StreamBuffer;
pub use write_queue::{WorkUnit, WriteContext, WriteQueue, WriterHandle};
