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

//! Flowstash Core
//!
//! Shared types for the write-buffering engine: the error type, configuration,
//! the row models that flow through the batchers, and the resilience
//! primitives used by the backpressure policy.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod resilience;
pub mod row;
pub mod telemetry;

pub use config::{
    DialectKind, EngineConfig, IndexConfig, InsertBatchConfig, StorageConfig,
    StreamBufferConfig, DEFAULT_PARAM_LIMIT,
};
pub use error::{FlowstashError, Result};
pub use event::StreamEvent;
pub use flow::HttpFlow;
pub use resilience::{FlushMode, PendingState, RetryPolicy};
pub use row::{quote_ident, BatchRow};
