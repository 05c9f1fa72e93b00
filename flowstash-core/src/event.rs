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

//! Incremental output fragments for long-running streams.

use serde::{Deserialize, Serialize};

pub const STREAM_EVENTS_TABLE: &str = "stream_events";

/// One fragment of a stream. Fragments with the same `stream_id` are
/// concatenated into a single row, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: String,
    pub event_type: String,
    pub delta: Vec<u8>,
    /// Last fragment of the stream; buffered bytes are flushed and the entry released.
    pub finished: bool,
}

impl StreamEvent {
    pub fn new(stream_id: impl Into<String>, delta: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_type: "stream".to_string(),
            delta: delta.into(),
            finished: false,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}
