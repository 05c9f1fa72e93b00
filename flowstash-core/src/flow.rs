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

//! HTTP flow record
//!
//! One captured request/response pair as produced by a proxy or scanner.

use crate::row::BatchRow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

pub const HTTP_FLOWS_TABLE: &str = "http_flows";

/// Separator used inside the `tags` column.
pub const TAG_SEPARATOR: char = '|';

const FIELDS: &[&str] = &[
    "created_at",
    "updated_at",
    "hidden_index",
    "hash",
    "is_https",
    "url",
    "path",
    "method",
    "status_code",
    "source_type",
    "runtime_id",
    "request",
    "response",
    "remote_addr",
    "tags",
    "body_length",
];

const INDEX_COLUMNS: &[&str] = &["url", "path", "method", "tags", "request", "response"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpFlow {
    pub id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub hidden_index: String,
    pub hash: String,
    pub is_https: bool,
    pub url: String,
    pub path: String,
    pub method: String,
    pub status_code: i64,
    pub source_type: String,
    pub runtime_id: String,
    pub request: String,
    pub response: String,
    pub remote_addr: String,
    pub tags: String,
    pub body_length: i64,
}

impl HttpFlow {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = path_of(&url).to_string();
        Self {
            is_https: url.starts_with("https://"),
            method: method.into(),
            url,
            path,
            ..Default::default()
        }
    }

    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = request.into();
        self
    }

    pub fn with_response(mut self, status_code: i64, response: impl Into<String>) -> Self {
        self.status_code = status_code;
        self.response = response.into();
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    /// Append a tag, skipping duplicates.
    pub fn add_tag(&mut self, tag: &str) {
        if tag.is_empty() || self.tag_list().any(|t| t == tag) {
            return;
        }
        if !self.tags.is_empty() {
            self.tags.push(TAG_SEPARATOR);
        }
        self.tags.push_str(tag);
    }

    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags.split(TAG_SEPARATOR).filter(|t| !t.is_empty())
    }

    /// Content hash over the identifying parts of the flow.
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.is_https as u8]);
        for part in [&self.url, &self.request, &self.hidden_index] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    }
}

fn timestamp(ts: &Option<DateTime<Utc>>) -> Value {
    match ts {
        Some(ts) => Value::Text(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        None => Value::Null,
    }
}

impl BatchRow for HttpFlow {
    fn table_name() -> &'static str {
        HTTP_FLOWS_TABLE
    }

    fn field_names() -> &'static [&'static str] {
        FIELDS
    }

    fn field_value(&self, idx: usize) -> Value {
        match idx {
            0 => timestamp(&self.created_at),
            1 => timestamp(&self.updated_at),
            2 => Value::Text(self.hidden_index.clone()),
            3 => Value::Text(self.hash.clone()),
            4 => Value::Integer(self.is_https as i64),
            5 => Value::Text(self.url.clone()),
            6 => Value::Text(self.path.clone()),
            7 => Value::Text(self.method.clone()),
            8 => Value::Integer(self.status_code),
            9 => Value::Text(self.source_type.clone()),
            10 => Value::Text(self.runtime_id.clone()),
            11 => Value::Text(self.request.clone()),
            12 => Value::Text(self.response.clone()),
            13 => Value::Text(self.remote_addr.clone()),
            14 => Value::Text(self.tags.clone()),
            15 => Value::Integer(self.body_length),
            _ => Value::Null,
        }
    }

    fn row_id(&self) -> Option<i64> {
        self.id
    }

    fn set_row_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn prepare_insert(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        if self.updated_at.is_none() {
            self.updated_at = Some(now);
        }
        if self.hidden_index.is_empty() {
            self.hidden_index = uuid::Uuid::new_v4().to_string();
        }
        if self.hash.is_empty() {
            self.hash = self.compute_hash();
        }
        if self.body_length == 0 {
            self.body_length = self.response.len() as i64;
        }
    }

    fn index_columns() -> &'static [&'static str] {
        INDEX_COLUMNS
    }
}
