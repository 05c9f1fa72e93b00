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

//! Write engine
//!
//! Wires one connection, its write queue and the three pipelines that feed
//! it (stream buffer, flow insert batcher, search index updater) behind a
//! single handle.

use crate::bulk_insert::{BulkInsertWriter, InsertCompletion, PlanCache};
use crate::dialect::dialect_for;
use crate::schema::{ensure_schema, open_connection};
use crate::search_index::{setup_shadow_table, FtsUpdater};
use crate::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::stream_buffer::{read_stream_content, StreamBuffer};
use crate::write_queue::{WriteQueue, WriterHandle};
use flowstash_core::flow::HTTP_FLOWS_TABLE;
use flowstash_core::{
    quote_ident, BatchRow, EngineConfig, FlowstashError, HttpFlow, Result, StreamEvent,
};
use rusqlite::types::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

pub struct WriteEngine {
    config: EngineConfig,
    queue: WriteQueue,
    writer: WriterHandle,
    streams: StreamBuffer,
    flows: BulkInsertWriter<HttpFlow>,
    fts: FtsUpdater,
    stats: Arc<PipelineStats>,
}

impl WriteEngine {
    /// Open the database, create the schema and start the writer thread.
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| FlowstashError::Runtime(format!("no tokio runtime: {}", e)))?;

        let stats = Arc::new(PipelineStats::new());
        let dialect = dialect_for(config.storage.dialect);
        let conn = open_connection(&config.storage)?;
        let queue = WriteQueue::spawn(
            conn,
            dialect,
            config.storage.queue_capacity,
            config.storage.param_limit,
            stats.clone(),
        )?;
        let writer = queue.handle();

        let index = config.index.clone();
        let setup = writer
            .call("open", move |ctx| {
                ensure_schema(ctx.conn())?;
                let indexed = index.enabled
                    && setup_shadow_table(
                        ctx.conn(),
                        HTTP_FLOWS_TABLE,
                        HttpFlow::index_columns(),
                        &index.tokenizer,
                    );
                Ok(indexed)
            })
            .await;
        let indexed = match setup {
            Ok(indexed) => indexed,
            Err(e) => {
                let _ = queue.shutdown().await;
                return Err(e);
            }
        };

        let fts = FtsUpdater::new(
            HTTP_FLOWS_TABLE,
            HttpFlow::index_columns(),
            indexed,
            config.index.clone(),
            writer.clone(),
            stats.clone(),
            runtime.clone(),
        );
        let streams = StreamBuffer::new(config.stream.clone(), stats.clone(), runtime.clone());
        let flows = BulkInsertWriter::new(
            &runtime,
            writer.clone(),
            Some(fts.clone()),
            &config.insert,
            Arc::new(PlanCache::new()),
            stats.clone(),
        );

        info!(
            path = %config.storage.path.display(),
            dialect = writer.dialect().name(),
            indexed,
            "Write engine opened"
        );

        Ok(Self {
            config,
            queue,
            writer,
            streams,
            flows,
            fts,
            stats,
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::in_memory()).await
    }

    // Streams

    pub async fn append(&self, event: StreamEvent) -> Result<()> {
        self.streams.append(&self.writer, event).await
    }

    pub async fn flush_pending_streams(&self) -> Result<()> {
        self.streams.flush_all().await
    }

    pub async fn finish_stream(&self, stream_id: &str) -> Result<()> {
        self.streams.finish(stream_id).await
    }

    /// Persisted content of a stream. Bytes still buffered are not included.
    pub async fn read_stream(&self, stream_id: &str) -> Result<Option<Vec<u8>>> {
        let stream_id = stream_id.to_string();
        self.writer
            .call("read_stream", move |ctx| read_stream_content(ctx, &stream_id))
            .await
    }

    // Flows

    pub async fn submit_flow(
        &self,
        flow: HttpFlow,
        callbacks: Vec<InsertCompletion<HttpFlow>>,
    ) -> Result<()> {
        self.flows.submit(flow, callbacks).await
    }

    pub async fn insert_flow(&self, flow: HttpFlow) -> Result<HttpFlow> {
        self.flows.insert(flow).await
    }

    pub async fn flush_insert_queue(&self) -> Result<()> {
        self.flows.flush().await
    }

    /// Update columns of one flow by id. Returns rows affected. The flow's
    /// search entry is refreshed when an indexed column changes.
    pub async fn update_flow_columns(&self, id: i64, changes: Vec<(String, Value)>) -> Result<usize> {
        let reindex = changes
            .iter()
            .any(|(c, _)| HttpFlow::index_columns().contains(&c.as_str()));
        let affected = self
            .writer
            .call("update_flow", move |ctx| {
                ctx.dialect()
                    .update_columns_by_id(ctx.conn(), HTTP_FLOWS_TABLE, id, changes)
            })
            .await?;
        if affected > 0 && reindex {
            self.fts.enqueue_id(id);
        }
        Ok(affected)
    }

    /// Replace a flow's tags. Duplicates and empty tags are skipped.
    pub async fn update_flow_tags<S: AsRef<str>>(&self, id: i64, tags: &[S]) -> Result<usize> {
        let mut flow = HttpFlow::default();
        for tag in tags {
            flow.add_tag(tag.as_ref());
        }
        self.update_flow_columns(id, vec![("tags".to_string(), Value::Text(flow.tags))])
            .await
    }

    /// Ids of flows whose indexed text matches an FTS5 query, newest first.
    pub async fn search_flow_ids(&self, query: &str, limit: usize) -> Result<Vec<i64>> {
        if !self.fts.is_enabled() {
            return Err(FlowstashError::Config("search index is disabled".into()));
        }
        let sql = format!(
            "SELECT rowid FROM {fts} WHERE {fts} MATCH ?1 ORDER BY rowid DESC LIMIT ?2",
            fts = quote_ident(self.fts.fts_table())
        );
        let query = query.to_string();
        self.writer
            .call("search_flows", move |ctx| {
                let mut stmt = ctx.conn().prepare_cached(&sql)?;
                let ids = stmt
                    .query_map(rusqlite::params![query, limit as i64], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(ids)
            })
            .await
    }

    pub async fn flush_search_index(&self) -> Result<()> {
        self.fts.flush().await
    }

    /// Flush streams, then inserts, then the search index, and wait for the
    /// write queue to drain.
    pub async fn flush_all(&self) -> Result<()> {
        self.flush_pending_streams().await?;
        self.flush_insert_queue().await?;
        self.flush_search_index().await?;
        self.writer.barrier().await
    }

    /// Flush everything and stop the writer thread. The engine rejects
    /// writes afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.flush_all().await {
            warn!(error = %e, "Flush before shutdown failed, pending data may be lost");
        }
        self.queue.shutdown().await?;
        info!(stats = ?self.stats.snapshot(), "Write engine stopped");
        Ok(())
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Raw access to the writer thread, for reads that must observe every
    /// committed write.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    pub fn streams(&self) -> &StreamBuffer {
        &self.streams
    }

    pub fn search_index(&self) -> &FtsUpdater {
        &self.fts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
