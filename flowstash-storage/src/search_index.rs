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

//! Incremental full-text index maintenance
//!
//! Keeps `<table>_fts` (FTS5) in step with the base table without putting
//! indexing on the insert path.
//!
//! ```text
//! enqueue(job) ──► queue depth > threshold? ──yes──► deferred ids (capped)
//!                        │ no                              │ drain tick
//!                        ▼                                 ▼
//!                  bounded channel ◄───────────────────────┘
//!                        │ batch_size / batch_interval
//!                        ▼
//!                  one unit on the write queue:
//!                    inline docs  → DELETE rowid IN + multi-row INSERT
//!                    id-only jobs → DELETE rowid IN + INSERT .. SELECT
//! ```
//!
//! When both the channel and the deferred set are full the index entry is
//! dropped with a warning. The base row is never affected.
//!
//! The shadow table is contentless: it holds tokens only, and a match
//! yields the base row id as its rowid.

use crate::stats::PipelineStats;
use crate::write_queue::{WorkUnit, WriteContext, WriterHandle};
use flowstash_core::{quote_ident, FlowstashError, IndexConfig, PendingState, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One row's index update. `document` carries the indexed column values in
/// `columns` order; None means re-read the row by id.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsJob {
    pub row_id: i64,
    pub document: Option<Vec<Value>>,
}

impl FtsJob {
    pub fn inline(row_id: i64, document: Vec<Value>) -> Self {
        Self {
            row_id,
            document: Some(document),
        }
    }

    pub fn by_id(row_id: i64) -> Self {
        Self {
            row_id,
            document: None,
        }
    }
}

/// Aggregate payload size of a slow batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadDiagnostics {
    pub rows: i64,
    pub total_bytes: i64,
    pub max_row_bytes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FtsBatchReport {
    pub inline_rows: usize,
    pub reselected_rows: usize,
    pub elapsed: Duration,
    pub diagnostics: Option<PayloadDiagnostics>,
}

/// Create the contentless shadow table and index base rows it is missing.
/// Returns false (and logs) when the engine lacks FTS5 or the tokenizer;
/// indexing is then disabled.
pub fn setup_shadow_table(
    conn: &Connection,
    base_table: &str,
    columns: &[&str],
    tokenizer: &str,
) -> bool {
    let fts = fts_table_name(base_table);
    let sql = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5({}, tokenize='{}', content='', contentless_delete=1)",
        quote_ident(&fts),
        column_list(columns),
        tokenizer.replace('\'', "''")
    );
    if let Err(e) = conn.execute_batch(&sql) {
        warn!(table = base_table, error = %e, "Full-text index unavailable, indexing disabled");
        return false;
    }

    match backfill_shadow_table(conn, base_table, columns) {
        Ok(0) => {}
        Ok(rows) => info!(table = %fts, rows, "Indexed rows missing from the shadow table"),
        Err(e) => warn!(table = %fts, error = %e, "Shadow table backfill failed"),
    }
    info!(table = %fts, tokenizer, "Full-text shadow table ready");
    true
}

/// Index base rows above the highest indexed rowid: everything for a new
/// table, and rows written while indexing was off.
fn backfill_shadow_table(conn: &Connection, base_table: &str, columns: &[&str]) -> Result<usize> {
    let fts = quote_ident(&fts_table_name(base_table));
    let indexed: i64 = conn
        .query_row(
            &format!("SELECT rowid FROM {} ORDER BY rowid DESC LIMIT 1", fts),
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let cols = column_list(columns);
    let rows = conn.execute(
        &format!(
            "INSERT INTO {fts} (rowid, {cols}) SELECT id, {cols} FROM {} WHERE id > ?1",
            quote_ident(base_table)
        ),
        [indexed],
    )?;
    Ok(rows)
}

fn column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn fts_table_name(base_table: &str) -> String {
    format!("{}_fts", base_table)
}

enum FtsMessage {
    Job(FtsJob),
    Flush(oneshot::Sender<()>),
}

/// Immutable pieces the background loops and batch units share.
struct FtsShared {
    base_table: String,
    fts_table: String,
    columns: Vec<String>,
    config: IndexConfig,
    stats: Arc<PipelineStats>,
}

struct FtsInner {
    shared: Arc<FtsShared>,
    enabled: AtomicBool,
    defer_threshold: usize,
    writer: WriterHandle,
    runtime: Handle,
    sender: parking_lot::Mutex<Option<mpsc::Sender<FtsMessage>>>,
    deferred: parking_lot::Mutex<BTreeSet<i64>>,
}

/// Search index updater for one base table. Cheap to clone.
#[derive(Clone)]
pub struct FtsUpdater {
    inner: Arc<FtsInner>,
}

impl FtsUpdater {
    /// `enabled` is the outcome of [`setup_shadow_table`] (or false when
    /// indexing is configured off).
    pub fn new(
        base_table: &str,
        columns: &[&str],
        enabled: bool,
        config: IndexConfig,
        writer: WriterHandle,
        stats: Arc<PipelineStats>,
        runtime: Handle,
    ) -> Self {
        let defer_threshold = config.effective_defer_threshold(writer.capacity());
        Self {
            inner: Arc::new(FtsInner {
                shared: Arc::new(FtsShared {
                    base_table: base_table.to_string(),
                    fts_table: fts_table_name(base_table),
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    config,
                    stats,
                }),
                enabled: AtomicBool::new(enabled && !columns.is_empty()),
                defer_threshold,
                writer,
                runtime,
                sender: parking_lot::Mutex::new(None),
                deferred: parking_lot::Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn columns(&self) -> &[String] {
        &self.inner.shared.columns
    }

    pub fn fts_table(&self) -> &str {
        &self.inner.shared.fts_table
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.lock().len()
    }

    /// Queue an index update. Never blocks; safe to call from the writer
    /// thread.
    pub fn enqueue(&self, job: FtsJob) {
        if !self.is_enabled() || job.row_id <= 0 {
            return;
        }
        let stats = &self.inner.shared.stats;
        stats.record_index(PendingState::Submitted);

        let sender = self.sender();
        if self.inner.writer.queue_len() > self.inner.defer_threshold {
            self.defer(job.row_id);
            return;
        }

        match sender.try_send(FtsMessage::Job(job)) {
            Ok(()) => stats.record_index(PendingState::Queued),
            Err(mpsc::error::TrySendError::Full(FtsMessage::Job(job))) => self.defer(job.row_id),
            Err(mpsc::error::TrySendError::Closed(FtsMessage::Job(job))) => {
                stats.record_index(PendingState::DroppedWithLog);
                warn!(row_id = job.row_id, "Index worker gone, search entry dropped");
            }
            Err(_) => {}
        }
    }

    /// Queue a re-read of `row_id`.
    pub fn enqueue_id(&self, row_id: i64) {
        self.enqueue(FtsJob::by_id(row_id));
    }

    fn defer(&self, row_id: i64) {
        let stats = &self.inner.shared.stats;
        let mut deferred = self.inner.deferred.lock();
        if deferred.contains(&row_id) {
            return;
        }
        if deferred.len() >= self.inner.shared.config.deferred_cap {
            drop(deferred);
            stats.record_index(PendingState::DroppedWithLog);
            warn!(
                row_id,
                table = %self.inner.shared.base_table,
                "Index queue and deferred set full, search entry dropped (base row kept)"
            );
            return;
        }
        deferred.insert(row_id);
        stats.record_index(PendingState::Deferred);
    }

    /// Sender for the batch worker, starting the worker and the drain ticker
    /// on first use.
    fn sender(&self) -> mpsc::Sender<FtsMessage> {
        let mut slot = self.inner.sender.lock();
        if let Some(tx) = slot.as_ref() {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.shared.config.channel_capacity.max(1));
        debug!(table = %self.inner.shared.base_table, "Starting index workers");
        self.inner.runtime.spawn(run_batch_worker(
            rx,
            self.inner.shared.clone(),
            self.inner.writer.clone(),
        ));
        self.inner
            .runtime
            .spawn(run_drain_ticker(Arc::downgrade(&self.inner)));
        *slot = Some(tx.clone());
        tx
    }

    /// Move up to `drain_batch` deferred ids back to the worker, if the
    /// write queue has room. Ids that don't fit stay deferred.
    pub fn drain_deferred(&self) -> usize {
        if self.inner.writer.queue_len() > self.inner.defer_threshold {
            return 0;
        }
        let ids: Vec<i64> = {
            let mut deferred = self.inner.deferred.lock();
            let take = self.inner.shared.config.drain_batch.min(deferred.len());
            (0..take).filter_map(|_| deferred.pop_first()).collect()
        };
        if ids.is_empty() {
            return 0;
        }

        let sender = self.sender();
        let mut moved = 0;
        let mut rest = ids.into_iter();
        for id in rest.by_ref() {
            match sender.try_send(FtsMessage::Job(FtsJob::by_id(id))) {
                Ok(()) => {
                    moved += 1;
                    self.inner.shared.stats.record_index(PendingState::Queued);
                }
                Err(_) => {
                    self.inner.deferred.lock().insert(id);
                    break;
                }
            }
        }
        let leftover: Vec<i64> = rest.collect();
        if !leftover.is_empty() {
            self.inner.deferred.lock().extend(leftover);
        }
        if moved > 0 {
            debug!(moved, remaining = self.deferred_len(), "Drained deferred index ids");
        }
        moved
    }

    /// Wait until every deferred and queued index job has been applied.
    pub async fn flush(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let sender = self.sender();
        let ids: Vec<i64> = std::mem::take(&mut *self.inner.deferred.lock())
            .into_iter()
            .collect();
        for id in ids {
            sender
                .send(FtsMessage::Job(FtsJob::by_id(id)))
                .await
                .map_err(|_| FlowstashError::QueueClosed)?;
        }
        let (done, wait) = oneshot::channel();
        sender
            .send(FtsMessage::Flush(done))
            .await
            .map_err(|_| FlowstashError::QueueClosed)?;
        wait.await.map_err(|_| FlowstashError::QueueClosed)
    }
}

async fn run_batch_worker(
    mut rx: mpsc::Receiver<FtsMessage>,
    shared: Arc<FtsShared>,
    writer: WriterHandle,
) {
    let max_batch = shared.config.batch_size.max(1);
    let max_wait = shared.config.batch_interval();
    let mut batch: Vec<FtsJob> = Vec::with_capacity(max_batch);

    loop {
        let mut waiters = Vec::new();
        match rx.recv().await {
            Some(FtsMessage::Job(job)) => batch.push(job),
            Some(FtsMessage::Flush(done)) => waiters.push(done),
            None => break,
        }

        let batch_start = Instant::now();
        while waiters.is_empty() && batch.len() < max_batch {
            let remaining = max_wait.saturating_sub(batch_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(FtsMessage::Job(job))) => batch.push(job),
                Ok(Some(FtsMessage::Flush(done))) => waiters.push(done),
                Ok(None) | Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let jobs = std::mem::replace(&mut batch, Vec::with_capacity(max_batch));
            let unit = FtsBatchUnit {
                jobs,
                shared: shared.clone(),
            };
            if writer.enqueue(Box::new(unit)).await.is_err() {
                warn!("Write queue closed, index batch discarded");
            }
        }

        if !waiters.is_empty() {
            let _ = writer.barrier().await;
            for done in waiters {
                let _ = done.send(());
            }
        }
    }

    if !batch.is_empty() {
        let _ = writer
            .enqueue(Box::new(FtsBatchUnit {
                jobs: batch,
                shared,
            }))
            .await;
    }
    debug!("Index batch worker stopped");
}

async fn run_drain_ticker(weak: Weak<FtsInner>) {
    let period = match weak.upgrade() {
        Some(inner) => inner.shared.config.drain_interval(),
        None => return,
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        FtsUpdater { inner }.drain_deferred();
    }
}

struct FtsBatchUnit {
    jobs: Vec<FtsJob>,
    shared: Arc<FtsShared>,
}

impl WorkUnit for FtsBatchUnit {
    fn apply(self: Box<Self>, ctx: &mut WriteContext) {
        let count = self.jobs.len();
        match apply_batch(ctx, &self.shared, self.jobs) {
            Ok(report) => {
                let slow = report.diagnostics.is_some();
                self.shared
                    .stats
                    .record_index_batch(report.inline_rows + report.reselected_rows, slow);
                debug!(
                    table = %self.shared.fts_table,
                    inline = report.inline_rows,
                    reselected = report.reselected_rows,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Applied index batch"
                );
            }
            Err(e) => {
                self.shared.stats.record_index_batch_failure();
                error!(table = %self.shared.fts_table, jobs = count, error = %e, "Index batch failed");
            }
        }
    }

    fn abandon(self: Box<Self>) {
        warn!(jobs = self.jobs.len(), "Index batch abandoned, write queue closed");
    }

    fn label(&self) -> &'static str {
        "index_batch"
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Apply one batch inside a single transaction.
fn apply_batch(ctx: &mut WriteContext, shared: &FtsShared, jobs: Vec<FtsJob>) -> Result<FtsBatchReport> {
    let started = Instant::now();
    let limit = ctx.param_limit();

    // last job per row wins
    let mut latest: BTreeMap<i64, Option<Vec<Value>>> = BTreeMap::new();
    for job in jobs {
        latest.insert(job.row_id, job.document);
    }
    let mut inline: Vec<(i64, Vec<Value>)> = Vec::new();
    let mut by_id: Vec<i64> = Vec::new();
    for (id, doc) in latest {
        match doc {
            Some(doc) if doc.len() == shared.columns.len() => inline.push((id, doc)),
            _ => by_id.push(id),
        }
    }

    let fts = quote_ident(&shared.fts_table);
    let base = quote_ident(&shared.base_table);
    let cols = column_list(&shared.columns);

    let tx = ctx
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;

    let per_row = shared.columns.len() + 1;
    let rows_per_chunk = (limit / per_row).max(1);
    for chunk in inline.chunks(rows_per_chunk) {
        let ids: Vec<Value> = chunk.iter().map(|(id, _)| Value::Integer(*id)).collect();
        tx.prepare_cached(&format!(
            "DELETE FROM {} WHERE rowid IN ({})",
            fts,
            placeholders(ids.len())
        ))?
        .execute(params_from_iter(ids))?;

        let row = format!("({})", placeholders(per_row));
        let sql = format!(
            "INSERT INTO {} (rowid, {}) VALUES {}",
            fts,
            cols,
            vec![row.as_str(); chunk.len()].join(", ")
        );
        let mut values = Vec::with_capacity(chunk.len() * per_row);
        for (id, doc) in chunk {
            values.push(Value::Integer(*id));
            values.extend(doc.iter().cloned());
        }
        tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    }

    for chunk in by_id.chunks(limit.max(1)) {
        let ids = || chunk.iter().map(|id| Value::Integer(*id));
        tx.prepare_cached(&format!(
            "DELETE FROM {} WHERE rowid IN ({})",
            fts,
            placeholders(chunk.len())
        ))?
        .execute(params_from_iter(ids()))?;
        tx.prepare_cached(&format!(
            "INSERT INTO {fts} (rowid, {cols}) SELECT id, {cols} FROM {base} WHERE id IN ({})",
            placeholders(chunk.len())
        ))?
        .execute(params_from_iter(ids()))?;
    }

    tx.commit()?;

    let mut report = FtsBatchReport {
        inline_rows: inline.len(),
        reselected_rows: by_id.len(),
        elapsed: started.elapsed(),
        diagnostics: None,
    };

    if report.elapsed > shared.config.slow_apply() {
        let ids: Vec<i64> = inline
            .iter()
            .map(|(id, _)| *id)
            .chain(by_id.iter().copied())
            .take(limit.max(1))
            .collect();
        match payload_diagnostics(ctx.conn(), shared, &ids) {
            Ok(diag) => {
                warn!(
                    table = %shared.base_table,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    rows = diag.rows,
                    total_bytes = diag.total_bytes,
                    max_row_bytes = diag.max_row_bytes,
                    "Slow index batch"
                );
                report.diagnostics = Some(diag);
            }
            Err(e) => {
                debug!(error = %e, "Failed to collect slow batch diagnostics");
                report.diagnostics = Some(PayloadDiagnostics::default());
            }
        }
    }

    Ok(report)
}

fn payload_diagnostics(conn: &Connection, shared: &FtsShared, ids: &[i64]) -> Result<PayloadDiagnostics> {
    if ids.is_empty() {
        return Ok(PayloadDiagnostics::default());
    }
    let size = shared
        .columns
        .iter()
        .map(|c| format!("COALESCE(LENGTH({}), 0)", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" + ");
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(sz), 0), COALESCE(MAX(sz), 0) FROM (SELECT {} AS sz FROM {} WHERE id IN ({}))",
        size,
        quote_ident(&shared.base_table),
        placeholders(ids.len())
    );
    let diag = conn.query_row(&sql, params_from_iter(ids.iter()), |row| {
        Ok(PayloadDiagnostics {
            rows: row.get(0)?,
            total_bytes: row.get(1)?,
            max_row_bytes: row.get(2)?,
        })
    })?;
    Ok(diag)
}
