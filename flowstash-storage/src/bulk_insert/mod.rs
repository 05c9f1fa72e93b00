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

//! Batched row inserts
//!
//! Producers submit rows onto a bounded channel. A drain task gathers them
//! into batches (by size or time, whichever comes first) and hands each batch
//! to the write queue as a single unit:
//!
//! 1. Stamp computed fields on every row
//! 2. Resolve the cached insert plan for the row type
//! 3. Multi-row INSERT per plan-sized chunk in one IMMEDIATE transaction
//! 4. Back-compute ids from the last generated id of each chunk
//! 5. After commit: queue search index jobs, fire completion callbacks
//!
//! Engines without multi-row VALUES, and batches whose plan is unusable, take
//! the row-at-a-time path instead, where each row gets its own SAVEPOINT.
//!
//! When the channel is full a submission becomes a one-row unit on the write
//! queue; rows are never dropped.

pub mod plan;

pub use plan::{rows_per_statement, InsertPlan, PlanCache, PlanColumn};

use crate::search_index::{FtsJob, FtsUpdater};
use crate::stats::PipelineStats;
use crate::write_queue::{WorkUnit, WriteContext, WriterHandle};
use chrono::Utc;
use flowstash_core::{
    BatchRow, FlowstashError, InsertBatchConfig, PendingState, Result, RetryPolicy,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, TransactionBehavior};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Fired exactly once per submitted row, on the writer thread, with the row
/// (id resolved) or the error that failed it. Keep it short.
pub type InsertCompletion<R> = Box<dyn FnOnce(std::result::Result<&R, &FlowstashError>) + Send>;

struct PendingInsert<R> {
    row: R,
    callbacks: Vec<InsertCompletion<R>>,
}

impl<R> PendingInsert<R> {
    fn complete(self, outcome: std::result::Result<(), &FlowstashError>) {
        let PendingInsert { row, callbacks } = self;
        for callback in callbacks {
            let fired = catch_unwind(AssertUnwindSafe(|| callback(outcome.map(|()| &row))));
            if fired.is_err() {
                error!("Insert completion callback panicked");
            }
        }
    }
}

enum InsertMessage<R> {
    Row(PendingInsert<R>),
    Flush(oneshot::Sender<Result<()>>),
}

struct BatchShared {
    fts: Option<FtsUpdater>,
    plans: Arc<PlanCache>,
    stats: Arc<PipelineStats>,
    retry: RetryPolicy,
}

/// Batching writer for one row type.
pub struct BulkInsertWriter<R: BatchRow> {
    tx: mpsc::Sender<InsertMessage<R>>,
    writer: WriterHandle,
    shared: Arc<BatchShared>,
}

impl<R: BatchRow> Clone for BulkInsertWriter<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            writer: self.writer.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<R: BatchRow> BulkInsertWriter<R> {
    /// Start the drain task on `runtime`.
    pub fn new(
        runtime: &Handle,
        writer: WriterHandle,
        fts: Option<FtsUpdater>,
        config: &InsertBatchConfig,
        plans: Arc<PlanCache>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let shared = Arc::new(BatchShared {
            fts,
            plans,
            stats,
            retry: RetryPolicy::exponential().with_max_attempts(config.max_retries.max(1)),
        });

        runtime.spawn(run_drain_loop::<R>(
            rx,
            shared.clone(),
            writer.clone(),
            config.max_batch_rows.max(1),
            config.max_wait(),
        ));

        Self { tx, writer, shared }
    }

    /// Submit a row. Returns once it is queued (or, when the batch channel
    /// is full, once the one-row fallback unit is on the write queue).
    pub async fn submit(&self, row: R, callbacks: Vec<InsertCompletion<R>>) -> Result<()> {
        let stats = &self.shared.stats;
        stats.record_insert(PendingState::Submitted);

        match self.tx.try_send(InsertMessage::Row(PendingInsert { row, callbacks })) {
            Ok(()) => {
                stats.record_insert(PendingState::Queued);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(InsertMessage::Row(pending))) => {
                stats.record_insert(PendingState::FallbackDirect);
                warn!(
                    table = R::table_name(),
                    "Insert channel full, writing row through the shared queue"
                );
                let unit = InsertBatchUnit {
                    rows: vec![pending],
                    shared: self.shared.clone(),
                };
                self.writer.enqueue(Box::new(unit)).await
            }
            Err(mpsc::error::TrySendError::Closed(InsertMessage::Row(pending))) => {
                pending.complete(Err(&FlowstashError::QueueClosed));
                Err(FlowstashError::QueueClosed)
            }
            Err(_) => Err(FlowstashError::QueueClosed),
        }
    }

    /// Submit and wait for the committed row.
    pub async fn insert(&self, row: R) -> Result<R>
    where
        R: Clone,
    {
        let (tx, rx) = oneshot::channel();
        let callback: InsertCompletion<R> = Box::new(move |outcome| {
            let _ = tx.send(
                outcome
                    .map(|row| row.clone())
                    .map_err(|e| e.to_insert_failure()),
            );
        });
        self.submit(row, vec![callback]).await?;
        rx.await.map_err(|_| FlowstashError::QueueClosed)?
    }

    /// Commit the current partial batch and wait for everything submitted
    /// before this call.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(InsertMessage::Flush(done))
            .await
            .map_err(|_| FlowstashError::QueueClosed)?;
        wait.await.map_err(|_| FlowstashError::QueueClosed)?
    }

    /// The cached insert plan for `R`, building it on first use.
    pub async fn plan(&self) -> Result<Arc<InsertPlan>> {
        let plans = self.shared.plans.clone();
        self.writer
            .call("insert_plan", move |ctx| plan_for::<R>(ctx, &plans))
            .await
    }
}

async fn run_drain_loop<R: BatchRow>(
    mut rx: mpsc::Receiver<InsertMessage<R>>,
    shared: Arc<BatchShared>,
    writer: WriterHandle,
    max_batch: usize,
    max_wait: Duration,
) {
    let mut batch: Vec<PendingInsert<R>> = Vec::with_capacity(max_batch);

    loop {
        let mut waiters = Vec::new();
        match rx.recv().await {
            Some(InsertMessage::Row(pending)) => batch.push(pending),
            Some(InsertMessage::Flush(done)) => waiters.push(done),
            None => break,
        }

        let batch_start = Instant::now();
        while waiters.is_empty() && batch.len() < max_batch {
            let remaining = max_wait.saturating_sub(batch_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(InsertMessage::Row(pending))) => batch.push(pending),
                Ok(Some(InsertMessage::Flush(done))) => waiters.push(done),
                Ok(None) | Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let rows = std::mem::replace(&mut batch, Vec::with_capacity(max_batch));
            dispatch(&writer, &shared, rows).await;
        }

        if !waiters.is_empty() {
            let writer = writer.clone();
            tokio::spawn(async move {
                let drained = writer.barrier().await.is_ok();
                for done in waiters {
                    let _ = done.send(if drained {
                        Ok(())
                    } else {
                        Err(FlowstashError::QueueClosed)
                    });
                }
            });
        }
    }

    if !batch.is_empty() {
        dispatch(&writer, &shared, batch).await;
    }
    debug!(table = R::table_name(), "Insert drain loop stopped");
}

async fn dispatch<R: BatchRow>(
    writer: &WriterHandle,
    shared: &Arc<BatchShared>,
    rows: Vec<PendingInsert<R>>,
) {
    let count = rows.len();
    let unit = InsertBatchUnit {
        rows,
        shared: shared.clone(),
    };
    if writer.enqueue(Box::new(unit)).await.is_err() {
        warn!(rows = count, "Write queue closed, insert batch abandoned");
    }
}

struct InsertBatchUnit<R> {
    rows: Vec<PendingInsert<R>>,
    shared: Arc<BatchShared>,
}

impl<R: BatchRow> WorkUnit for InsertBatchUnit<R> {
    fn apply(self: Box<Self>, ctx: &mut WriteContext) {
        let started = Instant::now();
        let InsertBatchUnit { mut rows, shared } = *self;
        let now = Utc::now();
        for pending in rows.iter_mut() {
            pending.row.prepare_insert(now);
        }

        let stats = &shared.stats;
        let on_retry = |attempt: u32, e: &FlowstashError| {
            stats.record_insert(PendingState::Retried);
            warn!(table = R::table_name(), attempt, error = %e, "Insert batch busy, retrying");
        };

        let plan = plan_for::<R>(ctx, &shared.plans);
        let bulk = match &plan {
            Ok(plan) if ctx.dialect().supports_bulk_insert() => Some(
                shared
                    .retry
                    .run_blocking(|| insert_bulk(ctx, plan, &rows), on_retry),
            ),
            _ => None,
        };

        let outcomes: Vec<RowOutcome> = match bulk {
            Some(Ok(ids)) => ids.into_iter().map(Ok).collect(),
            Some(Err(e)) if !e.is_schema_mismatch() => {
                error!(table = R::table_name(), rows = rows.len(), error = %e, "Insert batch failed");
                stats.record_insert_rows_failed(rows.len());
                for pending in rows {
                    pending.complete(Err(&e));
                }
                return;
            }
            other => {
                if let Some(Err(e)) = &other {
                    warn!(table = R::table_name(), error = %e, "Bulk insert unusable, inserting row at a time");
                }
                stats.record_row_at_a_time();
                let plan = plan.as_ref().ok().cloned();
                match shared.retry.run_blocking(
                    || insert_row_at_a_time(ctx, plan.as_deref(), &rows),
                    on_retry,
                ) {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        error!(table = R::table_name(), rows = rows.len(), error = %e, "Insert batch failed");
                        stats.record_insert_rows_failed(rows.len());
                        for pending in rows {
                            pending.complete(Err(&e));
                        }
                        return;
                    }
                }
            }
        };

        let mut committed = 0;
        for (mut pending, outcome) in rows.into_iter().zip(outcomes) {
            match outcome {
                Ok(id) => {
                    pending.row.set_row_id(id);
                    committed += 1;
                    if let Some(fts) = &shared.fts {
                        fts.enqueue(index_job(&pending.row, id));
                    }
                    pending.complete(Ok(()));
                }
                Err(e) => {
                    stats.record_insert_rows_failed(1);
                    pending.complete(Err(&e));
                }
            }
        }

        stats.record_insert_rows_committed(committed);
        stats.record_insert_batch(committed, started.elapsed());
        debug!(
            table = R::table_name(),
            rows = committed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Insert batch committed"
        );
    }

    fn abandon(self: Box<Self>) {
        for pending in self.rows {
            pending.complete(Err(&FlowstashError::QueueClosed));
        }
    }

    fn label(&self) -> &'static str {
        "insert_batch"
    }
}

type RowOutcome = std::result::Result<i64, FlowstashError>;

fn plan_for<R: BatchRow>(ctx: &mut WriteContext, plans: &PlanCache) -> Result<Arc<InsertPlan>> {
    if let Some(plan) = plans.get(R::table_name()) {
        return Ok(plan.clone());
    }
    let limit = ctx.param_limit();
    let dialect = ctx.dialect();
    let plan = Arc::new(InsertPlan::for_row::<R>(dialect.as_ref(), ctx.conn(), limit)?);
    debug!(
        table = R::table_name(),
        columns = plan.columns().len(),
        max_rows = plan.max_rows(),
        "Built insert plan"
    );
    plans.insert(R::table_name().to_string(), plan.clone());
    Ok(plan)
}

/// Index job carrying the row's indexed values inline when they are all
/// known, otherwise an id-only job.
fn index_job<R: BatchRow>(row: &R, id: i64) -> FtsJob {
    let document: Option<Vec<Value>> = R::index_columns()
        .iter()
        .map(|c| R::field_index(c).map(|idx| row.field_value(idx)))
        .collect();
    match document {
        Some(doc) if !doc.is_empty() => FtsJob::inline(id, doc),
        _ => FtsJob::by_id(id),
    }
}

/// One transaction, one multi-row INSERT per chunk. Ids for every row, in
/// submission order.
fn insert_bulk<R: BatchRow>(
    ctx: &mut WriteContext,
    plan: &InsertPlan,
    rows: &[PendingInsert<R>],
) -> Result<Vec<i64>> {
    let dialect = ctx.dialect();
    let tx = ctx
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut ids = Vec::with_capacity(rows.len());

    for chunk in rows.chunks(plan.max_rows()) {
        let values = plan.bind_values(chunk.iter().map(|pending| &pending.row));
        let affected = tx
            .prepare_cached(&plan.statement(chunk.len()))?
            .execute(params_from_iter(values))?;

        let last = dialect.last_insert_id(&tx);
        if last <= 0 || affected != chunk.len() {
            return Err(FlowstashError::SchemaMismatch(format!(
                "{}: chunk of {} rows reported {} affected, last id {}",
                plan.table(),
                chunk.len(),
                affected,
                last
            )));
        }
        let first = last - (chunk.len() as i64 - 1);
        ids.extend(first..=last);
    }

    tx.commit()?;
    Ok(ids)
}

/// Every row in its own SAVEPOINT inside one transaction, so a bad row fails
/// alone. Only a failure of the transaction itself is returned as `Err`.
fn insert_row_at_a_time<R: BatchRow>(
    ctx: &mut WriteContext,
    plan: Option<&InsertPlan>,
    rows: &[PendingInsert<R>],
) -> Result<Vec<RowOutcome>> {
    let dialect = ctx.dialect();
    let columns: Vec<&str> = match plan {
        Some(plan) => plan.column_names(),
        None => R::field_names().to_vec(),
    };
    let mut tx = ctx
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut outcomes = Vec::with_capacity(rows.len());

    for pending in rows {
        let values: Vec<Value> = match plan {
            Some(plan) => plan.row_values(&pending.row),
            None => (0..columns.len())
                .map(|idx| pending.row.field_value(idx))
                .collect(),
        };
        let sp = tx.savepoint()?;
        let outcome = match dialect.insert_row(&sp, R::table_name(), &columns, values) {
            Ok((_, id)) if id > 0 => sp.commit().map(|()| id).map_err(FlowstashError::from),
            Ok((_, id)) => Err(FlowstashError::SchemaMismatch(format!(
                "{}: non-positive id {} after insert",
                R::table_name(),
                id
            ))),
            Err(e) => Err(e),
        };
        match outcome {
            // the whole batch is retried
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                debug!(table = R::table_name(), error = %e, "Row rejected");
                outcomes.push(Err(e));
            }
            Ok(id) => outcomes.push(Ok(id)),
        }
    }

    tx.commit()?;
    Ok(outcomes)
}
