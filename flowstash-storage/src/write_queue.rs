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

//! Bounded work queue in front of the single SQLite writer.
//!
//! ```text
//! producers ──► mpsc (bounded) ──► "flowstash-writer" thread ──► Connection
//!                   │
//!                   └── Barrier(oneshot): replied once everything before it ran
//! ```
//!
//! The writer thread owns the only write connection. Work units run strictly
//! in FIFO order; a panicking unit is caught, logged and any open transaction
//! rolled back before the next unit runs.

use crate::dialect::SqlDialect;
use crate::stats::PipelineStats;
use flowstash_core::{FlowstashError, Result};
use rusqlite::Connection;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Everything a unit of work may touch on the writer thread.
pub struct WriteContext {
    conn: Connection,
    dialect: Arc<dyn SqlDialect>,
    param_limit_override: Option<usize>,
    param_limit: Option<usize>,
}

impl WriteContext {
    pub fn new(
        conn: Connection,
        dialect: Arc<dyn SqlDialect>,
        param_limit_override: Option<usize>,
    ) -> Self {
        Self {
            conn,
            dialect,
            param_limit_override,
            param_limit: None,
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn dialect(&self) -> Arc<dyn SqlDialect> {
        self.dialect.clone()
    }

    /// Bind-parameter ceiling, asked of the engine once and then cached.
    pub fn param_limit(&mut self) -> usize {
        if let Some(limit) = self.param_limit_override {
            return limit.max(1);
        }
        if let Some(limit) = self.param_limit {
            return limit;
        }
        let limit = match self.dialect.param_limit(&self.conn) {
            Ok(limit) => limit.max(1),
            Err(e) => {
                warn!(error = %e, "Failed to read parameter limit, using default");
                flowstash_core::DEFAULT_PARAM_LIMIT
            }
        };
        debug!(param_limit = limit, dialect = self.dialect.name(), "Resolved parameter limit");
        self.param_limit = Some(limit);
        limit
    }

    /// Roll back a transaction a failed unit left open.
    fn reset(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                error!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

/// A deferred write, executed on the writer thread.
pub trait WorkUnit: Send + 'static {
    fn apply(self: Box<Self>, ctx: &mut WriteContext);

    /// Called instead of `apply` when the queue is closed before the unit
    /// could be accepted.
    fn abandon(self: Box<Self>);

    fn label(&self) -> &'static str {
        "work"
    }
}

/// Closure unit whose result goes back through a oneshot.
struct CallUnit<F, T> {
    label: &'static str,
    f: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<F, T> WorkUnit for CallUnit<F, T>
where
    F: FnOnce(&mut WriteContext) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    fn apply(self: Box<Self>, ctx: &mut WriteContext) {
        let this = *self;
        let result = (this.f)(ctx);
        let _ = this.reply.send(result);
    }

    fn abandon(self: Box<Self>) {
        let _ = self.reply.send(Err(FlowstashError::QueueClosed));
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

enum QueueMessage {
    Work(Box<dyn WorkUnit>),
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable sender side of the write queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<QueueMessage>,
    dialect: Arc<dyn SqlDialect>,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("dialect", &self.dialect.name())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl WriterHandle {
    pub fn dialect(&self) -> Arc<dyn SqlDialect> {
        self.dialect.clone()
    }

    /// Run `f` on the writer thread and wait for its result.
    pub async fn call<T, F>(&self, label: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Box::new(CallUnit { label, f, reply })).await?;
        rx.await.map_err(|_| {
            FlowstashError::WorkerPanic(format!("{} unit dropped without a reply", label))
        })?
    }

    /// Enqueue a unit, waiting for capacity.
    pub async fn enqueue(&self, unit: Box<dyn WorkUnit>) -> Result<()> {
        match self.tx.send(QueueMessage::Work(unit)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                if let QueueMessage::Work(unit) = msg {
                    unit.abandon();
                }
                Err(FlowstashError::QueueClosed)
            }
        }
    }

    /// Wait until every unit enqueued before this call has run.
    pub async fn barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Barrier(tx))
            .await
            .map_err(|_| FlowstashError::QueueClosed)?;
        rx.await.map_err(|_| FlowstashError::QueueClosed)
    }

    /// Units currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of the writer thread.
pub struct WriteQueue {
    handle: WriterHandle,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Start the writer thread. `conn` becomes its exclusive property.
    pub fn spawn(
        conn: Connection,
        dialect: Arc<dyn SqlDialect>,
        capacity: usize,
        param_limit_override: Option<usize>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let ctx = WriteContext::new(conn, dialect.clone(), param_limit_override);

        let thread = std::thread::Builder::new()
            .name("flowstash-writer".to_string())
            .spawn(move || run_writer(rx, ctx, stats))?;

        Ok(Self {
            handle: WriterHandle { tx, dialect },
            thread: parking_lot::Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Drain everything queued so far, close the queue and join the thread.
    /// Units enqueued after this point are abandoned with `QueueClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        let thread = self.thread.lock().take();
        let Some(thread) = thread else {
            return Ok(());
        };

        let (tx, rx) = oneshot::channel();
        if self.handle.tx.send(QueueMessage::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| FlowstashError::Runtime(e.to_string()))?
            .map_err(|_| FlowstashError::WorkerPanic("writer thread panicked".into()))
    }
}

fn run_writer(
    mut rx: mpsc::Receiver<QueueMessage>,
    mut ctx: WriteContext,
    stats: Arc<PipelineStats>,
) {
    debug!(dialect = ctx.dialect.name(), "Writer thread started");
    let mut shutdown_reply = None;

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            QueueMessage::Work(unit) => {
                let label = unit.label();
                let outcome = catch_unwind(AssertUnwindSafe(|| unit.apply(&mut ctx)));
                match outcome {
                    Ok(()) => stats.record_unit_applied(),
                    Err(panic) => {
                        stats.record_unit_panic();
                        error!(unit = label, panic = %panic_message(&*panic), "Work unit panicked");
                    }
                }
                ctx.reset();
            }
            QueueMessage::Barrier(done) => {
                let _ = done.send(());
            }
            QueueMessage::Shutdown(done) => {
                // Stop accepting; whatever is already buffered still runs.
                rx.close();
                shutdown_reply = Some(done);
            }
        }
    }

    drop(ctx);
    debug!("Writer thread stopped");
    if let Some(done) = shutdown_reply {
        let _ = done.send(());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
