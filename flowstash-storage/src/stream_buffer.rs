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

//! Stream coalescing buffer
//!
//! Fragments of one stream are concatenated into a single `stream_events` row.
//! The first fragment creates the row synchronously so it is durable at once;
//! later fragments accumulate in memory and reach the store as one
//! `content = content || ?` update per flush.
//!
//! ## Flush triggers
//!
//! - quiet for `flush_interval`, or unflushed for `max_flush_delay` (ticker)
//! - pending bytes above `max_pending_bytes` (inline, on append)
//! - `flush_all` / `finish` (explicit)
//!
//! A flush that fails puts its bytes back in front of whatever arrived
//! meanwhile, so fragment order never changes.

use crate::stats::PipelineStats;
use crate::write_queue::{WriteContext, WriterHandle};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use flowstash_core::event::STREAM_EVENTS_TABLE;
use flowstash_core::{
    FlowstashError, FlushMode, PendingState, Result, StreamBufferConfig, StreamEvent,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::OptionalExtension;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const STREAM_COLUMNS: &[&str] = &["stream_id", "event_type", "content", "created_at", "updated_at"];

struct EntryState {
    pending: Vec<u8>,
    last_write: Instant,
    last_flush: Instant,
    /// Set under this lock when the entry leaves the map; appenders that see
    /// it retry against a fresh entry.
    evicted: bool,
}

struct StreamEntry {
    stream_id: String,
    event_type: String,
    handle: parking_lot::Mutex<WriterHandle>,
    state: parking_lot::Mutex<EntryState>,
    ensured: OnceCell<std::result::Result<(), String>>,
    /// The base row could not be created on a busy store; the next flush
    /// creates it from the buffered bytes.
    row_deferred: AtomicBool,
    /// Held from snapshot to re-prepend, so flushes of one stream never overlap.
    flush_lock: tokio::sync::Mutex<()>,
}

impl StreamEntry {
    fn new(event: &StreamEvent, handle: &WriterHandle) -> Self {
        let now = Instant::now();
        Self {
            stream_id: event.stream_id.clone(),
            event_type: event.event_type.clone(),
            handle: parking_lot::Mutex::new(handle.clone()),
            state: parking_lot::Mutex::new(EntryState {
                pending: Vec::new(),
                last_write: now,
                last_flush: now,
                evicted: false,
            }),
            ensured: OnceCell::new(),
            row_deferred: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }
}

struct Inner {
    config: StreamBufferConfig,
    entries: DashMap<String, Arc<StreamEntry>>,
    loop_running: AtomicBool,
    stats: Arc<PipelineStats>,
    runtime: Handle,
}

/// Per-stream write coalescer. Cheap to clone.
#[derive(Clone)]
pub struct StreamBuffer {
    inner: Arc<Inner>,
}

enum SweepAction {
    Skip,
    Flush,
    Evict,
}

impl StreamBuffer {
    pub fn new(config: StreamBufferConfig, stats: Arc<PipelineStats>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: DashMap::new(),
                loop_running: AtomicBool::new(false),
                stats,
                runtime,
            }),
        }
    }

    /// Append one fragment.
    ///
    /// Returns once the fragment is either durable (first fragment of a
    /// stream, or the direct path) or buffered. Once a fragment is buffered
    /// this returns Ok; a failed inline flush keeps the bytes and the error
    /// surfaces from `flush_all` or `finish`.
    pub async fn append(&self, handle: &WriterHandle, event: StreamEvent) -> Result<()> {
        if event.delta.is_empty() {
            if event.finished && !event.stream_id.is_empty() {
                return self.finish(&event.stream_id).await;
            }
            return Ok(());
        }
        self.inner.stats.record_stream_append();

        if !self.inner.config.enabled || event.stream_id.is_empty() {
            self.inner.stats.record_direct_append();
            return direct_append(handle, event).await;
        }

        loop {
            let entry = self.entry_for(&event, handle);
            *entry.handle.lock() = handle.clone();

            if self.ensure_base_row(&entry, &event).await? {
                // written with the row, or buffered ahead of it
                break;
            }

            let over_limit = {
                let mut state = entry.state.lock();
                if state.evicted {
                    None
                } else {
                    state.pending.extend_from_slice(&event.delta);
                    state.last_write = Instant::now();
                    Some(state.pending.len() >= self.inner.config.max_pending_bytes)
                }
            };

            match over_limit {
                None => continue,
                Some(true) => {
                    debug!(stream_id = %event.stream_id, "Pending bytes over limit, flushing inline");
                    if let Err(e) = self.flush_entry(&entry, FlushMode::BestEffort).await {
                        warn!(stream_id = %event.stream_id, error = %e, "Inline flush failed, bytes kept");
                    }
                    break;
                }
                Some(false) => break,
            }
        }

        if event.finished {
            self.finish(&event.stream_id).await?;
        }
        Ok(())
    }

    fn entry_for(&self, event: &StreamEvent, handle: &WriterHandle) -> Arc<StreamEntry> {
        let entry = self
            .inner
            .entries
            .entry(event.stream_id.clone())
            .or_insert_with(|| Arc::new(StreamEntry::new(event, handle)))
            .clone();
        self.ensure_loop();
        entry
    }

    /// Runs the base-row check once per entry. True when the caller's
    /// fragment is already taken care of: written with the new row, or
    /// buffered because the store was busy.
    async fn ensure_base_row(&self, entry: &Arc<StreamEntry>, event: &StreamEvent) -> Result<bool> {
        let claimed = AtomicBool::new(false);
        let outcome = entry
            .ensured
            .get_or_init(|| async {
                let handle = entry.handle.lock().clone();
                let stream_id = entry.stream_id.clone();
                let event_type = entry.event_type.clone();
                let first = event.delta.clone();
                let result = handle
                    .call("ensure_base_row", move |ctx| {
                        ensure_row(ctx, &stream_id, &event_type, &first)
                    })
                    .await;
                match result {
                    Ok(created) => {
                        if created {
                            self.inner.stats.record_base_row_created();
                        }
                        claimed.store(created, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) if e.is_transient() => {
                        let mut state = entry.state.lock();
                        if !state.evicted {
                            state.pending.extend_from_slice(&event.delta);
                            state.last_write = Instant::now();
                            entry.row_deferred.store(true, Ordering::Release);
                            claimed.store(true, Ordering::Relaxed);
                        }
                        drop(state);
                        self.inner
                            .stats
                            .record_stream_flush_failure(PendingState::Retried);
                        debug!(stream_id = %entry.stream_id, error = %e, "Store busy, base row left to the next flush");
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(claimed.load(Ordering::Relaxed)),
            Err(reason) => {
                // drop the poisoned entry so a later append gets a fresh attempt
                self.remove_entry(&entry.stream_id, entry, None);
                Err(FlowstashError::BaseRow {
                    stream_id: entry.stream_id.clone(),
                    reason: reason.clone(),
                })
            }
        }
    }

    /// Write the entry's pending bytes.
    ///
    /// On failure the bytes go back in front of the buffer. In best-effort
    /// mode a busy/locked store is not an error.
    async fn flush_entry(&self, entry: &Arc<StreamEntry>, mode: FlushMode) -> Result<()> {
        let _flushing = entry.flush_lock.lock().await;

        let snapshot = {
            let mut state = entry.state.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut state.pending)
        };

        let handle = entry.handle.lock().clone();
        let stream_id = entry.stream_id.clone();
        let event_type = entry.event_type.clone();
        let bytes = snapshot.clone();
        let result = handle
            .call("stream_flush", move |ctx| {
                append_to_row(ctx, &stream_id, &event_type, &bytes)
            })
            .await;

        match result {
            Ok(recreated) => {
                entry.state.lock().last_flush = Instant::now();
                self.inner.stats.record_stream_flush(snapshot.len());
                let deferred_row = entry.row_deferred.swap(false, Ordering::AcqRel);
                if recreated && deferred_row {
                    self.inner.stats.record_base_row_created();
                    debug!(stream_id = %entry.stream_id, "Base row created by flush");
                } else if recreated {
                    self.inner.stats.record_row_recreated();
                    warn!(stream_id = %entry.stream_id, "Stream row vanished, recreated from buffer");
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = entry.state.lock();
                    let mut restored = snapshot;
                    restored.extend_from_slice(&state.pending);
                    state.pending = restored;
                }
                if mode.is_best_effort() && e.is_transient() {
                    self.inner
                        .stats
                        .record_stream_flush_failure(PendingState::Retried);
                    debug!(stream_id = %entry.stream_id, error = %e, "Store busy, flush deferred to next tick");
                    Ok(())
                } else {
                    self.inner
                        .stats
                        .record_stream_flush_failure(PendingState::DroppedWithLog);
                    Err(e)
                }
            }
        }
    }

    /// One sweep: evict idle empty entries, flush the ones that are due.
    pub async fn flush_due(&self) {
        let cfg = &self.inner.config;
        let entries: Vec<(String, Arc<StreamEntry>)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (stream_id, entry) in entries {
            let action = {
                let state = entry.state.lock();
                let now = Instant::now();
                if state.pending.is_empty() {
                    if now.duration_since(state.last_write) >= cfg.idle_ttl() {
                        SweepAction::Evict
                    } else {
                        SweepAction::Skip
                    }
                } else if now.duration_since(state.last_write) >= cfg.flush_interval()
                    || now.duration_since(state.last_flush) >= cfg.max_flush_delay()
                {
                    SweepAction::Flush
                } else {
                    SweepAction::Skip
                }
            };

            match action {
                SweepAction::Skip => {}
                SweepAction::Evict => {
                    self.remove_entry(&stream_id, &entry, Some(cfg.idle_ttl()));
                }
                SweepAction::Flush => {
                    if let Err(e) = self.flush_entry(&entry, FlushMode::BestEffort).await {
                        warn!(stream_id = %stream_id, error = %e, "Stream flush failed, keeping data");
                    }
                }
            }
        }
    }

    /// Strictly flush every entry. Keeps going past failures and returns the
    /// first one.
    pub async fn flush_all(&self) -> Result<()> {
        let entries: Vec<Arc<StreamEntry>> = self
            .inner
            .entries
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut first_error = None;
        for entry in entries {
            if let Err(e) = self.flush_entry(&entry, FlushMode::Strict).await {
                warn!(stream_id = %entry.stream_id, error = %e, "Stream flush failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush a stream and release its entry. Unknown ids are a no-op.
    ///
    /// A locked store gets exactly one more best-effort attempt; if that also
    /// hits the lock the bytes stay buffered for the ticker.
    pub async fn finish(&self, stream_id: &str) -> Result<()> {
        let Some(entry) = self.inner.entries.get(stream_id).map(|e| e.value().clone()) else {
            return Ok(());
        };

        match self.flush_entry(&entry, FlushMode::Strict).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                debug!(stream_id, error = %e, "Finish hit a locked store, retrying once");
                self.flush_entry(&entry, FlushMode::BestEffort).await?;
            }
            Err(e) => return Err(e),
        }

        self.remove_entry(stream_id, &entry, Some(Duration::ZERO));
        Ok(())
    }

    /// Remove `entry` if it is still the mapped one and, when `min_idle` is
    /// given, empty, idle that long and not mid-flush.
    fn remove_entry(&self, stream_id: &str, entry: &Arc<StreamEntry>, min_idle: Option<Duration>) {
        let removed = self.inner.entries.remove_if(stream_id, |_, current| {
            if !Arc::ptr_eq(current, entry) {
                return false;
            }
            let Ok(_flushing) = current.flush_lock.try_lock() else {
                return false;
            };
            let mut state = current.state.lock();
            let evictable = match min_idle {
                Some(idle) => {
                    state.pending.is_empty() && state.last_write.elapsed() >= idle
                }
                None => true,
            };
            if evictable {
                state.evicted = true;
            }
            evictable
        });
        if removed.is_some() {
            self.inner.stats.record_eviction();
            debug!(stream_id, "Stream entry released");
        }
    }

    fn ensure_loop(&self) {
        if self
            .inner
            .loop_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("Starting stream flush loop");
            let weak = Arc::downgrade(&self.inner);
            self.inner.runtime.spawn(run_flush_loop(weak));
        }
    }

    pub fn is_loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::Acquire)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Bytes buffered for `stream_id`, if it has an entry.
    pub fn pending_bytes(&self, stream_id: &str) -> Option<usize> {
        self.inner
            .entries
            .get(stream_id)
            .map(|e| e.value().state.lock().pending.len())
    }
}

async fn run_flush_loop(weak: Weak<Inner>) {
    let tick = match weak.upgrade() {
        Some(inner) => inner.config.tick(),
        None => return,
    };
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let buffer = StreamBuffer { inner };
        buffer.flush_due().await;

        let inner = &buffer.inner;
        if inner.entries.is_empty() {
            inner.loop_running.store(false, Ordering::SeqCst);
            // An append may have slipped in after the check. Reclaim the flag
            // unless that append already started a new loop.
            if inner.entries.is_empty() || inner.loop_running.swap(true, Ordering::SeqCst) {
                debug!("Stream flush loop idle, stopping");
                return;
            }
        }
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Bytes of a TEXT or BLOB cell. `||` turns blobs into text.
pub fn payload_bytes(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Text(t) => Some(t.to_vec()),
        ValueRef::Blob(b) => Some(b.to_vec()),
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string().into_bytes()),
        ValueRef::Real(f) => Some(f.to_string().into_bytes()),
    }
}

fn ensure_row(ctx: &mut WriteContext, stream_id: &str, event_type: &str, first: &[u8]) -> Result<bool> {
    let dialect = ctx.dialect();
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = ? LIMIT 1",
        dialect.quote_ident(STREAM_EVENTS_TABLE),
        dialect.quote_ident("stream_id")
    );
    if ctx.conn().prepare_cached(&sql)?.exists([stream_id])? {
        return Ok(false);
    }
    insert_stream_row(ctx, Some(stream_id), event_type, first)?;
    Ok(true)
}

fn insert_stream_row(
    ctx: &mut WriteContext,
    stream_id: Option<&str>,
    event_type: &str,
    content: &[u8],
) -> Result<i64> {
    let now = now_text();
    let values = vec![
        stream_id.map_or(Value::Null, |s| Value::Text(s.to_string())),
        Value::Text(event_type.to_string()),
        Value::Blob(content.to_vec()),
        Value::Text(now.clone()),
        Value::Text(now),
    ];
    let (_, id) = ctx
        .dialect()
        .insert_row(ctx.conn(), STREAM_EVENTS_TABLE, STREAM_COLUMNS, values)?;
    Ok(id)
}

/// Append to the persisted payload. True if the row was missing and had to
/// be recreated from `bytes`.
fn append_to_row(ctx: &mut WriteContext, stream_id: &str, event_type: &str, bytes: &[u8]) -> Result<bool> {
    let dialect = ctx.dialect();
    let affected = match dialect.append_expression("content") {
        Some(expr) => {
            let sql = format!(
                "UPDATE {} SET {} = {}, {} = ? WHERE {} = ?",
                dialect.quote_ident(STREAM_EVENTS_TABLE),
                dialect.quote_ident("content"),
                expr,
                dialect.quote_ident("updated_at"),
                dialect.quote_ident("stream_id"),
            );
            ctx.conn()
                .prepare_cached(&sql)?
                .execute(rusqlite::params![bytes, now_text(), stream_id])?
        }
        None => read_modify_write(ctx, stream_id, bytes)?,
    };

    if affected == 0 {
        insert_stream_row(ctx, Some(stream_id), event_type, bytes)?;
        return Ok(true);
    }
    Ok(false)
}

/// Append without an in-place expression: read, concatenate, write back.
fn read_modify_write(ctx: &mut WriteContext, stream_id: &str, bytes: &[u8]) -> Result<usize> {
    let dialect = ctx.dialect();
    let table = dialect.quote_ident(STREAM_EVENTS_TABLE);
    let tx = ctx.conn_mut().transaction()?;
    let current = tx
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?",
                dialect.quote_ident("content"),
                table,
                dialect.quote_ident("stream_id")
            ),
            [stream_id],
            |row| Ok(payload_bytes(row.get_ref(0)?)),
        )
        .optional()?;
    let Some(current) = current else {
        return Ok(0);
    };
    let mut content = current.unwrap_or_default();
    content.extend_from_slice(bytes);
    let affected = tx.execute(
        &format!(
            "UPDATE {} SET {} = ?, {} = ? WHERE {} = ?",
            table,
            dialect.quote_ident("content"),
            dialect.quote_ident("updated_at"),
            dialect.quote_ident("stream_id")
        ),
        rusqlite::params![content, now_text(), stream_id],
    )?;
    tx.commit()?;
    Ok(affected)
}

/// Unbuffered path: read-modify-write for keyed streams, a fresh keyless
/// row for an empty id.
async fn direct_append(handle: &WriterHandle, event: StreamEvent) -> Result<()> {
    handle
        .call("stream_direct_append", move |ctx| {
            if event.stream_id.is_empty() {
                insert_stream_row(ctx, None, &event.event_type, &event.delta)?;
                return Ok(());
            }
            if read_modify_write(ctx, &event.stream_id, &event.delta)? == 0 {
                insert_stream_row(ctx, Some(&event.stream_id), &event.event_type, &event.delta)?;
            }
            Ok(())
        })
        .await
}

/// Current persisted payload of a stream.
pub fn read_stream_content(ctx: &WriteContext, stream_id: &str) -> Result<Option<Vec<u8>>> {
    let dialect = ctx.dialect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        dialect.quote_ident("content"),
        dialect.quote_ident(STREAM_EVENTS_TABLE),
        dialect.quote_ident("stream_id")
    );
    let content = ctx
        .conn()
        .query_row(&sql, [stream_id], |row| Ok(payload_bytes(row.get_ref(0)?)))
        .optional()?;
    Ok(content.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::EmbeddedDialect;
    use crate::schema;
    use crate::write_queue::WriteQueue;
    use flowstash_core::EngineConfig;
    use rusqlite::Connection;

    struct Fixture {
        _queue: WriteQueue,
        writer: WriterHandle,
        buffer: StreamBuffer,
        stats: Arc<PipelineStats>,
    }

    fn fixture(config: StreamBufferConfig) -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        schema::ensure_schema(&conn).unwrap();
        let stats = Arc::new(PipelineStats::new());
        let queue =
            WriteQueue::spawn(conn, Arc::new(EmbeddedDialect), 256, None, stats.clone()).unwrap();
        let writer = queue.handle();
        let buffer = StreamBuffer::new(config, stats.clone(), Handle::current());
        Fixture {
            _queue: queue,
            writer,
            buffer,
            stats,
        }
    }

    async fn content(writer: &WriterHandle, id: &str) -> Option<Vec<u8>> {
        let id = id.to_string();
        writer
            .call("read", move |ctx| read_stream_content(ctx, &id))
            .await
            .unwrap()
    }

    fn slow_config() -> StreamBufferConfig {
        StreamBufferConfig {
            flush_interval_ms: 60_000,
            max_flush_delay_ms: 60_000,
            idle_ttl_ms: 60_000,
            ..StreamBufferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_fragment_is_durable_immediately() {
        let f = fixture(slow_config());
        f.buffer
            .append(&f.writer, StreamEvent::new("s1", "hello"))
            .await
            .unwrap();
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"hello");
        assert_eq!(f.buffer.pending_bytes("s1"), Some(0));
        assert_eq!(f.stats.snapshot().stream_base_rows_created, 1);
    }

    #[tokio::test]
    async fn test_later_fragments_buffer_until_flush() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("s1", "a")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "b")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "c")).await.unwrap();

        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"a");
        assert_eq!(f.buffer.pending_bytes("s1"), Some(2));

        f.buffer.flush_all().await.unwrap();
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"abc");
        assert_eq!(f.stats.snapshot().stream_flushes, 1);
    }

    #[tokio::test]
    async fn test_empty_fragment_is_noop() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("s1", "")).await.unwrap();
        assert_eq!(f.buffer.entry_count(), 0);
        assert!(content(&f.writer, "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_pending_limit_flushes_inline() {
        let f = fixture(StreamBufferConfig {
            max_pending_bytes: 4,
            ..slow_config()
        });
        f.buffer.append(&f.writer, StreamEvent::new("s1", "x")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "yy")).await.unwrap();
        assert_eq!(f.buffer.pending_bytes("s1"), Some(2));
        f.buffer.append(&f.writer, StreamEvent::new("s1", "zz")).await.unwrap();
        assert_eq!(f.buffer.pending_bytes("s1"), Some(0));
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"xyyzz");
    }

    #[tokio::test]
    async fn test_disabled_buffer_writes_through() {
        let f = fixture(StreamBufferConfig {
            enabled: false,
            ..slow_config()
        });
        f.buffer.append(&f.writer, StreamEvent::new("s1", "ab")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "cd")).await.unwrap();
        assert_eq!(f.buffer.entry_count(), 0);
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"abcd");
        assert!(!f.buffer.is_loop_running());
    }

    #[tokio::test]
    async fn test_empty_id_creates_keyless_rows() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("", "one")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("", "two")).await.unwrap();
        let rows: i64 = f
            .writer
            .call("count", |ctx| {
                Ok(ctx.conn().query_row(
                    "SELECT COUNT(*) FROM stream_events WHERE stream_id IS NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_vanished_row_is_recreated() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("s1", "ab")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "cd")).await.unwrap();
        f.writer
            .call("delete", |ctx| {
                ctx.conn().execute("DELETE FROM stream_events", [])?;
                Ok(())
            })
            .await
            .unwrap();

        f.buffer.flush_all().await.unwrap();
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"cd");
        assert_eq!(f.stats.snapshot().stream_rows_recreated, 1);
    }

    #[tokio::test]
    async fn test_finish_flushes_and_releases() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("s1", "ab")).await.unwrap();
        f.buffer
            .append(&f.writer, StreamEvent::new("s1", "cd").finished())
            .await
            .unwrap();
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"abcd");
        assert_eq!(f.buffer.entry_count(), 0);

        // unknown id
        f.buffer.finish("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_all_reports_first_error_and_keeps_data() {
        let f = fixture(slow_config());
        f.buffer.append(&f.writer, StreamEvent::new("s1", "ab")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "cd")).await.unwrap();
        f.writer
            .call("break", |ctx| {
                ctx.conn().execute_batch("ALTER TABLE stream_events RENAME TO gone")?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(f.buffer.flush_all().await.is_err());
        assert_eq!(f.buffer.pending_bytes("s1"), Some(2));

        f.writer
            .call("fix", |ctx| {
                ctx.conn().execute_batch("ALTER TABLE gone RENAME TO stream_events")?;
                Ok(())
            })
            .await
            .unwrap();
        f.buffer.flush_all().await.unwrap();
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_failed_inline_flush_keeps_fragment_accepted() {
        let f = fixture(StreamBufferConfig {
            max_pending_bytes: 2,
            ..slow_config()
        });
        f.buffer.append(&f.writer, StreamEvent::new("s", "a")).await.unwrap();
        f.writer
            .call("break", |ctx| {
                ctx.conn().execute_batch("ALTER TABLE stream_events RENAME TO gone")?;
                Ok(())
            })
            .await
            .unwrap();

        // accepted: a retry by the caller would duplicate the bytes
        f.buffer.append(&f.writer, StreamEvent::new("s", "bc")).await.unwrap();
        assert_eq!(f.buffer.pending_bytes("s"), Some(2));
        assert_eq!(f.stats.snapshot().stream_flush_errors, 1);

        f.writer
            .call("fix", |ctx| {
                ctx.conn().execute_batch("ALTER TABLE gone RENAME TO stream_events")?;
                Ok(())
            })
            .await
            .unwrap();
        f.buffer.flush_all().await.unwrap();
        assert_eq!(content(&f.writer, "s").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_ticker_flushes_and_evicts() {
        let mut config = EngineConfig::fast().stream;
        config.idle_ttl_ms = 50;
        let f = fixture(config);
        f.buffer.append(&f.writer, StreamEvent::new("s1", "ab")).await.unwrap();
        f.buffer.append(&f.writer, StreamEvent::new("s1", "cd")).await.unwrap();
        assert!(f.buffer.is_loop_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while (f.buffer.entry_count() > 0 || f.buffer.is_loop_running()) && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.buffer.entry_count(), 0);
        assert!(!f.buffer.is_loop_running());
        assert_eq!(content(&f.writer, "s1").await.unwrap(), b"abcd");
    }
}
