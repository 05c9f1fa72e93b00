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

//! Pipeline counters
//!
//! Every backpressure transition lands in one of these atomics. Callers read
//! them through [`PipelineStats::snapshot`].

use flowstash_core::PendingState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub uptime_ms: u64,

    pub queue_units_applied: u64,
    pub queue_unit_panics: u64,

    pub stream_appends: u64,
    pub stream_base_rows_created: u64,
    pub stream_direct_appends: u64,
    pub stream_flushes: u64,
    pub stream_bytes_flushed: u64,
    pub stream_flush_retried: u64,
    pub stream_flush_errors: u64,
    pub stream_rows_recreated: u64,
    pub stream_evictions: u64,

    pub insert_submitted: u64,
    pub insert_queued: u64,
    pub insert_fallback_direct: u64,
    pub insert_rows_committed: u64,
    pub insert_rows_failed: u64,
    pub insert_batches: u64,
    pub insert_batch_retries: u64,
    pub insert_row_at_a_time: u64,
    pub avg_insert_batch_size: f64,
    pub avg_insert_batch_latency_ms: f64,

    pub index_submitted: u64,
    pub index_queued: u64,
    pub index_deferred: u64,
    pub index_dropped: u64,
    pub index_rows_applied: u64,
    pub index_batches: u64,
    pub index_batch_failures: u64,
    pub index_slow_batches: u64,
}

/// Shared atomic counters.
#[derive(Debug)]
pub struct PipelineStats {
    start_time: Instant,

    units_applied: AtomicU64,
    unit_panics: AtomicU64,

    stream_appends: AtomicU64,
    stream_base_rows_created: AtomicU64,
    stream_direct_appends: AtomicU64,
    stream_flushes: AtomicU64,
    stream_bytes_flushed: AtomicU64,
    stream_flush_retried: AtomicU64,
    stream_flush_errors: AtomicU64,
    stream_rows_recreated: AtomicU64,
    stream_evictions: AtomicU64,

    insert_submitted: AtomicU64,
    insert_queued: AtomicU64,
    insert_fallback_direct: AtomicU64,
    insert_rows_committed: AtomicU64,
    insert_rows_failed: AtomicU64,
    insert_batches: AtomicU64,
    insert_batch_retries: AtomicU64,
    insert_row_at_a_time: AtomicU64,
    insert_total_batch_size: AtomicU64,
    insert_total_latency_ns: AtomicU64,

    index_submitted: AtomicU64,
    index_queued: AtomicU64,
    index_deferred: AtomicU64,
    index_dropped: AtomicU64,
    index_rows_applied: AtomicU64,
    index_batches: AtomicU64,
    index_batch_failures: AtomicU64,
    index_slow_batches: AtomicU64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            units_applied: AtomicU64::new(0),
            unit_panics: AtomicU64::new(0),
            stream_appends: AtomicU64::new(0),
            stream_base_rows_created: AtomicU64::new(0),
            stream_direct_appends: AtomicU64::new(0),
            stream_flushes: AtomicU64::new(0),
            stream_bytes_flushed: AtomicU64::new(0),
            stream_flush_retried: AtomicU64::new(0),
            stream_flush_errors: AtomicU64::new(0),
            stream_rows_recreated: AtomicU64::new(0),
            stream_evictions: AtomicU64::new(0),
            insert_submitted: AtomicU64::new(0),
            insert_queued: AtomicU64::new(0),
            insert_fallback_direct: AtomicU64::new(0),
            insert_rows_committed: AtomicU64::new(0),
            insert_rows_failed: AtomicU64::new(0),
            insert_batches: AtomicU64::new(0),
            insert_batch_retries: AtomicU64::new(0),
            insert_row_at_a_time: AtomicU64::new(0),
            insert_total_batch_size: AtomicU64::new(0),
            insert_total_latency_ns: AtomicU64::new(0),
            index_submitted: AtomicU64::new(0),
            index_queued: AtomicU64::new(0),
            index_deferred: AtomicU64::new(0),
            index_dropped: AtomicU64::new(0),
            index_rows_applied: AtomicU64::new(0),
            index_batches: AtomicU64::new(0),
            index_batch_failures: AtomicU64::new(0),
            index_slow_batches: AtomicU64::new(0),
        }
    }

    // Write queue

    pub fn record_unit_applied(&self) {
        bump(&self.units_applied);
    }

    pub fn record_unit_panic(&self) {
        bump(&self.unit_panics);
    }

    // Stream buffer

    pub fn record_stream_append(&self) {
        bump(&self.stream_appends);
    }

    pub fn record_base_row_created(&self) {
        bump(&self.stream_base_rows_created);
    }

    pub fn record_direct_append(&self) {
        bump(&self.stream_direct_appends);
    }

    pub fn record_stream_flush(&self, bytes: usize) {
        bump(&self.stream_flushes);
        self.stream_bytes_flushed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_stream_flush_failure(&self, state: PendingState) {
        match state {
            PendingState::Retried => bump(&self.stream_flush_retried),
            _ => bump(&self.stream_flush_errors),
        }
    }

    pub fn record_row_recreated(&self) {
        bump(&self.stream_rows_recreated);
    }

    pub fn record_eviction(&self) {
        bump(&self.stream_evictions);
    }

    // Bulk insert

    /// Count an insert submission reaching `state`.
    pub fn record_insert(&self, state: PendingState) {
        match state {
            PendingState::Submitted => bump(&self.insert_submitted),
            PendingState::Queued => bump(&self.insert_queued),
            PendingState::FallbackDirect => bump(&self.insert_fallback_direct),
            PendingState::Applied => bump(&self.insert_rows_committed),
            PendingState::Retried => bump(&self.insert_batch_retries),
            PendingState::Deferred | PendingState::DroppedWithLog => {
                // inserts are never deferred or dropped
                debug_assert!(false, "invalid insert state {:?}", state);
            }
        }
    }

    pub fn record_insert_batch(&self, rows: usize, elapsed: Duration) {
        bump(&self.insert_batches);
        self.insert_total_batch_size
            .fetch_add(rows as u64, Ordering::Relaxed);
        self.insert_total_latency_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_insert_rows_committed(&self, rows: usize) {
        self.insert_rows_committed
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_insert_rows_failed(&self, rows: usize) {
        self.insert_rows_failed
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_row_at_a_time(&self) {
        bump(&self.insert_row_at_a_time);
    }

    // Search index

    /// Count an index job reaching `state`.
    pub fn record_index(&self, state: PendingState) {
        match state {
            PendingState::Submitted => bump(&self.index_submitted),
            PendingState::Queued => bump(&self.index_queued),
            PendingState::Deferred => bump(&self.index_deferred),
            PendingState::DroppedWithLog => bump(&self.index_dropped),
            PendingState::Applied => bump(&self.index_rows_applied),
            PendingState::Retried | PendingState::FallbackDirect => {
                debug_assert!(false, "invalid index state {:?}", state);
            }
        }
    }

    pub fn record_index_batch(&self, rows: usize, slow: bool) {
        bump(&self.index_batches);
        self.index_rows_applied
            .fetch_add(rows as u64, Ordering::Relaxed);
        if slow {
            bump(&self.index_slow_batches);
        }
    }

    pub fn record_index_batch_failure(&self) {
        bump(&self.index_batch_failures);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let batches = load(&self.insert_batches);
        let total_batch_size = load(&self.insert_total_batch_size);
        let total_latency = load(&self.insert_total_latency_ns);

        PipelineStatsSnapshot {
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            queue_units_applied: load(&self.units_applied),
            queue_unit_panics: load(&self.unit_panics),
            stream_appends: load(&self.stream_appends),
            stream_base_rows_created: load(&self.stream_base_rows_created),
            stream_direct_appends: load(&self.stream_direct_appends),
            stream_flushes: load(&self.stream_flushes),
            stream_bytes_flushed: load(&self.stream_bytes_flushed),
            stream_flush_retried: load(&self.stream_flush_retried),
            stream_flush_errors: load(&self.stream_flush_errors),
            stream_rows_recreated: load(&self.stream_rows_recreated),
            stream_evictions: load(&self.stream_evictions),
            insert_submitted: load(&self.insert_submitted),
            insert_queued: load(&self.insert_queued),
            insert_fallback_direct: load(&self.insert_fallback_direct),
            insert_rows_committed: load(&self.insert_rows_committed),
            insert_rows_failed: load(&self.insert_rows_failed),
            insert_batches: batches,
            insert_batch_retries: load(&self.insert_batch_retries),
            insert_row_at_a_time: load(&self.insert_row_at_a_time),
            avg_insert_batch_size: if batches > 0 {
                total_batch_size as f64 / batches as f64
            } else {
                0.0
            },
            avg_insert_batch_latency_ms: if batches > 0 {
                (total_latency as f64 / batches as f64) / 1_000_000.0
            } else {
                0.0
            },
            index_submitted: load(&self.index_submitted),
            index_queued: load(&self.index_queued),
            index_deferred: load(&self.index_deferred),
            index_dropped: load(&self.index_dropped),
            index_rows_applied: load(&self.index_rows_applied),
            index_batches: load(&self.index_batches),
            index_batch_failures: load(&self.index_batch_failures),
            index_slow_batches: load(&self.index_slow_batches),
        }
    }
}
