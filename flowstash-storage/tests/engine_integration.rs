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

//! Integration tests for the write engine

use flowstash_core::{DialectKind, EngineConfig, FlowstashError, HttpFlow, StreamEvent};
use flowstash_storage::{InsertCompletion, WriteEngine};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// In-memory config whose background ticker never fires during a test.
fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::in_memory();
    config.stream.flush_interval_ms = 60_000;
    config.stream.max_flush_delay_ms = 60_000;
    config.stream.idle_ttl_ms = 60_000;
    config
}

fn on_done<F>(f: F) -> InsertCompletion<HttpFlow>
where
    F: FnOnce(std::result::Result<&HttpFlow, &FlowstashError>) + Send + 'static,
{
    Box::new(f)
}

async fn count_rows(engine: &WriteEngine, sql: &'static str) -> i64 {
    engine
        .writer()
        .call("count", move |ctx| Ok(ctx.conn().query_row(sql, [], |r| r.get(0))?))
        .await
        .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// First fragment is durable at once, later ones wait for a flush
#[tokio::test]
async fn test_stream_scenario() {
    let engine = WriteEngine::open(quiet_config()).await.unwrap();

    engine.append(StreamEvent::new("E1", "ab")).await.unwrap();
    assert_eq!(engine.read_stream("E1").await.unwrap(), Some(b"ab".to_vec()));

    engine.append(StreamEvent::new("E1", "cd")).await.unwrap();
    assert_eq!(engine.read_stream("E1").await.unwrap(), Some(b"ab".to_vec()));
    assert_eq!(engine.streams().pending_bytes("E1"), Some(2));

    engine.flush_all().await.unwrap();
    assert_eq!(engine.read_stream("E1").await.unwrap(), Some(b"abcd".to_vec()));

    engine.finish_stream("E1").await.unwrap();
    assert_eq!(engine.streams().entry_count(), 0);
    assert_eq!(
        count_rows(&engine, "SELECT COUNT(*) FROM stream_events WHERE stream_id = 'E1'").await,
        1
    );
    engine.shutdown().await.unwrap();
}

/// A finished event flushes and releases its stream
#[tokio::test]
async fn test_finished_event_releases_stream() {
    let engine = WriteEngine::open(quiet_config()).await.unwrap();
    engine.append(StreamEvent::new("done", "x")).await.unwrap();
    engine
        .append(StreamEvent::new("done", "y").finished())
        .await
        .unwrap();
    assert_eq!(engine.read_stream("done").await.unwrap(), Some(b"xy".to_vec()));
    assert_eq!(engine.streams().entry_count(), 0);
}

/// Concurrent first appends for one id create exactly one row
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_create_one_row() {
    let engine = Arc::new(WriteEngine::open(quiet_config()).await.unwrap());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.append(StreamEvent::new("shared", "x")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    engine.flush_all().await.unwrap();

    assert_eq!(
        engine.read_stream("shared").await.unwrap(),
        Some(vec![b'x'; 16])
    );
    assert_eq!(
        count_rows(&engine, "SELECT COUNT(*) FROM stream_events WHERE stream_id = 'shared'").await,
        1
    );
    assert_eq!(engine.stats().stream_base_rows_created, 1);
}

/// N submitted rows get N unique ids in submission order
#[tokio::test]
async fn test_submitted_rows_get_ordered_ids() {
    let engine = WriteEngine::open(quiet_config()).await.unwrap();
    let ids = Arc::new(Mutex::new(Vec::new()));

    for i in 0..600 {
        let ids = ids.clone();
        engine
            .submit_flow(
                HttpFlow::new("GET", format!("http://svc/item/{}", i)),
                vec![on_done(move |outcome| {
                    let flow = outcome.expect("insert failed");
                    ids.lock().push((i, flow.id.unwrap_or_default()));
                })],
            )
            .await
            .unwrap();
    }
    engine.flush_insert_queue().await.unwrap();

    let mut ids = ids.lock().clone();
    assert_eq!(ids.len(), 600);
    ids.sort_by_key(|(i, _)| *i);
    for pair in ids.windows(2) {
        assert!(pair[0].1 < pair[1].1, "ids out of submission order: {:?}", pair);
    }
    assert_eq!(count_rows(&engine, "SELECT COUNT(*) FROM http_flows").await, 600);
}

/// 3K+1 rows in one window all commit when a statement fits K rows
#[tokio::test]
async fn test_param_limit_chunks_batch() {
    let mut config = quiet_config();
    // 16 columns per flow, two rows per statement
    config.storage.param_limit = Some(32);
    let engine = WriteEngine::open(config).await.unwrap();

    for i in 0..7 {
        engine
            .submit_flow(HttpFlow::new("POST", format!("http://chunk/{}", i)), Vec::new())
            .await
            .unwrap();
    }
    engine.flush_insert_queue().await.unwrap();

    assert_eq!(count_rows(&engine, "SELECT COUNT(*) FROM http_flows").await, 7);
    let stats = engine.stats();
    assert_eq!(stats.insert_rows_committed, 7);
    assert_eq!(stats.insert_rows_failed, 0);
}

/// A ceiling below one row's width still inserts one row per statement
#[tokio::test]
async fn test_param_limit_below_row_width() {
    let mut config = quiet_config();
    config.storage.param_limit = Some(4);
    let engine = WriteEngine::open(config).await.unwrap();

    let flow = engine
        .insert_flow(HttpFlow::new("GET", "http://narrow/"))
        .await;
    // SQLite itself allows far more than 4 parameters
    assert!(flow.unwrap().id.is_some());
}

/// Rows insert into whatever subset of columns the table still has
#[tokio::test]
async fn test_schema_drift_uses_live_columns() {
    let engine = WriteEngine::open(quiet_config()).await.unwrap();
    engine
        .writer()
        .call("drift", |ctx| {
            ctx.conn()
                .execute_batch("ALTER TABLE http_flows DROP COLUMN remote_addr")?;
            Ok(())
        })
        .await
        .unwrap();

    let flow = engine
        .insert_flow(HttpFlow::new("GET", "http://drift/"))
        .await
        .unwrap();
    assert_eq!(flow.id, Some(1));
}

/// Busy store: the ticker absorbs the error, explicit flushes surface it,
/// and nothing buffered is lost
#[tokio::test]
async fn test_busy_store_keeps_buffered_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let mut config = EngineConfig::fast().with_path(&path);
    config.storage.busy_timeout_ms = 0;
    config.index.enabled = false;
    let engine = WriteEngine::open(config).await.unwrap();

    engine.append(StreamEvent::new("b", "first ")).await.unwrap();

    let holder = rusqlite::Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

    engine.append(StreamEvent::new("b", "second")).await.unwrap();
    assert!(
        wait_until(
            || engine.stats().stream_flush_retried >= 1,
            Duration::from_secs(3)
        )
        .await
    );

    let err = engine.flush_pending_streams().await.unwrap_err();
    assert!(err.is_transient());

    holder.execute_batch("COMMIT").unwrap();
    drop(holder);

    engine.flush_all().await.unwrap();
    assert_eq!(
        engine.read_stream("b").await.unwrap(),
        Some(b"first second".to_vec())
    );
}

/// File-backed config that fails fast on a locked store and never ticks
fn locked_store_config(path: &std::path::Path) -> EngineConfig {
    let mut config = quiet_config().with_path(path);
    config.storage.busy_timeout_ms = 0;
    config.index.enabled = false;
    config
}

/// A busy store while creating the base row buffers the first fragment
/// and the next flush creates the row
#[tokio::test]
async fn test_base_row_on_busy_store_is_created_by_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy-base.db");
    let engine = WriteEngine::open(locked_store_config(&path)).await.unwrap();

    let holder = rusqlite::Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

    engine.append(StreamEvent::new("new", "first")).await.unwrap();
    engine.append(StreamEvent::new("new", " second")).await.unwrap();
    assert_eq!(engine.streams().pending_bytes("new"), Some(12));
    assert_eq!(engine.stats().stream_flush_retried, 1);

    holder.execute_batch("COMMIT").unwrap();
    drop(holder);

    engine.flush_all().await.unwrap();
    assert_eq!(
        engine.read_stream("new").await.unwrap(),
        Some(b"first second".to_vec())
    );
    let stats = engine.stats();
    assert_eq!(stats.stream_base_rows_created, 1);
    assert_eq!(stats.stream_rows_recreated, 0);
}

/// finish() on a locked store: one strict attempt, one best-effort retry,
/// then the bytes stay buffered for a later flush
#[tokio::test]
async fn test_finish_on_locked_store_retries_once_and_keeps_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy-finish.db");
    let engine = WriteEngine::open(locked_store_config(&path)).await.unwrap();

    engine.append(StreamEvent::new("f", "ab")).await.unwrap();
    engine.append(StreamEvent::new("f", "cd")).await.unwrap();

    let holder = rusqlite::Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

    engine.finish_stream("f").await.unwrap();
    assert_eq!(engine.streams().pending_bytes("f"), Some(2));
    let stats = engine.stats();
    assert_eq!(stats.stream_flush_errors, 1);
    assert_eq!(stats.stream_flush_retried, 1);

    holder.execute_batch("COMMIT").unwrap();
    drop(holder);

    engine.finish_stream("f").await.unwrap();
    assert_eq!(engine.streams().entry_count(), 0);
    assert_eq!(engine.read_stream("f").await.unwrap(), Some(b"abcd".to_vec()));
}

/// Rows written while indexing was off become searchable once it is on
#[tokio::test]
async fn test_reopen_with_index_backfills_existing_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("backfill.db");

    let mut config = quiet_config().with_path(&path);
    config.index.enabled = false;
    let engine = WriteEngine::open(config).await.unwrap();
    let flow = engine
        .insert_flow(HttpFlow::new("GET", "http://old/needle"))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();
    drop(engine);

    let engine = WriteEngine::open(quiet_config().with_path(&path)).await.unwrap();
    engine.flush_all().await.unwrap();
    assert_eq!(
        engine.search_flow_ids("needle", 10).await.unwrap(),
        vec![flow.id.unwrap()]
    );

    let newer = engine
        .insert_flow(HttpFlow::new("GET", "http://new/needle"))
        .await
        .unwrap();
    engine.flush_all().await.unwrap();
    assert_eq!(
        engine.search_flow_ids("needle", 10).await.unwrap(),
        vec![newer.id.unwrap(), flow.id.unwrap()]
    );
}

/// Turning the search index off leaves base writes untouched
#[tokio::test]
async fn test_disabled_index_does_not_affect_writes() {
    let mut config = quiet_config();
    config.index.enabled = false;
    let engine = WriteEngine::open(config).await.unwrap();

    let flow = engine
        .insert_flow(HttpFlow::new("GET", "http://plain/").with_response(200, "ok"))
        .await
        .unwrap();
    engine.append(StreamEvent::new("s", "data")).await.unwrap();
    engine.flush_all().await.unwrap();

    assert!(flow.id.is_some());
    assert_eq!(engine.read_stream("s").await.unwrap(), Some(b"data".to_vec()));
    assert_eq!(
        count_rows(
            &engine,
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'http_flows_fts'"
        )
        .await,
        0
    );
    assert!(engine.search_flow_ids("plain", 10).await.is_err());
    assert_eq!(engine.stats().index_submitted, 0);
}

/// Idle entries are evicted, the ticker stops, and a new append restarts it
#[tokio::test]
async fn test_idle_eviction_and_loop_restart() {
    let engine = WriteEngine::open(EngineConfig::fast().with_path(":memory:"))
        .await
        .unwrap();

    engine.append(StreamEvent::new("idle", "a")).await.unwrap();
    engine.append(StreamEvent::new("idle", "b")).await.unwrap();
    assert!(engine.streams().is_loop_running());

    let streams = engine.streams().clone();
    assert!(
        wait_until(
            || streams.entry_count() == 0 && !streams.is_loop_running(),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(engine.read_stream("idle").await.unwrap(), Some(b"ab".to_vec()));
    assert!(engine.stats().stream_evictions >= 1);

    engine.append(StreamEvent::new("idle", "c")).await.unwrap();
    assert!(engine.streams().is_loop_running());
    engine.flush_all().await.unwrap();
    assert_eq!(engine.read_stream("idle").await.unwrap(), Some(b"abc".to_vec()));
}

/// The networked dialect's statements run on the same transport
#[tokio::test]
async fn test_networked_dialect_end_to_end() {
    let mut config = quiet_config();
    config.storage.dialect = DialectKind::Networked;
    let engine = WriteEngine::open(config).await.unwrap();

    engine.append(StreamEvent::new("n", "he")).await.unwrap();
    engine.append(StreamEvent::new("n", "llo")).await.unwrap();
    for i in 0..3 {
        engine
            .submit_flow(HttpFlow::new("GET", format!("http://net/{}", i)), Vec::new())
            .await
            .unwrap();
    }
    engine.flush_all().await.unwrap();

    assert_eq!(engine.read_stream("n").await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(count_rows(&engine, "SELECT COUNT(*) FROM http_flows").await, 3);
    assert!(engine.stats().insert_row_at_a_time >= 1);
}

/// Inserted and re-tagged flows are searchable once the index is flushed
#[tokio::test]
async fn test_search_index_follows_inserts_and_updates() {
    let engine = WriteEngine::open(quiet_config()).await.unwrap();

    let flow = engine
        .insert_flow(
            HttpFlow::new("POST", "https://api.example.com/needle")
                .with_request("POST /needle HTTP/1.1")
                .with_response(201, "created"),
        )
        .await
        .unwrap();
    engine
        .insert_flow(HttpFlow::new("GET", "https://api.example.com/other"))
        .await
        .unwrap();
    engine.flush_all().await.unwrap();

    let id = flow.id.unwrap();
    assert_eq!(engine.search_flow_ids("needle", 10).await.unwrap(), vec![id]);

    engine.update_flow_tags(id, &["haystack"]).await.unwrap();
    engine.flush_search_index().await.unwrap();
    assert_eq!(engine.search_flow_ids("haystack", 10).await.unwrap(), vec![id]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Persisted content is the arrival-order concatenation no matter where
    /// flushes land
    #[test]
    fn prop_fragments_concatenate_in_order(
        fragments in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..24),
        flush_after in prop::collection::vec(any::<bool>(), 24),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (stored, expected) = rt.block_on(async {
            let mut config = quiet_config();
            config.stream.max_pending_bytes = 32;
            let engine = WriteEngine::open(config).await.unwrap();

            let mut expected = Vec::new();
            for (i, fragment) in fragments.iter().enumerate() {
                expected.extend_from_slice(fragment);
                engine
                    .append(StreamEvent::new("p", fragment.clone()))
                    .await
                    .unwrap();
                if flush_after[i] {
                    engine.flush_pending_streams().await.unwrap();
                }
            }
            engine.flush_all().await.unwrap();
            let stored = engine.read_stream("p").await.unwrap();
            engine.shutdown().await.unwrap();
            (stored, expected)
        });
        prop_assert_eq!(stored, Some(expected));
    }
}
