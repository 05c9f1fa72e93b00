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

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowstash_core::{EngineConfig, HttpFlow, StreamEvent};
use flowstash_storage::WriteEngine;
use tempfile::tempdir;
use tokio::runtime::Runtime;

fn bench_bulk_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bulk_insert");
    group.sample_size(20);

    for size in [100, 1000, 5000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                rt.block_on(async {
                    let config = EngineConfig::default().with_path(dir.path().join("bench.db"));
                    let engine = WriteEngine::open(config).await.unwrap();
                    for i in 0..size {
                        let flow = HttpFlow::new("GET", format!("https://bench.local/{}", i))
                            .with_response(200, "ok");
                        engine.submit_flow(black_box(flow), Vec::new()).await.unwrap();
                    }
                    engine.flush_insert_queue().await.unwrap();
                    engine.shutdown().await.unwrap();
                });
            });
        });
    }

    group.finish();
}

fn bench_stream_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_append");
    group.sample_size(20);

    for fragments in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*fragments as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(fragments),
            fragments,
            |b, &fragments| {
                b.iter(|| {
                    let dir = tempdir().unwrap();
                    rt.block_on(async {
                        let config =
                            EngineConfig::default().with_path(dir.path().join("bench.db"));
                        let engine = WriteEngine::open(config).await.unwrap();
                        for _ in 0..fragments {
                            let event = StreamEvent::new("bench-stream", "token ");
                            engine.append(black_box(event)).await.unwrap();
                        }
                        engine.finish_stream("bench-stream").await.unwrap();
                        engine.shutdown().await.unwrap();
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_bulk_insert, bench_stream_append);
criterion_main!(benches);
