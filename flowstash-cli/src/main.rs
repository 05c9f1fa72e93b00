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

//! Flowstash CLI
//!
//! Command-line front end for the write engine: create a database, push a
//! synthetic load through it, tag and search flows.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowstash_core::{telemetry, EngineConfig, HttpFlow, StreamEvent};
use flowstash_storage::WriteEngine;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "flowstash")]
#[command(about = "Flowstash - buffered SQLite writer for captured traffic", long_about = None)]
struct Cli {
    /// Database file (overrides the config file)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its tables
    Init,

    /// Print the effective configuration
    Config,

    /// Push synthetic flows and streams through the engine
    LoadTest {
        /// Number of flows to insert
        #[arg(default_value = "10000")]
        flows: usize,

        /// Number of concurrent streams
        #[arg(long, default_value = "8")]
        streams: usize,

        /// Fragments appended per stream
        #[arg(long, default_value = "200")]
        fragments: usize,
    },

    /// Replace the tags of a flow
    Tag {
        /// Flow id
        id: i64,

        /// Tags to set
        tags: Vec<String>,
    },

    /// Full-text search over flows
    Search {
        /// FTS5 query
        query: String,

        /// Maximum number of ids
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => EngineConfig::default(),
    }
    .merge_env();
    if let Some(path) = &cli.db_path {
        config.storage.path = path.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(if cli.verbose { "debug" } else { "info" });

    let config = load_config(&cli)?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let db_path = config.storage.path.clone();
    let engine = Arc::new(
        WriteEngine::open(config)
            .await
            .context("Failed to open database")?,
    );

    match cli.command {
        Commands::Config => {}

        Commands::Init => {
            info!("Initialized database at {:?}", db_path);
            println!("✓ Database initialized at {:?}", db_path);
        }

        Commands::LoadTest {
            flows,
            streams,
            fragments,
        } => {
            info!(flows, streams, fragments, "Starting load test");
            let start = Instant::now();

            let mut tasks = Vec::with_capacity(streams);
            for s in 0..streams {
                let engine = engine.clone();
                tasks.push(tokio::spawn(async move {
                    let stream_id = format!("load-{}", s);
                    for f in 0..fragments {
                        let event = StreamEvent::new(stream_id.clone(), format!("tok{} ", f));
                        let event = if f + 1 == fragments { event.finished() } else { event };
                        engine.append(event).await?;
                    }
                    Ok::<(), flowstash_core::FlowstashError>(())
                }));
            }

            let mut rng = rand::thread_rng();
            for i in 0..flows {
                let status = [200, 201, 204, 301, 404, 500][rng.gen_range(0..6)];
                let mut flow = HttpFlow::new("GET", format!("https://load.local/item/{}", i))
                    .with_request(format!("GET /item/{} HTTP/1.1", i))
                    .with_response(status, format!("body-{}", rng.gen::<u32>()))
                    .with_source("load-test");
                flow.add_tag("synthetic");
                engine.submit_flow(flow, Vec::new()).await?;

                if (i + 1) % 10_000 == 0 {
                    println!("  Submitted {} flows...", i + 1);
                }
            }

            for task in tasks {
                task.await.context("Stream task panicked")??;
            }
            engine.flush_all().await?;

            let duration = start.elapsed();
            let stats = engine.stats();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "✓ Wrote {} flows and {} stream fragments in {:.2}s",
                    stats.insert_rows_committed,
                    stats.stream_appends,
                    duration.as_secs_f64()
                );
                println!(
                    "  Throughput: {:.0} flows/sec",
                    flows as f64 / duration.as_secs_f64()
                );
                println!(
                    "  Insert batches: {} (avg {:.1} rows, {:.2} ms)",
                    stats.insert_batches,
                    stats.avg_insert_batch_size,
                    stats.avg_insert_batch_latency_ms
                );
                println!(
                    "  Stream flushes: {} ({} bytes)",
                    stats.stream_flushes, stats.stream_bytes_flushed
                );
                println!(
                    "  Index: {} applied, {} deferred, {} dropped",
                    stats.index_rows_applied, stats.index_deferred, stats.index_dropped
                );
            }
        }

        Commands::Tag { id, tags } => {
            let affected = engine.update_flow_tags(id, tags.as_slice()).await?;
            engine.flush_all().await?;
            if cli.json {
                println!("{}", serde_json::json!({ "id": id, "updated": affected }));
            } else if affected == 0 {
                println!("No flow with id {}", id);
            } else {
                println!("✓ Tagged flow {}", id);
            }
        }

        Commands::Search { query, limit } => {
            let ids = engine
                .search_flow_ids(&query, limit)
                .await
                .context("Search failed")?;
            if cli.json {
                println!("{}", serde_json::to_string(&ids)?);
            } else {
                println!("Found {} flows", ids.len());
                for id in ids {
                    println!("  {}", id);
                }
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}
