//! sync-demo
//!
//! Runs the engine against in-memory collaborators: parents reference
//! students, every student write propagates the student's name to the
//! referencing parents, and the final engine status is printed as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fieldsync_core::{Document, SyncRule};
use fieldsync_engine::storage::{MemoryChangeFeed, MemoryStore};
use fieldsync_engine::telemetry::{init_tracing, LogFormat};
use fieldsync_engine::{handler_fn, EngineConfig, SyncEngine, TracingAuditSink};
use serde_json::json;
use tracing::info;

/// Propagate student writes to parent documents and report engine status.
#[derive(Parser)]
#[command(name = "sync-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of processor workers
    #[arg(short, long, default_value_t = 3, env = "FIELDSYNC_WORKERS")]
    workers: usize,

    /// Number of students to write
    #[arg(short, long, default_value_t = 100)]
    events: usize,

    /// Event queue capacity
    #[arg(long, default_value_t = 10_000)]
    queue_capacity: usize,

    /// Seconds to wait for propagation before giving up
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn document(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, "info,fieldsync_engine=info");

    let feed = Arc::new(MemoryChangeFeed::new());
    let store = Arc::new(MemoryStore::with_feed(Arc::clone(&feed)));
    let engine = SyncEngine::new(
        EngineConfig::default()
            .with_worker_count(cli.workers)
            .with_queue_capacity(cli.queue_capacity)
            .with_poll_timeout(Duration::from_millis(100))
            .with_drain_timeout(Duration::from_secs(5)),
        Arc::clone(&feed) as _,
        Arc::clone(&store) as _,
        Arc::new(TracingAuditSink),
    );

    engine.add_sync_rule(
        SyncRule::builder("student-names", "students")
            .target("parents")
            .map("_id", "student_id")
            .map("name", "student_name")
            .build()
            .context("invalid sync rule")?,
    );
    engine.add_event_handler(
        "students:insert",
        handler_fn(|event| async move {
            tracing::debug!(student = %event.document_id, "student synced");
            Ok(())
        }),
    );

    for i in 0..cli.events {
        store.seed(
            "parents",
            &format!("P{i}"),
            document(json!({ "student_id": format!("S{i}") })),
        );
    }

    engine.start().await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.timeout_secs);
    while feed.live_subscribers("students") == 0 {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "listener did not subscribe in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for i in 0..cli.events {
        store.insert(
            "students",
            &format!("S{i}"),
            document(json!({ "name": format!("Student {i}") })),
        );
    }

    let expected = u64::try_from(cli.events)?;
    let wait = async {
        while engine.status().stats.events_processed < expected {
            if tokio::time::Instant::now() >= deadline {
                info!(
                    processed = engine.status().stats.events_processed,
                    expected, "timed out waiting for propagation"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::select! {
        () = wait => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    let synced = store
        .documents("parents")
        .iter()
        .filter(|parent| parent.contains_key("student_name"))
        .count();
    info!(synced, parents = cli.events, "propagation finished");

    let status = engine.status();
    engine.stop().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
