//! HTTP test harness binary
//!
//! Serves an in-memory server of record: the REST group API plus the `/ws`
//! push channel. Point a client at it with `FITSYNC_SERVER_BASE_URL`.

use anyhow::Result;
use clap::Parser;
use fitsync_core::core_groups::{Group, GroupId, UserId};
use fitsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use fitsync_core::test_harness::{HarnessServer, InMemoryBackend};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "test-harness")]
#[command(about = "fitsync in-memory backend", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Seed a few groups, including one whose record is missing
    #[arg(long)]
    seed: bool,
}

fn seed(backend: &InMemoryBackend) {
    let mut runners = Group::virtual_placeholder(GroupId(1), UserId(1));
    runners.name = "Morning Runners".to_string();
    runners.participant_ids.extend([UserId(2), UserId(3)]);
    let id = backend.insert_group(runners);
    backend.insert_identifier(id, format!("group-{}", id));

    // Mapping without a group record; clients show it as a virtual group.
    backend.insert_identifier(GroupId(7), "group-uuid-abc123");
    backend.set_next_id(57);
    info!("Seeded demo groups");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(LogConfig::new(LogLevel::Info))?;

    let backend = Arc::new(InMemoryBackend::new());
    if args.seed {
        seed(&backend);
    }

    let addr = format!("{}:{}", args.host, args.port);
    info!(%addr, "Starting test harness");
    HarnessServer::new(backend, addr)
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
