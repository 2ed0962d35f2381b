//! portable-db probe - open a connection and report what the layer sees.
//!
//! Prints the connection's identity and capabilities as JSON, optionally
//! probes 4-byte UTF-8 support and mints sequence ids.

use clap::Parser;
use portable_db::config::{ConnectionOptions, ProbeConfig};
use portable_db::db::Connection;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &ProbeConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn probe(config: &ProbeConfig) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let options = ConnectionOptions::from_url(&config.database)?;

    let mut conn = if config.create {
        Connection::open_or_create(options).await?
    } else {
        Connection::open(options).await?
    };

    let mut report = json!({
        "connection": conn.info(),
        "utf8mb4": {
            "active": conn.utf8mb4_is_active(),
            "configurable": conn.utf8mb4_is_configurable(),
        },
    });

    if config.probe_charset {
        report["utf8mb4"]["supported"] = json!(conn.utf8mb4_is_supported().await);
    }

    if config.next_ids > 0 {
        conn.ensure_sequence_table().await?;
        let mut ids = Vec::with_capacity(config.next_ids as usize);
        for _ in 0..config.next_ids {
            ids.push(conn.next_id(0).await?);
        }
        report["next_ids"] = json!(ids);
    }

    conn.close().await?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProbeConfig::parse();
    init_tracing(&config);

    info!("Starting portable-db probe v{}", env!("CARGO_PKG_VERSION"));

    match probe(&config).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Probe failed");
            Err(e)
        }
    }
}
