// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ingest::config::Config;
use ingest::coordinator::Coordinator;
use ingest::entry::{Entry, EntryTag};
use ingest::tags::TagPattern;

const HOT_WAIT: Duration = Duration::from_secs(30);
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(100);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("INGEST_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("INGEST | shipper stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = match env::var("INGEST_CONFIG_FILE") {
        Ok(path) => Config::from_json_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        Err(_) => Config::from_env().context("loading configuration from the environment")?,
    };

    let coordinator = Coordinator::connect_tcp(&config)?;
    let tag = resolve_tag(&coordinator, &config)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("INGEST | interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }

    if let Err(e) = coordinator.wait_for_hot(HOT_WAIT).await {
        warn!("INGEST | {e}, entries will be cached until a collector is reachable");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shipped: u64 = 0;
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if ship(&coordinator, tag, line.into_bytes(), &shutdown).await {
            shipped += 1;
        }
    }

    info!("INGEST | input finished after {shipped} entries, waiting for confirmations");
    if let Err(e) = coordinator.sync(SYNC_TIMEOUT).await {
        warn!("INGEST | sync before shutdown incomplete: {e}");
    }
    let stats = coordinator.stats();
    info!(
        "INGEST | written {} entries ({} bytes), confirmed {}, cached {}, requeued {}",
        stats.entries_written,
        stats.bytes_written,
        stats.entries_confirmed,
        stats.entries_cached,
        stats.entries_requeued
    );
    coordinator.close().await?;
    Ok(())
}

/// Uses `INGEST_SHIPPER_TAG`, or the first literal configured tag.
fn resolve_tag(coordinator: &Coordinator, config: &Config) -> anyhow::Result<EntryTag> {
    let name = match env::var("INGEST_SHIPPER_TAG") {
        Ok(name) => name,
        Err(_) => config
            .tags
            .iter()
            .find(|t| matches!(TagPattern::parse(t), Ok(TagPattern::Literal(_))))
            .cloned()
            .ok_or_else(|| anyhow!("set INGEST_SHIPPER_TAG or configure a literal tag"))?,
    };
    Ok(coordinator.get_tag(&name)?)
}

// Retries while the pipeline reports backpressure; returns whether the line was accepted.
async fn ship(
    coordinator: &Coordinator,
    tag: EntryTag,
    data: Vec<u8>,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        match coordinator.write_entry(Entry::new(tag, data.clone())).await {
            Ok(()) => return true,
            Err(e) if e.is_capacity() => {
                debug!("INGEST | backpressure: {e}");
                tokio::select! {
                    () = shutdown.cancelled() => return false,
                    () = sleep(BACKPRESSURE_PAUSE) => {}
                }
            }
            Err(e) => {
                error!("INGEST | dropping line: {e}");
                return false;
            }
        }
    }
}
