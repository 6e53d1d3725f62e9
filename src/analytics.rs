//! Periodic connection census appended to a CSV file.
//!
//! Each row is `timestamp,total,countries` where the countries column holds
//! `CC:n` tallies joined with `;`. Sessions without a resolved country count
//! toward the total but not toward any country.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::server::ConnectionRegistry;

const HEADER: &str = "timestamp,total,countries\n";

/// Appends one census row per interval until the process exits. A
/// non-positive interval disables the whole thing.
pub async fn run(registry: Arc<ConnectionRegistry>, interval: Duration, path: PathBuf) {
    if interval.is_zero() {
        info!("analytics disabled by request");
        return;
    }
    info!(
        seconds = interval.as_secs(),
        file = %path.display(),
        "starting analytics"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // An interval's first tick is immediate; the first census is due one
    // full interval in.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = update(&registry, &path).await {
            warn!(%err, file = %path.display(), "failed to update analytics file");
        }
    }
}

async fn update(registry: &ConnectionRegistry, path: &Path) -> io::Result<()> {
    let fresh = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(err),
    };
    if fresh {
        info!(file = %path.display(), "creating new analytics file");
    }
    info!(file = %path.display(), "updating analytics file");

    let (total, by_country) = census(registry).await;
    let countries = by_country
        .iter()
        .map(|(code, count)| format!("{code}:{count}"))
        .collect::<Vec<_>>()
        .join(";");
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if fresh {
        file.write_all(HEADER.as_bytes()).await?;
    }
    file.write_all(format!("{timestamp},{total},{countries}\n").as_bytes())
        .await?;
    file.flush().await
}

async fn census(registry: &ConnectionRegistry) -> (usize, BTreeMap<String, usize>) {
    let mut total = 0;
    let mut by_country = BTreeMap::new();
    registry
        .for_each(|session| {
            total += 1;
            if let Some(country) = session.country {
                *by_country.entry(country.to_string()).or_insert(0) += 1;
            }
        })
        .await;
    (total, by_country)
}
