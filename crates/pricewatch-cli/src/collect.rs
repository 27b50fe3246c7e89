//! Watchlist collection: drives the external page-fetch boundary with
//! bounded retry and appends validated observations. One product's failure
//! never aborts the rest of the batch.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pricewatch_core::{now_utc, parse_rfc3339_utc, ObservationInput};
use pricewatch_store_sqlite::SqlitePriceStore;
use serde::Deserialize;
use tracing::{info, warn};

/// One page readout handed over by the external scraping process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PageSnapshot {
    pub title: String,
    pub rating: Option<f64>,
    pub price: f64,
    /// RFC3339 UTC; defaults to the collection time when absent.
    #[serde(default)]
    pub fetched_at: Option<String>,
}

/// The fetch boundary. Implementations may be flaky; callers retry.
pub trait FetchPage {
    /// # Errors
    /// Returns an error when the page could not be fetched this attempt.
    fn fetch(&self, url: &str) -> Result<PageSnapshot>;
}

/// Feed file written by the external scraper: a JSON object keyed by URL.
pub struct FileFeed {
    snapshots: BTreeMap<String, PageSnapshot>,
}

impl FileFeed {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed from {}", path.display()))?;
        let snapshots: BTreeMap<String, PageSnapshot> =
            serde_json::from_str(&content).context("failed to parse feed JSON")?;
        Ok(Self { snapshots })
    }
}

impl FetchPage for FileFeed {
    fn fetch(&self, url: &str) -> Result<PageSnapshot> {
        self.snapshots
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("feed has no snapshot for {url}"))
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CollectReport {
    pub attempted: usize,
    pub stored: usize,
    pub failed: usize,
}

/// Fetches every watched product and appends one observation per success.
/// Fetch and validation failures are logged and skipped; store failures
/// abort the pass.
pub fn collect_watchlist(
    store: &mut SqlitePriceStore,
    fetcher: &dyn FetchPage,
    max_attempts: u32,
) -> Result<CollectReport> {
    if max_attempts == 0 {
        return Err(anyhow!("max_attempts MUST be >= 1"));
    }

    let watchlist = store.list_watchlist()?;
    if watchlist.is_empty() {
        info!("watchlist is empty, nothing to collect");
        return Ok(CollectReport {
            attempted: 0,
            stored: 0,
            failed: 0,
        });
    }

    let mut stored = 0;
    let mut failed = 0;
    for entry in &watchlist {
        let snapshot = match fetch_with_retry(fetcher, &entry.url, max_attempts) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    product_id = entry.product_id.0,
                    url = %entry.url,
                    "giving up after {max_attempts} attempts: {err}"
                );
                failed += 1;
                continue;
            }
        };

        let scraped_at = match snapshot.fetched_at.as_deref().map(parse_rfc3339_utc) {
            None => now_utc(),
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                warn!(
                    product_id = entry.product_id.0,
                    "skipping snapshot with bad fetched_at: {err}"
                );
                failed += 1;
                continue;
            }
        };

        let input = ObservationInput {
            product_id: entry.product_id,
            title: snapshot.title,
            rating: snapshot.rating,
            price: snapshot.price,
            url: entry.url.clone(),
            scraped_at,
        };

        if let Err(err) = input.validate() {
            warn!(
                product_id = entry.product_id.0,
                "skipping invalid snapshot: {err}"
            );
            failed += 1;
            continue;
        }

        let observation = store.insert_observation(&input)?;
        info!(
            product_id = observation.product_id.0,
            price = observation.price,
            "stored observation"
        );
        stored += 1;
    }

    info!(stored, failed, "collection pass finished");
    Ok(CollectReport {
        attempted: watchlist.len(),
        stored,
        failed,
    })
}

fn fetch_with_retry(
    fetcher: &dyn FetchPage,
    url: &str,
    max_attempts: u32,
) -> Result<PageSnapshot> {
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match fetcher.fetch(url) {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) => {
                warn!(%url, attempt, "fetch attempt failed: {err}");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("no fetch attempts were made")))
}
