//! Command surface for the price tracking and forecast scoring pipeline.
//!
//! An external scheduler invokes one subcommand per configured time of day,
//! in dependency order: `collect`, `forecast`, then `reconcile`, `fill`,
//! `evaluate`, `aggregate` (or `run-all` for the last four in one shot).

pub mod collect;
pub mod config;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use pricewatch_core::{now_utc, parse_calendar_day, to_calendar_day, ProductId, TrendRegressor};
use pricewatch_store_sqlite::SqlitePriceStore;
use serde::Serialize;
use time::{Date, Duration};

use crate::collect::{collect_watchlist, FileFeed};
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Product price tracking and forecast scoring pipeline")]
pub struct Cli {
    /// TOML configuration file; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured database path.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the product watchlist.
    Watch {
        #[command(subcommand)]
        command: WatchCommand,
    },
    /// Fetch every watched product and append observations.
    Collect(CollectArgs),
    /// Produce forecasts for the days after each product's last observation.
    Forecast(ForecastArgs),
    /// Fill forecast real prices from same-day observations.
    Reconcile(ReportArgs),
    /// Interpolate remaining real-price gaps, falling back to predictions.
    Fill(ReportArgs),
    /// Recompute per-product accuracy metrics.
    Evaluate(ReportArgs),
    /// Roll forecasts, observations, and metrics into fact rows.
    Aggregate(AggregateArgs),
    /// Reconcile, fill, evaluate, and aggregate in dependency order.
    RunAll(AggregateArgs),
}

#[derive(Debug, Subcommand)]
pub enum WatchCommand {
    Add(WatchAddArgs),
    List,
}

#[derive(Debug, Args)]
pub struct WatchAddArgs {
    #[arg(long)]
    product_id: i64,
    #[arg(long)]
    url: String,
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// JSON feed file; falls back to the configured one.
    #[arg(long)]
    feed: Option<PathBuf>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    /// Days to forecast past each product's last observation.
    #[arg(long)]
    horizon: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AggregateArgs {
    /// Window start day (YYYY-MM-DD); defaults to the configured depth
    /// before the end.
    #[arg(long)]
    start: Option<String>,
    /// Window end day (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
struct DailyReport {
    reconcile: pricewatch_store_sqlite::ReconcileReport,
    fill: pricewatch_store_sqlite::FillReport,
    evaluate: pricewatch_store_sqlite::EvaluateReport,
    aggregate: pricewatch_store_sqlite::AggregateReport,
}

/// Loads configuration, opens and migrates the store, and dispatches.
///
/// # Errors
/// Returns an error when configuration, store setup, or the requested
/// command fails; the binary surfaces it via a nonzero exit.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.db_path));
    let mut store = SqlitePriceStore::open(&db_path)?;
    store.migrate()?;

    run_command(cli.command, &config, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when the command's reads or writes fail.
pub fn run_command(command: Command, config: &Config, store: &mut SqlitePriceStore) -> Result<()> {
    match command {
        Command::Watch { command } => match command {
            WatchCommand::Add(args) => {
                store.upsert_watch(ProductId(args.product_id), &args.url)?;
                println!("watching product {} at {}", args.product_id, args.url);
                Ok(())
            }
            WatchCommand::List => {
                for entry in store.list_watchlist()? {
                    println!("{}\t{}", entry.product_id, entry.url);
                }
                Ok(())
            }
        },
        Command::Collect(args) => {
            let feed_path = args
                .feed
                .clone()
                .or_else(|| config.collect.feed.clone().map(PathBuf::from))
                .ok_or_else(|| anyhow!("no feed file given; pass --feed or configure one"))?;
            let feed = FileFeed::load(&feed_path)?;
            let max_attempts = args.max_attempts.unwrap_or(config.collect.max_attempts);

            let report = collect_watchlist(store, &feed, max_attempts)?;
            print_report(
                &report,
                args.json,
                &format!(
                    "stored {} of {} watched products ({} failed)",
                    report.stored, report.attempted, report.failed
                ),
            )
        }
        Command::Forecast(args) => {
            let horizon = args.horizon.unwrap_or(config.forecast.horizon_days);
            let report = store.run_forecast(&TrendRegressor, horizon)?;
            print_report(
                &report,
                args.json,
                &format!(
                    "forecast {} days for {} products: {} inserted, {} already present",
                    horizon, report.products, report.inserted, report.skipped
                ),
            )
        }
        Command::Reconcile(args) => {
            let report = store.reconcile()?;
            print_report(
                &report,
                args.json,
                &format!(
                    "matched {} of {} unresolved forecasts",
                    report.matched, report.unresolved
                ),
            )
        }
        Command::Fill(args) => {
            let report = store.fill_price_gaps(now_utc())?;
            print_report(
                &report,
                args.json,
                &format!(
                    "rewrote {} rows: {} interpolated, {} from predictions",
                    report.rewritten, report.interpolated, report.fallback
                ),
            )
        }
        Command::Evaluate(args) => {
            let report = store.evaluate()?;
            print_report(
                &report,
                args.json,
                &format!(
                    "scored {} products over {} reconciled pairs",
                    report.products, report.pairs
                ),
            )
        }
        Command::Aggregate(args) => {
            let (start, end) = aggregation_window(config, args.start.as_deref(), args.end.as_deref())?;
            let report = store.aggregate(start, end)?;
            print_report(
                &report,
                args.json,
                &format!("upserted {} fact rows for {start} through {end}", report.rows),
            )
        }
        Command::RunAll(args) => {
            let (start, end) = aggregation_window(config, args.start.as_deref(), args.end.as_deref())?;

            let report = DailyReport {
                reconcile: store.reconcile()?,
                fill: store.fill_price_gaps(now_utc())?,
                evaluate: store.evaluate()?,
                aggregate: store.aggregate(start, end)?,
            };
            print_report(
                &report,
                args.json,
                &format!(
                    "daily pass: {} reconciled, {} rewritten, {} products scored, {} fact rows",
                    report.reconcile.matched,
                    report.fill.rewritten,
                    report.evaluate.products,
                    report.aggregate.rows
                ),
            )
        }
    }
}

fn aggregation_window(
    config: &Config,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(Date, Date)> {
    let end = match end {
        Some(raw) => {
            parse_calendar_day(raw).map_err(|err| anyhow!("invalid --end value: {err}"))?
        }
        None => to_calendar_day(now_utc()),
    };

    let start = match start {
        Some(raw) => {
            parse_calendar_day(raw).map_err(|err| anyhow!("invalid --start value: {err}"))?
        }
        None => end - Duration::days(config.window.days_back),
    };

    if end < start {
        return Err(anyhow!("window end {end} precedes start {start}"));
    }

    Ok((start, end))
}

fn print_report<T: Serialize>(report: &T, json: bool, line: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn window_defaults_to_yesterday_through_today() {
        let config = Config::default();
        let (start, end) = must(aggregation_window(&config, None, None));
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn window_accepts_explicit_bounds() {
        let config = Config::default();
        let (start, end) = must(aggregation_window(
            &config,
            Some("2024-01-01"),
            Some("2024-01-05"),
        ));
        assert_eq!(start, date!(2024 - 01 - 01));
        assert_eq!(end, date!(2024 - 01 - 05));

        assert!(aggregation_window(&config, Some("2024-01-06"), Some("2024-01-05")).is_err());
        assert!(aggregation_window(&config, Some("bogus"), None).is_err());
    }

    #[test]
    fn cli_parses_scheduler_invocations() {
        let cli = Cli::parse_from([
            "pricewatch",
            "--db",
            "/tmp/prices.sqlite3",
            "aggregate",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-02",
            "--json",
        ]);

        match cli.command {
            Command::Aggregate(args) => {
                assert_eq!(args.start.as_deref(), Some("2024-01-01"));
                assert!(args.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
