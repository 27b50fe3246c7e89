#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pricewatch_core::{
    format_calendar_day, format_rfc3339, horizon_features, match_observed_prices,
    mean_absolute_error, now_utc, observed_prices_by_day, parse_calendar_day, parse_rfc3339_utc,
    resolve_price_gaps, root_mean_squared_error, training_rows, ErrorMetric, FactRow,
    FeatureSnapshot, Forecast, ForecastInput, Observation, ObservationInput, PriceSource,
    ProductId, Regressor,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::{Date, OffsetDateTime};
use tracing::info;

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS watchlist (
  product_id INTEGER PRIMARY KEY,
  url TEXT NOT NULL,
  added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS observations (
  obs_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  product_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  rating REAL CHECK (rating BETWEEN 0.0 AND 5.0 OR rating IS NULL),
  price REAL NOT NULL CHECK (price >= 0.0),
  url TEXT NOT NULL,
  scraped_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_observations_no_update
BEFORE UPDATE ON observations
BEGIN
  SELECT RAISE(FAIL, 'observations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_observations_no_delete
BEFORE DELETE ON observations
BEGIN
  SELECT RAISE(FAIL, 'observations is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_observations_product_scraped
  ON observations(product_id, scraped_at);

CREATE TABLE IF NOT EXISTS forecasts (
  forecast_id INTEGER PRIMARY KEY AUTOINCREMENT,
  product_id INTEGER NOT NULL,
  forecast_ts TEXT NOT NULL,
  predicted_price REAL NOT NULL,
  real_price REAL,
  price_source TEXT CHECK (
    price_source IN ('observed', 'interpolated', 'predicted')
    OR price_source IS NULL
  ),
  day_of_month INTEGER NOT NULL CHECK (day_of_month BETWEEN 1 AND 31),
  month INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
  day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
  days_since_start INTEGER NOT NULL,
  rating REAL NOT NULL,
  moving_avg_3 REAL NOT NULL,
  moving_avg_7 REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_forecasts_product_ts
  ON forecasts(product_id, forecast_ts);

CREATE TABLE IF NOT EXISTS model_errors (
  product_id INTEGER PRIMARY KEY,
  mae REAL NOT NULL CHECK (mae >= 0.0),
  rmse REAL NOT NULL CHECK (rmse >= 0.0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fact_prices (
  product_id INTEGER NOT NULL,
  day TEXT NOT NULL,
  real_price REAL,
  predicted_price REAL,
  day_of_month INTEGER,
  month INTEGER,
  day_of_week INTEGER,
  days_since_start INTEGER,
  rating REAL,
  moving_avg_3 REAL,
  moving_avg_7 REAL,
  mae REAL,
  rmse REAL,
  aggregated_at TEXT NOT NULL,
  PRIMARY KEY (product_id, day)
);
";

const FORECAST_COLUMNS: &str = "forecast_id, product_id, forecast_ts, predicted_price, \
     real_price, price_source, day_of_month, month, day_of_week, days_since_start, \
     rating, moving_avg_3, moving_avg_7";

pub struct SqlitePriceStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub unresolved: usize,
    pub observations_read: usize,
    pub matched: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FillReport {
    pub snapshot_rows: usize,
    pub rewritten: usize,
    pub interpolated: usize,
    pub fallback: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EvaluateReport {
    pub pairs: usize,
    pub products: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AggregateReport {
    pub rows: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ForecastReport {
    pub products: usize,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct WatchEntry {
    pub product_id: ProductId,
    pub url: String,
}

impl SqlitePriceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply price store schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MIGRATION_VERSION, now],
            )
            .context("failed to register price store schema migration")?;

        Ok(())
    }

    pub fn upsert_watch(&self, product_id: ProductId, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(anyhow!("watchlist url MUST not be empty"));
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO watchlist(product_id, url, added_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(product_id) DO UPDATE SET url = excluded.url",
                params![product_id.0, url, now],
            )
            .context("failed to upsert watchlist entry")?;

        Ok(())
    }

    pub fn list_watchlist(&self) -> Result<Vec<WatchEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT product_id, url FROM watchlist ORDER BY product_id ASC")?;

        let rows = stmt.query_map([], |row| {
            Ok(WatchEntry {
                product_id: ProductId(row.get(0)?),
                url: row.get(1)?,
            })
        })?;

        collect_rows(rows)
    }

    pub fn insert_observation(&mut self, input: &ObservationInput) -> Result<Observation> {
        input
            .validate()
            .map_err(|err| anyhow!("observation validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start observation transaction")?;

        tx.execute(
            "INSERT INTO observations(product_id, title, rating, price, url, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.product_id.0,
                input.title,
                input.rating,
                input.price,
                input.url,
                format_rfc3339(input.scraped_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to append observation")?;

        let obs_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit observation")?;

        Ok(Observation {
            obs_seq,
            product_id: input.product_id,
            title: input.title.clone(),
            rating: input.rating,
            price: input.price,
            url: input.url.clone(),
            scraped_at: input.scraped_at,
        })
    }

    pub fn list_observations(&self, product_id: ProductId) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT obs_seq, product_id, title, rating, price, url, scraped_at
             FROM observations
             WHERE product_id = ?1
             ORDER BY scraped_at ASC, obs_seq ASC",
        )?;

        let rows = stmt.query_map(params![product_id.0], parse_observation_row)?;
        collect_rows(rows)
    }

    fn all_observations(&self) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT obs_seq, product_id, title, rating, price, url, scraped_at
             FROM observations
             ORDER BY product_id ASC, scraped_at ASC, obs_seq ASC",
        )?;

        let rows = stmt.query_map([], parse_observation_row)?;
        collect_rows(rows)
    }

    /// Observations for every product that still has an unresolved forecast,
    /// in a stable time order so duplicate same-day scrapes resolve
    /// last-write-wins.
    fn observations_for_unresolved(&self) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT obs_seq, product_id, title, rating, price, url, scraped_at
             FROM observations
             WHERE product_id IN (
                SELECT DISTINCT product_id FROM forecasts WHERE real_price IS NULL
             )
             ORDER BY scraped_at ASC, obs_seq ASC",
        )?;

        let rows = stmt.query_map([], parse_observation_row)?;
        collect_rows(rows)
    }

    /// Inserts a forecast unless one already exists for the same
    /// `(product_id, calendar day)`. Returns `None` when skipped.
    pub fn insert_forecast(&mut self, input: &ForecastInput) -> Result<Option<Forecast>> {
        input
            .validate()
            .map_err(|err| anyhow!("forecast validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start forecast transaction")?;

        let forecast_id = insert_forecast_checked(&tx, input)?;
        tx.commit().context("failed to commit forecast")?;

        Ok(forecast_id.map(|id| Forecast {
            forecast_id: id,
            product_id: input.product_id,
            forecast_ts: input.forecast_ts,
            predicted_price: input.predicted_price,
            real_price: None,
            price_source: None,
            features: input.features,
        }))
    }

    pub fn unresolved_forecasts(&self) -> Result<Vec<Forecast>> {
        let query = format!(
            "SELECT {FORECAST_COLUMNS}
             FROM forecasts
             WHERE real_price IS NULL
             ORDER BY product_id ASC, forecast_ts ASC, forecast_id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_forecast_row)?;
        collect_rows(rows)
    }

    pub fn forecasts_up_to(&self, as_of: OffsetDateTime) -> Result<Vec<Forecast>> {
        let query = format!(
            "SELECT {FORECAST_COLUMNS}
             FROM forecasts
             WHERE forecast_ts <= ?1
             ORDER BY product_id ASC, forecast_ts ASC, forecast_id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![format_rfc3339(as_of).map_err(|err| anyhow!(err.to_string()))?],
            parse_forecast_row,
        )?;
        collect_rows(rows)
    }

    pub fn list_forecasts(&self, product_id: ProductId) -> Result<Vec<Forecast>> {
        let query = format!(
            "SELECT {FORECAST_COLUMNS}
             FROM forecasts
             WHERE product_id = ?1
             ORDER BY forecast_ts ASC, forecast_id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![product_id.0], parse_forecast_row)?;
        collect_rows(rows)
    }

    /// Matches unresolved forecasts against observed prices by
    /// `(product_id, calendar day)` and writes the observed price into each
    /// match. One transaction: either every matched row commits or none do.
    pub fn reconcile(&mut self) -> Result<ReconcileReport> {
        let unresolved = self.unresolved_forecasts()?;
        if unresolved.is_empty() {
            info!("no unresolved forecasts, nothing to reconcile");
            return Ok(ReconcileReport {
                unresolved: 0,
                observations_read: 0,
                matched: 0,
            });
        }

        let observations = self.observations_for_unresolved()?;
        let prices = observed_prices_by_day(&observations);
        let matches = match_observed_prices(&unresolved, &prices);

        let tx = self
            .conn
            .transaction()
            .context("failed to start reconcile transaction")?;

        for matched in &matches {
            tx.execute(
                "UPDATE forecasts SET real_price = ?1, price_source = ?2 WHERE forecast_id = ?3",
                params![
                    matched.price,
                    PriceSource::Observed.as_str(),
                    matched.forecast_id
                ],
            )
            .context("failed to write reconciled price")?;
        }

        tx.commit().context("failed to commit reconcile batch")?;

        let report = ReconcileReport {
            unresolved: unresolved.len(),
            observations_read: observations.len(),
            matched: matches.len(),
        };
        info!(
            unresolved = report.unresolved,
            matched = report.matched,
            "reconciled forecasts against observations"
        );
        Ok(report)
    }

    /// Resolves every remaining `real_price` gap over the snapshot of
    /// forecasts up to `as_of`: interior gaps are interpolated, unbounded
    /// ones fall back to the predicted price, and the whole resolved
    /// snapshot is written back in one transaction.
    pub fn fill_price_gaps(&mut self, as_of: OffsetDateTime) -> Result<FillReport> {
        let snapshot = self.forecasts_up_to(as_of)?;
        if snapshot.is_empty() {
            info!("no forecasts due yet, nothing to fill");
            return Ok(FillReport {
                snapshot_rows: 0,
                rewritten: 0,
                interpolated: 0,
                fallback: 0,
            });
        }

        let previous: BTreeMap<i64, Option<f64>> = snapshot
            .iter()
            .map(|forecast| (forecast.forecast_id, forecast.real_price))
            .collect();
        let resolved = resolve_price_gaps(&snapshot);

        let tx = self
            .conn
            .transaction()
            .context("failed to start gap-fill transaction")?;

        let mut interpolated = 0;
        let mut fallback = 0;
        for row in &resolved {
            if previous.get(&row.forecast_id) == Some(&None) {
                match row.source {
                    PriceSource::Interpolated => interpolated += 1,
                    PriceSource::Predicted => fallback += 1,
                    PriceSource::Observed => {}
                }
            }

            tx.execute(
                "UPDATE forecasts SET real_price = ?1, price_source = ?2 WHERE forecast_id = ?3",
                params![row.price, row.source.as_str(), row.forecast_id],
            )
            .context("failed to write resolved price")?;
        }

        tx.commit().context("failed to commit gap-fill batch")?;

        let report = FillReport {
            snapshot_rows: snapshot.len(),
            rewritten: resolved.len(),
            interpolated,
            fallback,
        };
        info!(
            rewritten = report.rewritten,
            interpolated = report.interpolated,
            fallback = report.fallback,
            "filled forecast price gaps"
        );
        Ok(report)
    }

    /// Recomputes per-product accuracy over all reconciled forecasts and
    /// overwrites each product's metric row.
    pub fn evaluate(&mut self) -> Result<EvaluateReport> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, real_price, predicted_price
             FROM forecasts
             WHERE real_price IS NOT NULL
             ORDER BY product_id ASC, forecast_ts ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                ProductId(row.get(0)?),
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let pairs: Vec<(ProductId, f64, f64)> = collect_rows(rows)?;
        drop(stmt);

        if pairs.is_empty() {
            info!("no reconciled forecasts, nothing to evaluate");
            return Ok(EvaluateReport {
                pairs: 0,
                products: 0,
            });
        }

        let mut grouped: BTreeMap<ProductId, Vec<(f64, f64)>> = BTreeMap::new();
        for (product_id, real, predicted) in &pairs {
            grouped
                .entry(*product_id)
                .or_default()
                .push((*real, *predicted));
        }

        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start evaluate transaction")?;

        for (product_id, residuals) in &grouped {
            let metric = ErrorMetric {
                product_id: *product_id,
                mae: mean_absolute_error(residuals),
                rmse: root_mean_squared_error(residuals),
                updated_at: now,
            };
            upsert_error_metric(&tx, &metric)?;
        }

        tx.commit().context("failed to commit evaluate batch")?;

        let report = EvaluateReport {
            pairs: pairs.len(),
            products: grouped.len(),
        };
        info!(
            pairs = report.pairs,
            products = report.products,
            "evaluated model accuracy"
        );
        Ok(report)
    }

    pub fn error_metric(&self, product_id: ProductId) -> Result<Option<ErrorMetric>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, mae, rmse, updated_at
             FROM model_errors
             WHERE product_id = ?1",
        )?;

        let row = stmt
            .query_row(params![product_id.0], |row| {
                let updated_at =
                    parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?;
                Ok(ErrorMetric {
                    product_id: ProductId(row.get(0)?),
                    mae: row.get(1)?,
                    rmse: row.get(2)?,
                    updated_at,
                })
            })
            .optional()?;

        Ok(row)
    }

    /// Joins forecasts, observations, and error metrics over the inclusive
    /// day window into one fact row per `(product_id, day)`. Duplicate rows
    /// on either side collapse through `MAX`, and re-running the same window
    /// upserts instead of duplicating.
    pub fn aggregate(&mut self, window_start: Date, window_end: Date) -> Result<AggregateReport> {
        if window_end < window_start {
            return Err(anyhow!("aggregation window end precedes its start"));
        }

        let start = format_calendar_day(window_start).map_err(|err| anyhow!(err.to_string()))?;
        let end = format_calendar_day(window_end).map_err(|err| anyhow!(err.to_string()))?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start aggregate transaction")?;

        let rows = tx
            .execute(
                "INSERT INTO fact_prices(
                    product_id, day, real_price, predicted_price,
                    day_of_month, month, day_of_week, days_since_start,
                    rating, moving_avg_3, moving_avg_7, mae, rmse, aggregated_at
                 )
                 SELECT
                    f.product_id,
                    date(f.forecast_ts) AS day,
                    COALESCE(MAX(f.real_price), MAX(o.price)) AS real_price,
                    MAX(f.predicted_price) AS predicted_price,
                    MAX(f.day_of_month) AS day_of_month,
                    MAX(f.month) AS month,
                    MAX(f.day_of_week) AS day_of_week,
                    MAX(f.days_since_start) AS days_since_start,
                    COALESCE(MAX(f.rating), MAX(o.rating)) AS rating,
                    MAX(f.moving_avg_3) AS moving_avg_3,
                    MAX(f.moving_avg_7) AS moving_avg_7,
                    MAX(e.mae) AS mae,
                    MAX(e.rmse) AS rmse,
                    ?3
                 FROM forecasts f
                 LEFT JOIN observations o
                   ON o.product_id = f.product_id
                  AND date(o.scraped_at) = date(f.forecast_ts)
                 LEFT JOIN model_errors e
                   ON e.product_id = f.product_id
                 WHERE date(f.forecast_ts) BETWEEN ?1 AND ?2
                 GROUP BY f.product_id, date(f.forecast_ts)
                 ON CONFLICT(product_id, day) DO UPDATE SET
                    real_price = excluded.real_price,
                    predicted_price = excluded.predicted_price,
                    day_of_month = excluded.day_of_month,
                    month = excluded.month,
                    day_of_week = excluded.day_of_week,
                    days_since_start = excluded.days_since_start,
                    rating = excluded.rating,
                    moving_avg_3 = excluded.moving_avg_3,
                    moving_avg_7 = excluded.moving_avg_7,
                    mae = excluded.mae,
                    rmse = excluded.rmse,
                    aggregated_at = excluded.aggregated_at",
                params![start, end, now],
            )
            .context("failed to aggregate fact rows")?;

        tx.commit().context("failed to commit aggregate batch")?;

        if rows == 0 {
            info!(%start, %end, "no forecasts in aggregation window");
        } else {
            info!(%start, %end, rows, "aggregated fact rows");
        }

        Ok(AggregateReport { rows })
    }

    pub fn fact_rows(&self, window_start: Date, window_end: Date) -> Result<Vec<FactRow>> {
        let start = format_calendar_day(window_start).map_err(|err| anyhow!(err.to_string()))?;
        let end = format_calendar_day(window_end).map_err(|err| anyhow!(err.to_string()))?;

        let mut stmt = self.conn.prepare(
            "SELECT product_id, day, real_price, predicted_price,
                    day_of_month, month, day_of_week, days_since_start,
                    rating, moving_avg_3, moving_avg_7, mae, rmse, aggregated_at
             FROM fact_prices
             WHERE day BETWEEN ?1 AND ?2
             ORDER BY product_id ASC, day ASC",
        )?;

        let rows = stmt.query_map(params![start, end], parse_fact_row)?;
        collect_rows(rows)
    }

    /// Produces forecasts for the `horizon` days after each product's last
    /// observation, seeding that product's metric row from in-sample
    /// residuals. Days that already have a forecast are skipped, so the run
    /// is idempotent per `(product_id, day)`.
    pub fn run_forecast(
        &mut self,
        regressor: &dyn Regressor,
        horizon: u32,
    ) -> Result<ForecastReport> {
        let observations = self.all_observations()?;
        if observations.is_empty() {
            info!("no observations recorded, nothing to forecast");
            return Ok(ForecastReport {
                products: 0,
                inserted: 0,
                skipped: 0,
            });
        }

        let series_start = observations
            .iter()
            .map(|obs| obs.scraped_at)
            .min()
            .ok_or_else(|| anyhow!("observation series has no start"))?;

        let mut grouped: BTreeMap<ProductId, Vec<Observation>> = BTreeMap::new();
        for obs in observations {
            grouped.entry(obs.product_id).or_default().push(obs);
        }

        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start forecast transaction")?;

        let mut inserted = 0;
        let mut skipped = 0;
        for (product_id, group) in &grouped {
            let rows = training_rows(group, series_start);
            let model = regressor
                .fit(&rows)
                .map_err(|err| anyhow!("failed to fit model for product {product_id}: {err}"))?;

            let in_sample: Vec<f64> = model.predict(
                &rows
                    .iter()
                    .map(|(features, _)| *features)
                    .collect::<Vec<FeatureSnapshot>>(),
            );
            let residuals: Vec<(f64, f64)> = rows
                .iter()
                .zip(&in_sample)
                .map(|((_, price), predicted)| (*price, *predicted))
                .collect();
            upsert_error_metric(
                &tx,
                &ErrorMetric {
                    product_id: *product_id,
                    mae: mean_absolute_error(&residuals),
                    rmse: root_mean_squared_error(&residuals),
                    updated_at: now,
                },
            )?;

            let future = horizon_features(group, series_start, horizon);
            let features: Vec<FeatureSnapshot> =
                future.iter().map(|(_, features)| *features).collect();
            let predictions = model.predict(&features);

            for ((day, features), predicted_price) in future.iter().zip(predictions) {
                let midnight = day
                    .midnight()
                    .assume_offset(time::UtcOffset::UTC);
                let input = ForecastInput {
                    product_id: *product_id,
                    forecast_ts: midnight,
                    predicted_price,
                    features: *features,
                };
                input
                    .validate()
                    .map_err(|err| anyhow!("forecast validation failed: {err}"))?;

                if insert_forecast_checked(&tx, &input)?.is_some() {
                    inserted += 1;
                } else {
                    skipped += 1;
                }
            }
        }

        tx.commit().context("failed to commit forecast batch")?;

        let report = ForecastReport {
            products: grouped.len(),
            inserted,
            skipped,
        };
        info!(
            products = report.products,
            inserted = report.inserted,
            skipped = report.skipped,
            "produced forecasts"
        );
        Ok(report)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Inserts a forecast row unless `(product_id, day)` already has one.
fn insert_forecast_checked(conn: &Connection, input: &ForecastInput) -> Result<Option<i64>> {
    let day = format_calendar_day(pricewatch_core::to_calendar_day(input.forecast_ts))
        .map_err(|err| anyhow!(err.to_string()))?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT forecast_id FROM forecasts
             WHERE product_id = ?1 AND date(forecast_ts) = ?2
             LIMIT 1",
            params![input.product_id.0, day],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check for an existing forecast")?;

    if existing.is_some() {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO forecasts(
            product_id, forecast_ts, predicted_price, real_price, price_source,
            day_of_month, month, day_of_week, days_since_start,
            rating, moving_avg_3, moving_avg_7
         ) VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.product_id.0,
            format_rfc3339(input.forecast_ts).map_err(|err| anyhow!(err.to_string()))?,
            input.predicted_price,
            i64::from(input.features.day_of_month),
            i64::from(input.features.month),
            i64::from(input.features.day_of_week),
            input.features.days_since_start,
            input.features.rating,
            input.features.moving_avg_3,
            input.features.moving_avg_7,
        ],
    )
    .context("failed to insert forecast")?;

    Ok(Some(conn.last_insert_rowid()))
}

fn upsert_error_metric(conn: &Connection, metric: &ErrorMetric) -> Result<()> {
    conn.execute(
        "INSERT INTO model_errors(product_id, mae, rmse, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(product_id) DO UPDATE SET
           mae = excluded.mae,
           rmse = excluded.rmse,
           updated_at = excluded.updated_at",
        params![
            metric.product_id.0,
            metric.mae,
            metric.rmse,
            format_rfc3339(metric.updated_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .context("failed to upsert error metric")?;

    Ok(())
}

fn parse_observation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Observation> {
    let scraped_at = parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(to_sql_error)?;

    Ok(Observation {
        obs_seq: row.get(0)?,
        product_id: ProductId(row.get(1)?),
        title: row.get(2)?,
        rating: row.get(3)?,
        price: row.get(4)?,
        url: row.get(5)?,
        scraped_at,
    })
}

fn parse_forecast_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Forecast> {
    let forecast_ts = parse_rfc3339_utc(&row.get::<_, String>(2)?).map_err(to_sql_error)?;

    let price_source = row
        .get::<_, Option<String>>(5)?
        .as_deref()
        .map(|raw| {
            PriceSource::parse(raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid price_source: {raw}"),
                    )),
                )
            })
        })
        .transpose()?;

    Ok(Forecast {
        forecast_id: row.get(0)?,
        product_id: ProductId(row.get(1)?),
        forecast_ts,
        predicted_price: row.get(3)?,
        real_price: row.get(4)?,
        price_source,
        features: FeatureSnapshot {
            day_of_month: parse_u8_column(row, 6)?,
            month: parse_u8_column(row, 7)?,
            day_of_week: parse_u8_column(row, 8)?,
            days_since_start: row.get(9)?,
            rating: row.get(10)?,
            moving_avg_3: row.get(11)?,
            moving_avg_7: row.get(12)?,
        },
    })
}

fn parse_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FactRow> {
    let day = parse_calendar_day(&row.get::<_, String>(1)?).map_err(to_sql_error)?;
    let aggregated_at = parse_rfc3339_utc(&row.get::<_, String>(13)?).map_err(to_sql_error)?;

    Ok(FactRow {
        product_id: ProductId(row.get(0)?),
        day,
        real_price: row.get(2)?,
        predicted_price: row.get(3)?,
        day_of_month: parse_optional_u8_column(row, 4)?,
        month: parse_optional_u8_column(row, 5)?,
        day_of_week: parse_optional_u8_column(row, 6)?,
        days_since_start: row.get(7)?,
        rating: row.get(8)?,
        moving_avg_3: row.get(9)?,
        moving_avg_7: row.get(10)?,
        mae: row.get(11)?,
        rmse: row.get(12)?,
        aggregated_at,
    })
}

fn parse_u8_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u8> {
    let value: i64 = row.get(index)?;
    u8::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("column value out of range: {value}"),
            )),
        )
    })
}

fn parse_optional_u8_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<u8>> {
    match row.get::<_, Option<i64>>(index)? {
        None => Ok(None),
        Some(value) => u8::try_from(value).map(Some).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("column value out of range: {value}"),
                )),
            )
        }),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: pricewatch_core::PriceError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
