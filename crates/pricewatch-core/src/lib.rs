use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PriceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("model error: {0}")]
    Model(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProductId(pub i64);

impl Display for ProductId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconciliation key: a product on a calendar day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DayKey {
    pub product_id: ProductId,
    pub day: Date,
}

impl Display for DayKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.product_id, self.day)
    }
}

/// How a forecast's `real_price` was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Observed,
    Interpolated,
    Predicted,
}

impl PriceSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Interpolated => "interpolated",
            Self::Predicted => "predicted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observed" => Some(Self::Observed),
            "interpolated" => Some(Self::Interpolated),
            "predicted" => Some(Self::Predicted),
            _ => None,
        }
    }
}

/// One scraped price/rating reading. Append-only once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub obs_seq: i64,
    pub product_id: ProductId,
    pub title: String,
    pub rating: Option<f64>,
    pub price: f64,
    pub url: String,
    pub scraped_at: OffsetDateTime,
}

impl Observation {
    #[must_use]
    pub fn day(&self) -> Date {
        to_calendar_day(self.scraped_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationInput {
    pub product_id: ProductId,
    pub title: String,
    pub rating: Option<f64>,
    pub price: f64,
    pub url: String,
    pub scraped_at: OffsetDateTime,
}

impl ObservationInput {
    /// Validates a scraped reading before it is appended.
    ///
    /// # Errors
    /// Returns [`PriceError::Validation`] when a field is missing, not
    /// finite, or outside its allowed range.
    pub fn validate(&self) -> Result<(), PriceError> {
        if self.title.trim().is_empty() {
            return Err(PriceError::Validation(
                "title MUST be provided for every observation".to_string(),
            ));
        }

        if self.url.trim().is_empty() {
            return Err(PriceError::Validation(
                "url MUST be provided for every observation".to_string(),
            ));
        }

        if !self.price.is_finite() || self.price < 0.0 {
            return Err(PriceError::Validation(
                "price MUST be finite and >= 0".to_string(),
            ));
        }

        if let Some(rating) = self.rating {
            if !rating.is_finite() || !(0.0..=5.0).contains(&rating) {
                return Err(PriceError::Validation(
                    "rating MUST be in [0.0, 5.0]".to_string(),
                ));
            }
        }

        if self.scraped_at.offset() != UtcOffset::UTC {
            return Err(PriceError::Validation(
                "scraped_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Model inputs captured alongside each forecast row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureSnapshot {
    pub day_of_month: u8,
    pub month: u8,
    /// Monday = 0 through Sunday = 6.
    pub day_of_week: u8,
    pub days_since_start: i64,
    pub rating: f64,
    pub moving_avg_3: f64,
    pub moving_avg_7: f64,
}

impl FeatureSnapshot {
    /// # Errors
    /// Returns [`PriceError::Validation`] when a field is outside its
    /// calendar range or not finite.
    pub fn validate(&self) -> Result<(), PriceError> {
        if !(1..=31).contains(&self.day_of_month) {
            return Err(PriceError::Validation(
                "day_of_month MUST be in [1, 31]".to_string(),
            ));
        }

        if !(1..=12).contains(&self.month) {
            return Err(PriceError::Validation(
                "month MUST be in [1, 12]".to_string(),
            ));
        }

        if self.day_of_week > 6 {
            return Err(PriceError::Validation(
                "day_of_week MUST be in [0, 6]".to_string(),
            ));
        }

        for (name, value) in [
            ("rating", self.rating),
            ("moving_avg_3", self.moving_avg_3),
            ("moving_avg_7", self.moving_avg_7),
        ] {
            if !value.is_finite() {
                return Err(PriceError::Validation(format!("{name} MUST be finite")));
            }
        }

        Ok(())
    }
}

/// A model-predicted price for one product/day, annotated with the observed
/// price once reconciled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub forecast_id: i64,
    pub product_id: ProductId,
    pub forecast_ts: OffsetDateTime,
    pub predicted_price: f64,
    pub real_price: Option<f64>,
    pub price_source: Option<PriceSource>,
    pub features: FeatureSnapshot,
}

impl Forecast {
    #[must_use]
    pub fn day(&self) -> Date {
        to_calendar_day(self.forecast_ts)
    }

    #[must_use]
    pub fn day_key(&self) -> DayKey {
        DayKey {
            product_id: self.product_id,
            day: self.day(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastInput {
    pub product_id: ProductId,
    pub forecast_ts: OffsetDateTime,
    pub predicted_price: f64,
    pub features: FeatureSnapshot,
}

impl ForecastInput {
    /// # Errors
    /// Returns [`PriceError::Validation`] when the prediction is not finite,
    /// the timestamp is not UTC, or the feature snapshot is invalid.
    pub fn validate(&self) -> Result<(), PriceError> {
        if !self.predicted_price.is_finite() {
            return Err(PriceError::Validation(
                "predicted_price MUST be finite".to_string(),
            ));
        }

        if self.forecast_ts.offset() != UtcOffset::UTC {
            return Err(PriceError::Validation(
                "forecast_ts MUST be UTC (offset Z)".to_string(),
            ));
        }

        self.features.validate()
    }
}

/// Per-product model accuracy, overwritten on every evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMetric {
    pub product_id: ProductId,
    pub mae: f64,
    pub rmse: f64,
    pub updated_at: OffsetDateTime,
}

/// Denormalized reporting row for one product/day. Columns are nullable
/// because the joins feeding them tolerate missing counterparts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactRow {
    pub product_id: ProductId,
    pub day: Date,
    pub real_price: Option<f64>,
    pub predicted_price: Option<f64>,
    pub day_of_month: Option<u8>,
    pub month: Option<u8>,
    pub day_of_week: Option<u8>,
    pub days_since_start: Option<i64>,
    pub rating: Option<f64>,
    pub moving_avg_3: Option<f64>,
    pub moving_avg_7: Option<f64>,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub aggregated_at: OffsetDateTime,
}

/// Truncates a timestamp to its UTC calendar day, independent of the
/// time of day and of the offset it was carried with.
#[must_use]
pub fn to_calendar_day(ts: OffsetDateTime) -> Date {
    ts.to_offset(UtcOffset::UTC).date()
}

/// Builds the observed-price lookup for reconciliation.
///
/// When several observations share a `(product_id, day)` key, the one with
/// the latest `scraped_at` wins, ties broken by `obs_seq`, so the result is
/// deterministic regardless of input order.
#[must_use]
pub fn observed_prices_by_day(observations: &[Observation]) -> BTreeMap<DayKey, f64> {
    let mut ordered: Vec<&Observation> = observations.iter().collect();
    ordered.sort_by_key(|obs| (obs.scraped_at, obs.obs_seq));

    let mut prices = BTreeMap::new();
    for obs in ordered {
        let key = DayKey {
            product_id: obs.product_id,
            day: obs.day(),
        };
        prices.insert(key, obs.price);
    }

    prices
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceMatch {
    pub forecast_id: i64,
    pub price: f64,
}

/// Pairs unresolved forecasts with observed prices by `(product_id, day)`.
/// Forecasts without a matching observation are left for a later pass.
#[must_use]
pub fn match_observed_prices(
    unresolved: &[Forecast],
    prices: &BTreeMap<DayKey, f64>,
) -> Vec<PriceMatch> {
    unresolved
        .iter()
        .filter(|forecast| forecast.real_price.is_none())
        .filter_map(|forecast| {
            prices.get(&forecast.day_key()).map(|price| PriceMatch {
                forecast_id: forecast.forecast_id,
                price: *price,
            })
        })
        .collect()
}

/// Linearly interpolates interior gaps of a sequence, positionally.
///
/// A run of `None` bounded by known values on both sides is filled with
/// equal steps between the bounds. Leading and trailing gaps have no bound
/// on one side and stay `None`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn interpolate_gaps(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut filled: Vec<Option<f64>> = values.to_vec();
    let known: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(index, value)| value.map(|_| index))
        .collect();

    for bounds in known.windows(2) {
        let (start, end) = (bounds[0], bounds[1]);
        let (Some(base), Some(target)) = (values[start], values[end]) else {
            continue;
        };

        let step = (target - base) / (end - start) as f64;
        for offset in 1..(end - start) {
            filled[start + offset] = Some(base + step * offset as f64);
        }
    }

    filled
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrice {
    pub forecast_id: i64,
    pub price: f64,
    pub source: PriceSource,
}

/// Resolves `real_price` for every row of a forecast snapshot.
///
/// Duplicates per `(product_id, day)` collapse to the lowest `forecast_id`.
/// The survivors are sorted by `(product_id, day)`; interior gaps in each
/// product's sequence are linearly interpolated, and rows still missing a
/// value (no bound on one side) fall back to their own predicted price.
/// Rows that already carried a value keep it, so re-running the pass
/// recomputes the same output.
#[must_use]
pub fn resolve_price_gaps(snapshot: &[Forecast]) -> Vec<ResolvedPrice> {
    let mut rows: Vec<&Forecast> = snapshot.iter().collect();
    rows.sort_by_key(|forecast| (forecast.product_id, forecast.day(), forecast.forecast_id));
    rows.dedup_by_key(|forecast| (forecast.product_id, forecast.day()));

    let mut resolved = Vec::with_capacity(rows.len());
    let mut cursor = 0;
    while cursor < rows.len() {
        let product_id = rows[cursor].product_id;
        let mut end = cursor;
        while end < rows.len() && rows[end].product_id == product_id {
            end += 1;
        }

        let group = &rows[cursor..end];
        let known: Vec<Option<f64>> = group.iter().map(|forecast| forecast.real_price).collect();
        let filled = interpolate_gaps(&known);

        for (forecast, value) in group.iter().zip(filled) {
            let (price, source) = match (forecast.real_price, value) {
                (Some(existing), _) => (
                    existing,
                    forecast.price_source.unwrap_or(PriceSource::Observed),
                ),
                (None, Some(interpolated)) => (interpolated, PriceSource::Interpolated),
                (None, None) => (forecast.predicted_price, PriceSource::Predicted),
            };

            resolved.push(ResolvedPrice {
                forecast_id: forecast.forecast_id,
                price,
                source,
            });
        }

        cursor = end;
    }

    resolved
}

/// Mean absolute error over `(real, predicted)` pairs. Zero for no pairs.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_absolute_error(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }

    let total: f64 = pairs
        .iter()
        .map(|(real, predicted)| (real - predicted).abs())
        .sum();
    total / pairs.len() as f64
}

/// Root-mean-squared error over `(real, predicted)` pairs. Zero for no pairs.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn root_mean_squared_error(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }

    let total: f64 = pairs
        .iter()
        .map(|(real, predicted)| (real - predicted) * (real - predicted))
        .sum();
    (total / pairs.len() as f64).sqrt()
}

/// Rolling mean with the given window, minimum one sample: entry `i`
/// averages the last `window` values up to and including `values[i]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let mut means = Vec::with_capacity(values.len());
    for index in 0..values.len() {
        let start = (index + 1).saturating_sub(window);
        let span = &values[start..=index];
        let sum: f64 = span.iter().sum();
        means.push(sum / span.len() as f64);
    }
    means
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn fallback_rating(group: &[Observation]) -> f64 {
    let known: Vec<f64> = group.iter().filter_map(|obs| obs.rating).collect();
    mean(&known)
}

fn snapshot_for(
    ts: OffsetDateTime,
    series_start: OffsetDateTime,
    rating: f64,
    moving_avg_3: f64,
    moving_avg_7: f64,
) -> FeatureSnapshot {
    let date = to_calendar_day(ts);
    FeatureSnapshot {
        day_of_month: date.day(),
        month: u8::from(date.month()),
        day_of_week: date.weekday().number_days_from_monday(),
        days_since_start: (ts - series_start).whole_days(),
        rating,
        moving_avg_3,
        moving_avg_7,
    }
}

/// Builds one training row per observation of a product's history.
///
/// `group` must be ordered by `scraped_at`; `series_start` is the earliest
/// observation timestamp across *all* products, so `days_since_start` is
/// comparable between them. Observations without a rating use the product's
/// mean rating.
#[must_use]
pub fn training_rows(
    group: &[Observation],
    series_start: OffsetDateTime,
) -> Vec<(FeatureSnapshot, f64)> {
    let fallback = fallback_rating(group);
    let prices: Vec<f64> = group.iter().map(|obs| obs.price).collect();
    let moving_avg_3 = rolling_mean(&prices, 3);
    let moving_avg_7 = rolling_mean(&prices, 7);

    group
        .iter()
        .enumerate()
        .map(|(index, obs)| {
            let features = snapshot_for(
                obs.scraped_at,
                series_start,
                obs.rating.unwrap_or(fallback),
                moving_avg_3[index],
                moving_avg_7[index],
            );
            (features, obs.price)
        })
        .collect()
}

/// Builds feature rows for the `horizon` days after a product's last
/// observation: rating and moving averages are frozen at their trailing
/// values, temporal parts come from each future date.
#[must_use]
pub fn horizon_features(
    group: &[Observation],
    series_start: OffsetDateTime,
    horizon: u32,
) -> Vec<(Date, FeatureSnapshot)> {
    let Some(last) = group.last() else {
        return Vec::new();
    };

    let rating = fallback_rating(group);
    let prices: Vec<f64> = group.iter().map(|obs| obs.price).collect();
    let tail_3 = mean(&prices[prices.len().saturating_sub(3)..]);
    let tail_7 = mean(&prices[prices.len().saturating_sub(7)..]);

    (1..=i64::from(horizon))
        .map(|offset| {
            let ts = last.scraped_at + Duration::days(offset);
            let features = snapshot_for(ts, series_start, rating, tail_3, tail_7);
            (to_calendar_day(ts), features)
        })
        .collect()
}

/// Fits feature rows to their target prices.
pub trait Regressor {
    /// # Errors
    /// Returns [`PriceError::Model`] when the training set cannot be fit.
    fn fit(&self, rows: &[(FeatureSnapshot, f64)]) -> Result<Box<dyn PriceModel>, PriceError>;
}

/// A fitted model producing one predicted price per feature row.
pub trait PriceModel {
    fn predict(&self, features: &[FeatureSnapshot]) -> Vec<f64>;
}

/// Least-squares linear trend of price over `days_since_start`. Degenerate
/// groups (a single day of history) collapse to the mean price.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrendRegressor;

#[derive(Debug, Clone, Copy)]
struct TrendModel {
    slope: f64,
    intercept: f64,
}

impl Regressor for TrendRegressor {
    #[allow(clippy::cast_precision_loss)]
    fn fit(&self, rows: &[(FeatureSnapshot, f64)]) -> Result<Box<dyn PriceModel>, PriceError> {
        if rows.is_empty() {
            return Err(PriceError::Model(
                "cannot fit a trend on an empty training set".to_string(),
            ));
        }

        let count = rows.len() as f64;
        let mean_day = rows
            .iter()
            .map(|(features, _)| features.days_since_start as f64)
            .sum::<f64>()
            / count;
        let mean_price = rows.iter().map(|(_, price)| price).sum::<f64>() / count;

        let mut day_variance = 0.0;
        let mut covariance = 0.0;
        for (features, price) in rows {
            let day_delta = features.days_since_start as f64 - mean_day;
            day_variance += day_delta * day_delta;
            covariance += day_delta * (price - mean_price);
        }

        let slope = if day_variance > f64::EPSILON {
            covariance / day_variance
        } else {
            0.0
        };

        Ok(Box::new(TrendModel {
            slope,
            intercept: mean_price - slope * mean_day,
        }))
    }
}

impl PriceModel for TrendModel {
    #[allow(clippy::cast_precision_loss)]
    fn predict(&self, features: &[FeatureSnapshot]) -> Vec<f64> {
        features
            .iter()
            .map(|snapshot| self.intercept + self.slope * snapshot.days_since_start as f64)
            .collect()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PriceError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PriceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PriceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PriceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PriceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PriceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| PriceError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// # Errors
/// Returns [`PriceError::Validation`] when the value is not `YYYY-MM-DD`.
pub fn parse_calendar_day(value: &str) -> Result<Date, PriceError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| PriceError::Validation(format!("invalid calendar day: {err}")))
}

/// # Errors
/// Returns [`PriceError::Validation`] when formatting fails.
pub fn format_calendar_day(value: Date) -> Result<String, PriceError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| PriceError::Validation(format!("failed to format calendar day: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use time::macros::{date, datetime};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_observation(
        obs_seq: i64,
        product_id: i64,
        scraped_at: OffsetDateTime,
        price: f64,
    ) -> Observation {
        Observation {
            obs_seq,
            product_id: ProductId(product_id),
            title: "Widget".to_string(),
            rating: Some(4.5),
            price,
            url: "https://shop.example/widget".to_string(),
            scraped_at,
        }
    }

    fn fixture_features() -> FeatureSnapshot {
        FeatureSnapshot {
            day_of_month: 1,
            month: 1,
            day_of_week: 0,
            days_since_start: 0,
            rating: 4.5,
            moving_avg_3: 50.0,
            moving_avg_7: 50.0,
        }
    }

    fn fixture_forecast(
        forecast_id: i64,
        product_id: i64,
        forecast_ts: OffsetDateTime,
        predicted_price: f64,
        real_price: Option<f64>,
    ) -> Forecast {
        Forecast {
            forecast_id,
            product_id: ProductId(product_id),
            forecast_ts,
            predicted_price,
            real_price,
            price_source: real_price.map(|_| PriceSource::Observed),
            features: fixture_features(),
        }
    }

    #[test]
    fn calendar_day_ignores_time_of_day_and_offset() {
        let morning = datetime!(2024-01-01 06:10:00 UTC);
        let night = datetime!(2024-01-01 23:55:00 UTC);
        assert_eq!(to_calendar_day(morning), date!(2024 - 01 - 01));
        assert_eq!(to_calendar_day(morning), to_calendar_day(night));

        // Same instant expressed with a non-UTC offset lands on the UTC day.
        let offset = datetime!(2024-01-02 03:30:00 +05:00);
        assert_eq!(to_calendar_day(offset), date!(2024 - 01 - 01));
    }

    #[test]
    fn duplicate_same_day_observations_resolve_last_write_wins() {
        let observations = vec![
            fixture_observation(2, 7, datetime!(2024-01-01 18:00:00 UTC), 52.0),
            fixture_observation(1, 7, datetime!(2024-01-01 06:00:00 UTC), 49.0),
        ];

        let prices = observed_prices_by_day(&observations);
        let key = DayKey {
            product_id: ProductId(7),
            day: date!(2024 - 01 - 01),
        };
        assert_eq!(prices.get(&key), Some(&52.0));
    }

    #[test]
    fn same_timestamp_duplicates_break_ties_by_sequence() {
        let observations = vec![
            fixture_observation(9, 7, datetime!(2024-01-01 06:00:00 UTC), 51.0),
            fixture_observation(3, 7, datetime!(2024-01-01 06:00:00 UTC), 48.0),
        ];

        let prices = observed_prices_by_day(&observations);
        let key = DayKey {
            product_id: ProductId(7),
            day: date!(2024 - 01 - 01),
        };
        assert_eq!(prices.get(&key), Some(&51.0));
    }

    #[test]
    fn matching_pairs_forecasts_with_same_day_prices() {
        let observations = vec![fixture_observation(
            1,
            7,
            datetime!(2024-01-01 06:00:00 UTC),
            49.99,
        )];
        let prices = observed_prices_by_day(&observations);

        let unresolved = vec![
            fixture_forecast(1, 7, datetime!(2024-01-01 00:00:00 UTC), 51.20, None),
            fixture_forecast(2, 7, datetime!(2024-01-02 00:00:00 UTC), 51.80, None),
            fixture_forecast(3, 8, datetime!(2024-01-01 00:00:00 UTC), 12.00, None),
        ];

        let matches = match_observed_prices(&unresolved, &prices);
        assert_eq!(
            matches,
            vec![PriceMatch {
                forecast_id: 1,
                price: 49.99
            }]
        );
    }

    #[test]
    fn interpolation_fills_interior_gaps_linearly() {
        let filled = interpolate_gaps(&[Some(10.0), None, None, Some(16.0)]);
        assert_eq!(filled, vec![Some(10.0), Some(12.0), Some(14.0), Some(16.0)]);
    }

    #[test]
    fn interpolation_leaves_unbounded_edges_empty() {
        let filled = interpolate_gaps(&[None, Some(10.0), Some(12.0), None]);
        assert_eq!(filled, vec![None, Some(10.0), Some(12.0), None]);

        let all_empty = interpolate_gaps(&[None, None]);
        assert_eq!(all_empty, vec![None, None]);
    }

    #[test]
    fn gap_resolution_interpolates_then_falls_back_to_predicted() {
        let snapshot = vec![
            fixture_forecast(1, 7, datetime!(2024-01-01 00:00:00 UTC), 9.0, Some(10.0)),
            fixture_forecast(2, 7, datetime!(2024-01-02 00:00:00 UTC), 11.0, None),
            fixture_forecast(3, 7, datetime!(2024-01-03 00:00:00 UTC), 15.0, Some(16.0)),
            fixture_forecast(4, 7, datetime!(2024-01-04 00:00:00 UTC), 17.5, None),
        ];

        let resolved = resolve_price_gaps(&snapshot);
        assert_eq!(
            resolved,
            vec![
                ResolvedPrice {
                    forecast_id: 1,
                    price: 10.0,
                    source: PriceSource::Observed
                },
                ResolvedPrice {
                    forecast_id: 2,
                    price: 13.0,
                    source: PriceSource::Interpolated
                },
                ResolvedPrice {
                    forecast_id: 3,
                    price: 16.0,
                    source: PriceSource::Observed
                },
                ResolvedPrice {
                    forecast_id: 4,
                    price: 17.5,
                    source: PriceSource::Predicted
                },
            ]
        );
    }

    #[test]
    fn gap_resolution_without_left_bound_uses_predicted() {
        let snapshot = vec![
            fixture_forecast(1, 7, datetime!(2024-01-01 00:00:00 UTC), 9.5, None),
            fixture_forecast(2, 7, datetime!(2024-01-02 00:00:00 UTC), 11.0, Some(10.0)),
            fixture_forecast(3, 7, datetime!(2024-01-03 00:00:00 UTC), 12.5, Some(12.0)),
        ];

        let resolved = resolve_price_gaps(&snapshot);
        assert_eq!(resolved[0].price, 9.5);
        assert_eq!(resolved[0].source, PriceSource::Predicted);
    }

    #[test]
    fn gap_resolution_collapses_duplicate_days_to_lowest_id() {
        let snapshot = vec![
            fixture_forecast(5, 7, datetime!(2024-01-01 08:00:00 UTC), 9.0, None),
            fixture_forecast(2, 7, datetime!(2024-01-01 00:00:00 UTC), 8.0, Some(10.0)),
        ];

        let resolved = resolve_price_gaps(&snapshot);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].forecast_id, 2);
        assert_eq!(resolved[0].price, 10.0);
    }

    #[test]
    fn single_pair_yields_equal_mae_and_rmse() {
        let pairs = [(100.0, 90.0)];
        assert_eq!(mean_absolute_error(&pairs), 10.0);
        assert_eq!(root_mean_squared_error(&pairs), 10.0);
    }

    #[test]
    fn symmetric_residuals_yield_equal_mae_and_rmse() {
        let pairs = [(100.0, 90.0), (100.0, 110.0)];
        assert_eq!(mean_absolute_error(&pairs), 10.0);
        assert_eq!(root_mean_squared_error(&pairs), 10.0);
    }

    #[test]
    fn metrics_match_reference_residual() {
        let pairs = [(49.99, 51.20)];
        assert!((mean_absolute_error(&pairs) - 1.21).abs() < 1e-9);
        assert!((root_mean_squared_error(&pairs) - 1.21).abs() < 1e-9);
    }

    #[test]
    fn rolling_mean_warms_up_from_one_sample() {
        let means = rolling_mean(&[3.0, 5.0, 7.0, 9.0], 3);
        assert_eq!(means, vec![3.0, 4.0, 5.0, 7.0]);
    }

    #[test]
    fn feature_rows_carry_temporal_parts_and_averages() {
        let group = vec![
            fixture_observation(1, 7, datetime!(2024-01-01 06:00:00 UTC), 10.0),
            fixture_observation(2, 7, datetime!(2024-01-02 06:00:00 UTC), 12.0),
            fixture_observation(3, 7, datetime!(2024-01-03 06:00:00 UTC), 14.0),
        ];

        let rows = training_rows(&group, datetime!(2024-01-01 06:00:00 UTC));
        assert_eq!(rows.len(), 3);

        // 2024-01-01 is a Monday.
        assert_eq!(rows[0].0.day_of_week, 0);
        assert_eq!(rows[0].0.days_since_start, 0);
        assert_eq!(rows[2].0.day_of_week, 2);
        assert_eq!(rows[2].0.days_since_start, 2);
        assert_eq!(rows[2].0.moving_avg_3, 12.0);
        assert_eq!(rows[1].0.moving_avg_7, 11.0);
        assert_eq!(rows[1].1, 12.0);
    }

    #[test]
    fn horizon_rows_freeze_trailing_averages() {
        let group = vec![
            fixture_observation(1, 7, datetime!(2024-01-01 06:00:00 UTC), 10.0),
            fixture_observation(2, 7, datetime!(2024-01-02 06:00:00 UTC), 12.0),
            fixture_observation(3, 7, datetime!(2024-01-03 06:00:00 UTC), 14.0),
        ];

        let rows = horizon_features(&group, datetime!(2024-01-01 06:00:00 UTC), 3);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, date!(2024 - 01 - 04));
        assert_eq!(rows[2].0, date!(2024 - 01 - 06));
        assert_eq!(rows[0].1.days_since_start, 3);
        assert_eq!(rows[0].1.moving_avg_3, 12.0);
        assert_eq!(rows[0].1.moving_avg_7, 12.0);

        assert!(horizon_features(&[], datetime!(2024-01-01 06:00:00 UTC), 3).is_empty());
    }

    #[test]
    fn trend_regressor_extends_a_linear_series() {
        let group = vec![
            fixture_observation(1, 7, datetime!(2024-01-01 06:00:00 UTC), 10.0),
            fixture_observation(2, 7, datetime!(2024-01-02 06:00:00 UTC), 12.0),
            fixture_observation(3, 7, datetime!(2024-01-03 06:00:00 UTC), 14.0),
        ];

        let rows = training_rows(&group, datetime!(2024-01-01 06:00:00 UTC));
        let model = must_ok(TrendRegressor.fit(&rows));

        let mut future = fixture_features();
        future.days_since_start = 3;
        let predicted = model.predict(&[future]);
        assert!((predicted[0] - 16.0).abs() < 1e-9);
    }

    #[test]
    fn trend_regressor_degenerates_to_mean_price() {
        let rows = vec![(fixture_features(), 10.0), (fixture_features(), 14.0)];
        let model = must_ok(TrendRegressor.fit(&rows));

        let predicted = model.predict(&[fixture_features()]);
        assert!((predicted[0] - 12.0).abs() < 1e-9);
    }

    #[test]
    fn trend_regressor_rejects_empty_training_set() {
        assert!(TrendRegressor.fit(&[]).is_err());
    }

    #[test]
    fn observation_validation_rejects_bad_fields() {
        let valid = ObservationInput {
            product_id: ProductId(7),
            title: "Widget".to_string(),
            rating: Some(4.5),
            price: 49.99,
            url: "https://shop.example/widget".to_string(),
            scraped_at: datetime!(2024-01-01 06:00:00 UTC),
        };
        must_ok(valid.validate());

        let mut negative_price = valid.clone();
        negative_price.price = -1.0;
        assert!(negative_price.validate().is_err());

        let mut bad_rating = valid.clone();
        bad_rating.rating = Some(6.0);
        assert!(bad_rating.validate().is_err());

        let mut blank_title = valid.clone();
        blank_title.title = "  ".to_string();
        assert!(blank_title.validate().is_err());

        let mut offset_ts = valid;
        offset_ts.scraped_at = datetime!(2024-01-01 06:00:00 +02:00);
        assert!(offset_ts.validate().is_err());
    }

    #[test]
    fn forecast_validation_checks_features() {
        let mut input = ForecastInput {
            product_id: ProductId(7),
            forecast_ts: datetime!(2024-01-01 00:00:00 UTC),
            predicted_price: 51.20,
            features: fixture_features(),
        };
        must_ok(input.validate());

        input.features.month = 13;
        assert!(input.validate().is_err());
    }

    #[test]
    fn calendar_day_round_trips_through_text() {
        let day = must_ok(parse_calendar_day("2024-01-31"));
        assert_eq!(day, date!(2024 - 01 - 31));
        assert_eq!(must_ok(format_calendar_day(day)), "2024-01-31");
        assert!(parse_calendar_day("01/31/2024").is_err());
    }

    #[test]
    fn price_source_labels_round_trip() {
        for source in [
            PriceSource::Observed,
            PriceSource::Interpolated,
            PriceSource::Predicted,
        ] {
            assert_eq!(PriceSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(PriceSource::parse("guessed"), None);
    }
}
