//! End-to-end pipeline run against an on-disk database, driving the same
//! command surface the external scheduler uses.

#![allow(clippy::float_cmp)]

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use pricewatch_cli::{run_cli, Cli};
use pricewatch_core::{ObservationInput, PriceSource, ProductId};
use pricewatch_store_sqlite::SqlitePriceStore;
use time::macros::{date, datetime};
use time::OffsetDateTime;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn run(db: &Path, args: &[&str]) {
    let db_arg = match db.to_str() {
        Some(value) => value,
        None => panic!("database path is not valid UTF-8"),
    };

    let mut argv = vec!["pricewatch", "--db", db_arg];
    argv.extend_from_slice(args);
    must(run_cli(Cli::parse_from(argv)));
}

fn observation(product_id: i64, scraped_at: OffsetDateTime, price: f64) -> ObservationInput {
    ObservationInput {
        product_id: ProductId(product_id),
        title: "Widget".to_string(),
        rating: Some(4.5),
        price,
        url: "https://shop.example/widget".to_string(),
        scraped_at,
    }
}

#[test]
fn daily_pipeline_flows_from_collection_to_fact_rows() {
    let dir = must(tempfile::tempdir().map_err(anyhow::Error::from));
    let db = dir.path().join("prices.sqlite3");

    // Day one arrives through the collection path: watchlist + feed file.
    run(
        &db,
        &[
            "watch",
            "add",
            "--product-id",
            "7",
            "--url",
            "https://shop.example/widget",
        ],
    );

    let feed_path = dir.path().join("feed.json");
    must(
        std::fs::write(
            &feed_path,
            r#"{
                "https://shop.example/widget": {
                    "title": "Widget",
                    "rating": 4.5,
                    "price": 10.0,
                    "fetched_at": "2024-01-01T06:00:00Z"
                }
            }"#,
        )
        .map_err(anyhow::Error::from),
    );
    let feed_arg = match feed_path.to_str() {
        Some(value) => value,
        None => panic!("feed path is not valid UTF-8"),
    };
    run(&db, &["collect", "--feed", feed_arg]);

    // Later history lands directly in the store.
    {
        let mut store = must(SqlitePriceStore::open(&db));
        let _ = must(store.insert_observation(&observation(
            7,
            datetime!(2024-01-02 06:00:00 UTC),
            12.0,
        )));
        let _ = must(store.insert_observation(&observation(
            7,
            datetime!(2024-01-03 06:00:00 UTC),
            14.0,
        )));
    }

    // Three days of history extend into a three-day forecast: 16, 18, 20.
    run(&db, &["forecast", "--horizon", "3"]);

    // Ground truth arrives for the first forecast day only.
    {
        let mut store = must(SqlitePriceStore::open(&db));
        let _ = must(store.insert_observation(&observation(
            7,
            datetime!(2024-01-04 06:00:00 UTC),
            17.0,
        )));
    }

    run(
        &db,
        &[
            "run-all",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-06",
            "--json",
        ],
    );

    let store = must(SqlitePriceStore::open(&db));
    let forecasts = must(store.list_forecasts(ProductId(7)));
    assert_eq!(forecasts.len(), 3);

    // Jan 4 was reconciled against the observation; the unbounded tail fell
    // back to its own predictions.
    assert_eq!(forecasts[0].day(), date!(2024 - 01 - 04));
    assert_eq!(forecasts[0].real_price, Some(17.0));
    assert_eq!(forecasts[0].price_source, Some(PriceSource::Observed));
    assert_eq!(forecasts[1].real_price, Some(18.0));
    assert_eq!(forecasts[1].price_source, Some(PriceSource::Predicted));
    assert_eq!(forecasts[2].real_price, Some(20.0));

    // Residuals (17-16, 18-18, 20-20) give MAE 1/3 and RMSE 1/sqrt(3).
    let metric = match must(store.error_metric(ProductId(7))) {
        Some(value) => value,
        None => panic!("expected metric row for product 7"),
    };
    assert!((metric.mae - 1.0 / 3.0).abs() < 1e-9);
    assert!((metric.rmse - 1.0 / 3.0_f64.sqrt()).abs() < 1e-9);

    // One fact row per forecast day in the window.
    let facts = must(store.fact_rows(date!(2024 - 01 - 01), date!(2024 - 01 - 06)));
    assert_eq!(facts.len(), 3);
    assert_eq!(facts[0].day, date!(2024 - 01 - 04));
    assert_eq!(facts[0].real_price, Some(17.0));
    assert_eq!(facts[0].predicted_price, Some(16.0));
    let fact_mae = match facts[0].mae {
        Some(value) => value,
        None => panic!("expected mae on fact row"),
    };
    assert!((fact_mae - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn rerunning_the_daily_pass_changes_nothing() {
    let dir = must(tempfile::tempdir().map_err(anyhow::Error::from));
    let db = dir.path().join("prices.sqlite3");

    {
        let mut store = must(SqlitePriceStore::open(&db));
        must(store.migrate());
        let _ = must(store.insert_observation(&observation(
            7,
            datetime!(2024-01-01 06:00:00 UTC),
            10.0,
        )));
        let _ = must(store.insert_observation(&observation(
            7,
            datetime!(2024-01-02 06:00:00 UTC),
            12.0,
        )));
    }

    run(&db, &["forecast", "--horizon", "2"]);
    let daily = [
        "run-all",
        "--start",
        "2024-01-01",
        "--end",
        "2024-01-04",
    ];

    run(&db, &daily);
    let first = {
        let store = must(SqlitePriceStore::open(&db));
        (
            must(store.list_forecasts(ProductId(7))),
            must(store.fact_rows(date!(2024 - 01 - 01), date!(2024 - 01 - 04))),
        )
    };

    run(&db, &daily);
    let store = must(SqlitePriceStore::open(&db));
    let forecasts = must(store.list_forecasts(ProductId(7)));
    let facts = must(store.fact_rows(date!(2024 - 01 - 01), date!(2024 - 01 - 04)));

    assert_eq!(forecasts, first.0);
    assert_eq!(facts.len(), first.1.len());

    // The second pass re-aggregates the same keys rather than appending.
    run(&db, &["forecast", "--horizon", "2"]);
    assert_eq!(must(store.list_forecasts(ProductId(7))).len(), 2);
}
