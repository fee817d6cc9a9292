use crate::helpers::{
    empty, engine, logger, matrix, metrics, rejected, sequential, series, settings, unavailable,
    MockBackend,
};
use fetcher::{
    AcquireError, Aggregation, AggregationPlan, Engine, EngineSettings, Grouped, Reconcile,
    RequestConfig, Resample, RetryPolicy, Scheduling, StationFilter,
};
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use time::macros::datetime;
use tokio_util::sync::CancellationToken;

fn two_hour_request(names: &[&str]) -> RequestConfig {
    RequestConfig::new(
        r#"{job="pushgateway"}"#,
        datetime!(2024-01-01 00:00 UTC),
        datetime!(2024-01-01 02:00 UTC),
        metrics(names),
    )
}

#[tokio::test]
async fn recovers_from_transient_window_failure() {
    let first_window_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first_window_calls);

    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .times(3)
        .returning(move |_, window, step| {
            assert_eq!(step.to_string(), "1m");
            if window.start == datetime!(2024-01-01 00:00 UTC) {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(unavailable());
                }
                Ok(matrix(vec![series(
                    "S1",
                    "PM25",
                    &[(datetime!(2024-01-01 00:00 UTC), "12.5")],
                )]))
            } else {
                Ok(matrix(vec![series(
                    "S1",
                    "PM25",
                    &[(datetime!(2024-01-01 01:30 UTC), "20")],
                )]))
            }
        });

    let acquisition = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25", "Temperature"]), &CancellationToken::new())
        .await
        .expect("transient failure is retried");

    assert_eq!(first_window_calls.load(Ordering::SeqCst), 2);
    assert_eq!(acquisition.total_records(), 2);
    assert!(acquisition.report.failures.is_empty());

    let output: serde_json::Value =
        serde_json::from_str(&acquisition.to_json(None).unwrap()).unwrap();
    assert_eq!(
        output,
        json!({
            "total_records": 2,
            "data": {
                "S1": [
                    {"date": "2024-01-01T00:00:00Z", "PM25": 12.5, "Temperature": null},
                    {"date": "2024-01-01T01:30:00Z", "PM25": 20.0, "Temperature": null}
                ]
            }
        })
    );
}

#[tokio::test]
async fn skips_window_that_keeps_failing() {
    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .withf(|_, window, _| window.start == datetime!(2024-01-01 00:00 UTC))
        .times(4)
        .returning(|_, _, _| Err(unavailable()));
    backend
        .expect_query_range()
        .withf(|_, window, _| window.start == datetime!(2024-01-01 01:00 UTC))
        .times(1)
        .returning(|_, _, _| {
            Ok(matrix(vec![series(
                "S1",
                "PM25",
                &[(datetime!(2024-01-01 01:15 UTC), "8")],
            )]))
        });

    let acquisition = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .expect("one good window is enough");

    assert_eq!(acquisition.total_records(), 1);
    assert_eq!(acquisition.report.windows, 2);
    assert_eq!(acquisition.report.failures.len(), 1);
    assert_eq!(
        acquisition.report.failures[0].window.start,
        datetime!(2024-01-01 00:00 UTC)
    );
}

#[tokio::test]
async fn malformed_window_is_skipped_without_retry() {
    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .withf(|_, window, _| window.start == datetime!(2024-01-01 00:00 UTC))
        .times(1)
        .returning(|_, _, _| Err(fetcher::FetchError::Malformed("missing data".to_string())));
    backend
        .expect_query_range()
        .withf(|_, window, _| window.start == datetime!(2024-01-01 01:00 UTC))
        .times(1)
        .returning(|_, _, _| {
            Ok(matrix(vec![series(
                "S1",
                "PM25",
                &[(datetime!(2024-01-01 01:15 UTC), "8")],
            )]))
        });

    let acquisition = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(acquisition.report.failures.len(), 1);
    assert!(acquisition.report.failures[0].cause.contains("malformed"));
}

#[tokio::test]
async fn rejected_query_aborts_acquisition() {
    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .times(1)
        .returning(|_, _, _| Err(rejected()));

    let err = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::FatalBackend { .. }), "{err}");
}

#[tokio::test]
async fn no_data_when_every_window_fails() {
    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .times(8)
        .returning(|_, _, _| Err(unavailable()));

    let err = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, AcquireError::NoData { windows: 2, failed: 2 }),
        "{err}"
    );
}

#[tokio::test]
async fn no_data_when_backend_has_nothing() {
    let mut backend = MockBackend::new();
    backend
        .expect_query_range()
        .times(2)
        .returning(|_, _, _| Ok(empty()));

    let err = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, AcquireError::NoData { windows: 2, failed: 0 }),
        "{err}"
    );
}

#[tokio::test]
async fn empty_range_issues_no_requests() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().never();

    let mut request = two_hour_request(&["PM25"]);
    request.end = request.start;

    let err = engine(backend, sequential())
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, AcquireError::NoData { windows: 0, failed: 0 }),
        "{err}"
    );
}

#[tokio::test]
async fn invalid_requests_fail_before_fetching() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().never();
    let engine = engine(backend, sequential());
    let cancel = CancellationToken::new();

    let mut reversed = two_hour_request(&["PM25"]);
    std::mem::swap(&mut reversed.start, &mut reversed.end);
    let err = engine.acquire(&reversed, &cancel).await.unwrap_err();
    assert!(matches!(err, AcquireError::InvalidRange { .. }), "{err}");

    let no_metrics = two_hour_request(&[]);
    let err = engine.acquire(&no_metrics, &cancel).await.unwrap_err();
    assert!(matches!(err, AcquireError::InvalidRequest(_)), "{err}");

    let twice = two_hour_request(&["PM25", "PM25"]);
    let err = engine.acquire(&twice, &cancel).await.unwrap_err();
    assert!(matches!(err, AcquireError::InvalidRequest(_)), "{err}");

    let mut too_fine = two_hour_request(&["PM25"]);
    too_fine.resample = Some(Resample {
        width: time::Duration::minutes(2),
        plan: AggregationPlan::default(),
    });
    let err = engine.acquire(&too_fine, &cancel).await.unwrap_err();
    assert!(matches!(err, AcquireError::InvalidRequest(_)), "{err}");
}

#[tokio::test]
async fn cancelled_token_stops_acquisition() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().returning(|_, _, _| Ok(empty()));

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::Cancelled), "{err}");
}

#[tokio::test]
async fn cancelling_in_flight_parallel_fetches_discards_everything() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    // The first window succeeds; the second keeps failing and sits in a
    // long backoff when the caller gives up.
    let mut backend = MockBackend::new();
    backend.expect_query_range().returning(move |_, window, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        if window.start == datetime!(2024-01-01 00:00 UTC) {
            Ok(matrix(vec![series(
                "S1",
                "PM25",
                &[(datetime!(2024-01-01 00:30 UTC), "5")],
            )]))
        } else {
            Err(unavailable())
        }
    });

    let slow_retries = EngineSettings {
        retry: RetryPolicy {
            max_retries: 5,
            min_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
        },
        ..settings(Scheduling::Parallel { workers: 2 })
    };
    let engine = Engine::new(Arc::new(backend), slow_retries, logger());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = engine
        .acquire(&two_hour_request(&["PM25"]), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deadline_bounds_the_whole_acquisition() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().returning(|_, _, _| {
        Ok(matrix(vec![series(
            "S1",
            "PM25",
            &[(datetime!(2024-01-01 00:30 UTC), "1")],
        )]))
    });

    let mut request = two_hour_request(&["PM25"]);
    request.deadline = Some(Duration::from_millis(50));
    let slow = Scheduling::Sequential {
        delay: Duration::from_secs(5),
    };

    let err = engine(backend, slow)
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::TimedOut(_)), "{err}");
}

#[tokio::test]
async fn boundary_duplicates_are_reconciled() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(2).returning(|_, window, _| {
        let value = if window.start == datetime!(2024-01-01 00:00 UTC) {
            "2"
        } else {
            "4"
        };
        Ok(matrix(vec![series(
            "S1",
            "PM25",
            &[(datetime!(2024-01-01 01:00 UTC), value)],
        )]))
    });

    let acquisition = engine(backend, sequential())
        .acquire(&two_hour_request(&["PM25"]), &CancellationToken::new())
        .await
        .unwrap();

    let Grouped::Rows(stations) = &acquisition.grouped else {
        panic!("expected raw rows");
    };
    assert_eq!(stations["S1"].len(), 1);
    assert_eq!(stations["S1"][0].value("PM25"), Some(3.0));
}

#[tokio::test]
async fn last_reconciliation_prefers_later_window() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(2).returning(|_, window, _| {
        let value = if window.start == datetime!(2024-01-01 00:00 UTC) {
            "2"
        } else {
            "4"
        };
        Ok(matrix(vec![series(
            "S1",
            "PM25",
            &[(datetime!(2024-01-01 01:00 UTC), value)],
        )]))
    });

    let mut request = two_hour_request(&["PM25"]);
    request.selection.reconcile = Reconcile::Last;

    let acquisition = engine(backend, Scheduling::Parallel { workers: 2 })
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();

    let Grouped::Rows(stations) = &acquisition.grouped else {
        panic!("expected raw rows");
    };
    assert_eq!(stations["S1"][0].value("PM25"), Some(4.0));
}

fn three_window_backend() -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(3).returning(|_, window, _| {
        let hour = (window.start - datetime!(2024-01-01 00:00 UTC)).whole_hours();
        let start = window.start;
        let temperature = if hour == 1 { "NaN" } else { "18" };
        Ok(matrix(vec![
            series(
                "S1",
                "PM25",
                &[(start, "1.5"), (start + time::Duration::minutes(30), "2.5")],
            ),
            series(
                "S2",
                "Temperature",
                &[(start + time::Duration::minutes(10), temperature)],
            ),
        ]))
    });
    backend
}

#[tokio::test]
async fn parallel_and_sequential_agree() {
    let mut request = two_hour_request(&["PM25", "Temperature"]);
    request.end = datetime!(2024-01-01 03:00 UTC);

    let sequential_result = engine(three_window_backend(), sequential())
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();
    let parallel_result = engine(three_window_backend(), Scheduling::Parallel { workers: 3 })
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sequential_result, parallel_result);
    // 00:00, 00:30, 01:00, 01:30, 02:00, 02:30 for S1 plus 00:10 and 02:10 for S2
    assert_eq!(sequential_result.total_records(), 8);
    assert_eq!(sequential_result.report.normalize.invalid_points, 1);
}

#[tokio::test]
async fn resampling_fills_gaps_with_nulls() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(3).returning(|_, window, _| {
        if window.start == datetime!(2024-01-01 00:00 UTC) {
            Ok(matrix(vec![series(
                "S1",
                "PM25",
                &[
                    (datetime!(2024-01-01 00:10 UTC), "10"),
                    (datetime!(2024-01-01 00:20 UTC), "20"),
                ],
            )]))
        } else if window.start == datetime!(2024-01-01 02:00 UTC) {
            Ok(matrix(vec![series(
                "S1",
                "PM25",
                &[(datetime!(2024-01-01 02:30 UTC), "7")],
            )]))
        } else {
            Ok(empty())
        }
    });

    let mut request = two_hour_request(&["PM25"]);
    request.end = datetime!(2024-01-01 03:00 UTC);
    request.resample = Some(Resample {
        width: time::Duration::hours(1),
        plan: AggregationPlan::new(Aggregation::Mean),
    });

    let acquisition = engine(backend, sequential())
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();

    let output: serde_json::Value =
        serde_json::from_str(&acquisition.to_json(None).unwrap()).unwrap();
    assert_eq!(
        output,
        json!({
            "total_records": 3,
            "data": {
                "S1": [
                    {"date": "2024-01-01T00:00:00Z", "PM25": 15.0},
                    {"date": "2024-01-01T01:00:00Z", "PM25": null},
                    {"date": "2024-01-01T02:00:00Z", "PM25": 7.0}
                ]
            }
        })
    );
}

#[tokio::test]
async fn station_filter_and_missing_coordinates() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(2).returning(|_, window, _| {
        if window.start != datetime!(2024-01-01 00:00 UTC) {
            return Ok(empty());
        }
        let ts = datetime!(2024-01-01 00:05 UTC);
        Ok(matrix(vec![
            series("Bogota-Centro", "PM25", &[(ts, "30")]),
            series("Bogota-Centro", "Latitude", &[(ts, "0")]),
            series("Bogota-Norte", "PM25", &[(ts, "12")]),
            series("Bogota-Norte", "Latitude", &[(ts, "4.71")]),
            series("Medellin", "PM25", &[(ts, "40")]),
        ]))
    });

    let mut request = two_hour_request(&["PM25", "Latitude"]);
    request.selection.filter = StationFilter::from_csv("bogota", "norte");

    let acquisition = engine(backend, sequential())
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(acquisition.grouped.stations(), vec!["Bogota-Centro"]);
    let Grouped::Rows(stations) = &acquisition.grouped else {
        panic!("expected raw rows");
    };
    let row = &stations["Bogota-Centro"][0];
    assert_eq!(row.value("PM25"), Some(30.0));
    assert_eq!(row.value("Latitude"), None);
}

#[tokio::test]
async fn filtering_everything_out_is_not_an_error() {
    let mut backend = MockBackend::new();
    backend.expect_query_range().times(2).returning(|_, _, _| {
        Ok(matrix(vec![series(
            "S1",
            "PM25",
            &[(datetime!(2024-01-01 00:30 UTC), "1")],
        )]))
    });

    let mut request = two_hour_request(&["PM25"]);
    request.selection.filter = StationFilter::from_csv("", "s1");

    let acquisition = engine(backend, sequential())
        .acquire(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(acquisition.total_records(), 0);
}
