use async_trait::async_trait;
use fetcher::{
    Engine, EngineSettings, FetchError, QueryBackend, QueryResponse, RetryPolicy, Scheduling,
    Step, TimeWindow,
};
use mockall::mock;
use serde_json::{json, Value};
use slog::{o, Logger};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;

mock! {
    pub Backend {}

    #[async_trait]
    impl QueryBackend for Backend {
        async fn query_range(
            &self,
            query: &str,
            window: &TimeWindow,
            step: &Step,
        ) -> Result<QueryResponse, FetchError>;

        async fn query_instant(
            &self,
            query: &str,
            at: Option<OffsetDateTime>,
        ) -> Result<QueryResponse, FetchError>;

        async fn label_values(&self, label: &str) -> Result<Vec<String>, FetchError>;
    }
}

pub fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn settings(scheduling: Scheduling) -> EngineSettings {
    EngineSettings {
        max_window_span: time::Duration::hours(1),
        retry: RetryPolicy {
            max_retries: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        scheduling,
        ..EngineSettings::default()
    }
}

pub fn sequential() -> Scheduling {
    Scheduling::Sequential {
        delay: Duration::ZERO,
    }
}

pub fn engine(backend: MockBackend, scheduling: Scheduling) -> Engine {
    Engine::new(Arc::new(backend), settings(scheduling), logger())
}

pub fn metrics(names: &[&str]) -> Vec<String> {
    names.iter().map(|m| m.to_string()).collect()
}

/// One `values` entry of a range response.
pub fn series(station: &str, metric: &str, points: &[(OffsetDateTime, &str)]) -> Value {
    let values: Vec<_> = points
        .iter()
        .map(|(ts, value)| json!([ts.unix_timestamp(), value]))
        .collect();
    json!({
        "metric": {"__name__": metric, "exported_job": station, "job": "pushgateway"},
        "values": values,
    })
}

/// A `matrix` response in the shape the Prometheus range endpoint returns.
pub fn matrix(result: Vec<Value>) -> QueryResponse {
    serde_json::from_value(json!({
        "status": "success",
        "data": {"resultType": "matrix", "result": result}
    }))
    .expect("valid matrix response")
}

/// A `vector` response with one point per series.
pub fn vector(series: &[(&str, &str, OffsetDateTime, &str)]) -> QueryResponse {
    let result: Vec<_> = series
        .iter()
        .map(|(station, metric, ts, value)| {
            json!({
                "metric": {"__name__": metric, "exported_job": station},
                "value": [ts.unix_timestamp(), value],
            })
        })
        .collect();
    serde_json::from_value(json!({
        "status": "success",
        "data": {"resultType": "vector", "result": result}
    }))
    .expect("valid vector response")
}

pub fn empty() -> QueryResponse {
    matrix(Vec::new())
}

pub fn unavailable() -> FetchError {
    FetchError::Status {
        status: 503,
        body: "service unavailable".to_string(),
    }
}

pub fn rejected() -> FetchError {
    FetchError::Backend {
        status: 400,
        error_type: "bad_data".to_string(),
        message: "invalid parameter \"query\": parse error".to_string(),
    }
}
