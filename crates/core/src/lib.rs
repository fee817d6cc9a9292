//! Aire Core Library
//!
//! Shared pieces for the station-metrics fetcher:
//! - Configuration discovery and TOML loading (XDG-compliant)
//! - Application-wide defaults

mod config;

pub use config::{config_candidates, find_config_file, load_config, ConfigSource};

/// Application name used for XDG and /etc paths
pub const APP_NAME: &str = "aire-fetcher";

/// Default Prometheus-compatible API root
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:9090/api/v1";

/// Default selector used when the caller does not supply one
pub const DEFAULT_QUERY: &str = r#"{job="pushgateway"}"#;

/// Label carrying the station identifier on every series
pub const DEFAULT_STATION_LABEL: &str = "exported_job";

/// Label carrying the metric name on every series
pub const DEFAULT_METRIC_LABEL: &str = "__name__";

/// Largest span a single range query may cover (1 hour)
pub const DEFAULT_WINDOW_SPAN_SECS: u64 = 3600;

/// Smallest resample interval accepted from callers (5 minutes)
pub const DEFAULT_MIN_RESAMPLE_SECS: u64 = 300;

/// Metrics reported by the station firmware
pub const DEFAULT_METRICS: &[&str] = &["PM25", "PM25raw", "PM1", "Humidity", "Temperature"];
