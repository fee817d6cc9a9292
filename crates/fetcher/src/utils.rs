use aire_core::{
    find_config_file, load_config, ConfigSource, DEFAULT_BACKEND_URL, DEFAULT_METRICS,
    DEFAULT_METRIC_LABEL, DEFAULT_MIN_RESAMPLE_SECS, DEFAULT_QUERY, DEFAULT_STATION_LABEL,
    DEFAULT_WINDOW_SPAN_SECS,
};
use anyhow::{Context, Error};
use clap::{Args, Parser, Subcommand};
use slog::{o, Drain, Level, Logger};
use std::{env, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

use crate::{
    Aggregation, AggregationPlan, EngineSettings, LabelNames, LatestRequest, Reconcile,
    RequestConfig, Resample, RetryPolicy, Scheduling, Selection, StationFilter, Step,
};

#[derive(Parser, Clone, Debug, serde::Deserialize, Default)]
#[command(
    author,
    version,
    about = "Aire Fetcher - Pulls station metrics from a Prometheus-compatible backend"
)]
pub struct Cli {
    /// Path to config file (TOML format)
    /// Searched in order: this flag, $AIRE_FETCHER_CONFIG, ./fetcher.toml,
    /// $XDG_CONFIG_HOME/aire-fetcher/fetcher.toml, /etc/aire-fetcher/fetcher.toml
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, env = "AIRE_FETCHER_LEVEL")]
    pub level: Option<String>,

    /// Prometheus API root, e.g. http://localhost:9090/api/v1
    #[arg(short, long, env = "AIRE_FETCHER_BASE_URL")]
    pub base_url: Option<String>,

    /// Series selector sent with every query
    #[arg(short, long, env = "AIRE_FETCHER_QUERY")]
    pub query: Option<String>,

    /// Label holding the station identifier
    #[arg(long, env = "AIRE_FETCHER_STATION_LABEL")]
    pub station_label: Option<String>,

    /// Label holding the metric name
    #[arg(long, env = "AIRE_FETCHER_METRIC_LABEL")]
    pub metric_label: Option<String>,

    /// Largest span covered by one range query, e.g. 1h or 1d
    #[arg(long, env = "AIRE_FETCHER_WINDOW_SPAN")]
    pub window_span: Option<String>,

    /// Retries per window after the first attempt
    #[arg(long, env = "AIRE_FETCHER_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Shortest backoff between retries, in milliseconds
    #[arg(long, env = "AIRE_FETCHER_MIN_BACKOFF_MS")]
    pub min_backoff_ms: Option<u64>,

    /// Longest backoff between retries, in milliseconds
    #[arg(long, env = "AIRE_FETCHER_MAX_BACKOFF_MS")]
    pub max_backoff_ms: Option<u64>,

    /// Windows fetched concurrently; 1 fetches them one after another
    #[arg(short, long, env = "AIRE_FETCHER_WORKERS")]
    pub workers: Option<usize>,

    /// Pause between sequential window requests, in milliseconds
    #[arg(long, env = "AIRE_FETCHER_REQUEST_DELAY_MS")]
    pub request_delay_ms: Option<u64>,

    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "AIRE_FETCHER_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Rate limiter refill rate in tokens per second (0 disables limiting)
    #[arg(short, long, env = "AIRE_FETCHER_REFILL_RATE")]
    pub refill_rate: Option<f64>,

    /// Rate limiter token capacity
    #[arg(short, long, env = "AIRE_FETCHER_TOKEN_CAPACITY")]
    pub token_capacity: Option<usize>,

    /// HTTP User-Agent header for backend requests
    #[arg(short, long, env = "AIRE_FETCHER_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Smallest accepted resample interval, e.g. 5m
    #[arg(long, env = "AIRE_FETCHER_MIN_RESAMPLE")]
    pub min_resample: Option<String>,

    /// Metrics fetched when a command names none (comma separated)
    #[arg(long, env = "AIRE_FETCHER_DEFAULT_METRICS", value_delimiter = ',')]
    pub default_metrics: Option<Vec<String>>,

    /// Metrics whose zero values mean "not reported" (comma separated)
    #[arg(long, env = "AIRE_FETCHER_ZERO_IS_MISSING", value_delimiter = ',')]
    pub zero_is_missing: Option<Vec<String>>,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Fetch a time range, optionally resampled into fixed buckets
    Range(RangeArgs),
    /// Fetch the most recent value of every series
    Latest(LatestArgs),
    /// List station identifiers known to the backend
    Stations(FilterArgs),
}

#[derive(Args, Clone, Debug, Default)]
pub struct FilterArgs {
    /// Keep only stations containing one of these (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Drop stations containing any of these (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,
}

impl FilterArgs {
    pub fn station_filter(&self) -> StationFilter {
        StationFilter::new(&self.include, &self.exclude)
    }
}

#[derive(Args, Clone, Debug)]
pub struct RangeArgs {
    /// Range start, RFC3339 (e.g. 2024-01-01T00:00:00Z)
    #[arg(long, value_parser = parse_rfc3339)]
    pub start: OffsetDateTime,

    /// Range end, RFC3339
    #[arg(long, value_parser = parse_rfc3339)]
    pub end: OffsetDateTime,

    /// Metrics to fetch, in output order (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub metrics: Vec<String>,

    /// Backend resolution step
    #[arg(long, default_value = "1m")]
    pub step: Step,

    /// Resample into buckets of this width, e.g. 1h
    #[arg(long)]
    pub resample: Option<Step>,

    /// Default bucket aggregation: mean, last, min, max
    #[arg(long, default_value = "mean")]
    pub aggregation: Aggregation,

    /// Per-metric aggregation, e.g. --aggregate Temperature=max
    #[arg(long = "aggregate", value_parser = parse_override)]
    pub overrides: Vec<(String, Aggregation)>,

    /// How duplicate readings are combined: mean, first, last
    #[arg(long, default_value = "mean")]
    pub reconcile: Reconcile,

    /// Round values to this many decimals
    #[arg(long)]
    pub round: Option<u32>,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub filter: FilterArgs,
}

impl RangeArgs {
    pub fn aggregation_plan(&self) -> AggregationPlan {
        self.overrides
            .iter()
            .fold(AggregationPlan::new(self.aggregation), |plan, (metric, agg)| {
                plan.with(metric.clone(), *agg)
            })
    }
}

#[derive(Args, Clone, Debug)]
pub struct LatestArgs {
    /// Evaluation time, RFC3339; defaults to the backend's current time
    #[arg(long, value_parser = parse_rfc3339)]
    pub at: Option<OffsetDateTime>,

    /// Metrics to report, in output order (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub metrics: Vec<String>,

    /// How duplicate readings are combined: mean, first, last
    #[arg(long, default_value = "mean")]
    pub reconcile: Reconcile,

    /// Round values to this many decimals
    #[arg(long)]
    pub round: Option<u32>,

    #[command(flatten)]
    pub filter: FilterArgs,
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| format!("invalid timestamp {}: {}", raw, e))
}

fn parse_override(raw: &str) -> Result<(String, Aggregation), String> {
    let (metric, aggregation) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected METRIC=AGGREGATION, got {}", raw))?;
    let metric = metric.trim();
    if metric.is_empty() {
        return Err(format!("missing metric name in {}", raw));
    }
    Ok((metric.to_string(), aggregation.trim().parse()?))
}

fn parse_span(token: Option<&str>, default_secs: u64) -> Result<time::Duration, Error> {
    match token {
        Some(token) => Ok(token
            .parse::<Step>()
            .with_context(|| format!("invalid duration {:?}", token))?
            .duration()),
        None => Ok(time::Duration::seconds(default_secs as i64)),
    }
}

impl Cli {
    /// Get the effective configuration value with defaults
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
    }

    pub fn query(&self) -> String {
        self.query
            .clone()
            .unwrap_or_else(|| DEFAULT_QUERY.to_string())
    }

    pub fn labels(&self) -> LabelNames {
        LabelNames {
            station: self
                .station_label
                .clone()
                .unwrap_or_else(|| DEFAULT_STATION_LABEL.to_string()),
            metric: self
                .metric_label
                .clone()
                .unwrap_or_else(|| DEFAULT_METRIC_LABEL.to_string()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            min_backoff: self
                .min_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_backoff),
            max_backoff: self
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        }
    }

    pub fn scheduling(&self) -> Scheduling {
        match self.workers.unwrap_or(1) {
            0 | 1 => Scheduling::Sequential {
                delay: Duration::from_millis(self.request_delay_ms.unwrap_or(250)),
            },
            workers => Scheduling::Parallel { workers },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.unwrap_or(30))
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate.unwrap_or(5.0)
    }

    pub fn token_capacity(&self) -> usize {
        self.token_capacity.unwrap_or(10)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("aire-fetcher/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn default_metrics(&self) -> Vec<String> {
        self.default_metrics
            .clone()
            .unwrap_or_else(|| DEFAULT_METRICS.iter().map(|m| m.to_string()).collect())
    }

    pub fn zero_is_missing(&self) -> Vec<String> {
        self.zero_is_missing
            .clone()
            .unwrap_or_else(|| vec!["Latitude".to_string(), "Longitude".to_string()])
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, Error> {
        Ok(EngineSettings {
            max_window_span: parse_span(self.window_span.as_deref(), DEFAULT_WINDOW_SPAN_SECS)?,
            retry: self.retry_policy(),
            scheduling: self.scheduling(),
            labels: self.labels(),
            min_resample: parse_span(self.min_resample.as_deref(), DEFAULT_MIN_RESAMPLE_SECS)?,
        })
    }

    pub fn selection(
        &self,
        metrics: &[String],
        reconcile: Reconcile,
        filter: &FilterArgs,
    ) -> Selection {
        let metrics = if metrics.is_empty() {
            self.default_metrics()
        } else {
            metrics.to_vec()
        };
        Selection {
            metrics,
            filter: filter.station_filter(),
            reconcile,
            zero_is_missing: self.zero_is_missing(),
        }
    }

    pub fn range_request(&self, args: &RangeArgs) -> RequestConfig {
        RequestConfig {
            query: self.query(),
            start: args.start,
            end: args.end,
            step: args.step,
            resample: args.resample.map(|width| Resample {
                width: width.duration(),
                plan: args.aggregation_plan(),
            }),
            selection: self.selection(&args.metrics, args.reconcile, &args.filter),
            deadline: args.timeout.map(Duration::from_secs),
        }
    }

    pub fn latest_request(&self, args: &LatestArgs) -> LatestRequest {
        LatestRequest {
            query: self.query(),
            at: args.at,
            selection: self.selection(&args.metrics, args.reconcile, &args.filter),
        }
    }
}

/// Load configuration from CLI args, config file, and environment
pub fn get_config_info() -> Cli {
    let cli_args = Cli::parse();

    // Determine config file path
    let source = if let Some(ref path) = cli_args.config {
        ConfigSource::Explicit(path.into())
    } else {
        find_config_file("AIRE_FETCHER_CONFIG", "fetcher.toml")
    };

    // Load from config file
    let file_config: Cli = load_config(&source).unwrap_or_default();

    merge_config(cli_args, file_config)
}

/// CLI args override file config (env vars are handled by clap)
fn merge_config(cli_args: Cli, file_config: Cli) -> Cli {
    Cli {
        config: cli_args.config,
        level: cli_args.level.or(file_config.level),
        base_url: cli_args.base_url.or(file_config.base_url),
        query: cli_args.query.or(file_config.query),
        station_label: cli_args.station_label.or(file_config.station_label),
        metric_label: cli_args.metric_label.or(file_config.metric_label),
        window_span: cli_args.window_span.or(file_config.window_span),
        max_retries: cli_args.max_retries.or(file_config.max_retries),
        min_backoff_ms: cli_args.min_backoff_ms.or(file_config.min_backoff_ms),
        max_backoff_ms: cli_args.max_backoff_ms.or(file_config.max_backoff_ms),
        workers: cli_args.workers.or(file_config.workers),
        request_delay_ms: cli_args.request_delay_ms.or(file_config.request_delay_ms),
        request_timeout: cli_args.request_timeout.or(file_config.request_timeout),
        refill_rate: cli_args.refill_rate.or(file_config.refill_rate),
        token_capacity: cli_args.token_capacity.or(file_config.token_capacity),
        user_agent: cli_args.user_agent.or(file_config.user_agent),
        min_resample: cli_args.min_resample.or(file_config.min_resample),
        default_metrics: cli_args.default_metrics.or(file_config.default_metrics),
        zero_is_missing: cli_args.zero_is_missing.or(file_config.zero_is_missing),
        command: cli_args.command,
    }
}

fn parse_level(raw: &str) -> Level {
    match raw.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" => Level::Warning,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

pub fn setup_logger(cli: &Cli) -> Logger {
    let log_level = match cli.level.as_ref() {
        Some(level) => parse_level(level),
        None => parse_level(&env::var("RUST_LOG").unwrap_or_default()),
    };

    // Logs go to stderr so stdout carries only the JSON result
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(log_level).fuse();
    slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

/// Token bucket shared by every request a client makes.
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<TokenState>,
}

struct TokenState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `refill_rate` is in tokens per second; zero or less disables limiting.
    pub fn new(capacity: usize, refill_rate: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        RateLimiter {
            capacity,
            refill_rate,
            state: Mutex::new(TokenState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if self.refill_rate <= 0.0 {
            return;
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };
            sleep(wait).await;
        }
    }
}
