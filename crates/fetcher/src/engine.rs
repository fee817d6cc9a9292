//! Request-scoped acquisition: plan windows, fetch them, merge, resample,
//! filter and group.

use std::{collections::BTreeMap, sync::Arc, time::Duration as StdDuration};

use slog::{debug, info, o, warn, Logger};
use time::{Duration, OffsetDateTime};
use tokio::{sync::Semaphore, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    assemble, group_by_station, iso8601, normalize, plan_windows, resample, AcquireError, Bucket,
    Columns, FetchTarget, LabelNames, NormalizeStats, QueryBackend, QueryResponse, Reconcile,
    Resample, RetryPolicy, StationFilter, Step, TimeWindow, WideRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// One window at a time, pausing `delay` between requests.
    Sequential { delay: StdDuration },
    /// Up to `workers` windows in flight at once.
    Parallel { workers: usize },
}

/// Process-wide knobs, fixed for the lifetime of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_window_span: Duration,
    pub retry: RetryPolicy,
    pub scheduling: Scheduling,
    pub labels: LabelNames,
    pub min_resample: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_window_span: Duration::seconds(aire_core::DEFAULT_WINDOW_SPAN_SECS as i64),
            retry: RetryPolicy::default(),
            scheduling: Scheduling::Sequential {
                delay: StdDuration::from_millis(250),
            },
            labels: LabelNames::default(),
            min_resample: Duration::seconds(aire_core::DEFAULT_MIN_RESAMPLE_SECS as i64),
        }
    }
}

/// Which columns a request wants and how rows are cleaned and filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Output columns, in output order.
    pub metrics: Vec<String>,
    pub filter: StationFilter,
    pub reconcile: Reconcile,
    pub zero_is_missing: Vec<String>,
}

impl Selection {
    pub fn new(metrics: Vec<String>) -> Self {
        Selection {
            metrics,
            filter: StationFilter::default(),
            reconcile: Reconcile::default(),
            zero_is_missing: vec!["Latitude".to_string(), "Longitude".to_string()],
        }
    }

    fn columns(&self) -> Columns<'_> {
        Columns {
            metrics: &self.metrics,
            reconcile: self.reconcile,
            zero_is_missing: &self.zero_is_missing,
        }
    }

    fn validate(&self) -> Result<(), AcquireError> {
        if self.metrics.is_empty() {
            return Err(AcquireError::InvalidRequest(
                "at least one metric is required".to_string(),
            ));
        }
        for (idx, metric) in self.metrics.iter().enumerate() {
            if self.metrics[..idx].contains(metric) {
                return Err(AcquireError::InvalidRequest(format!(
                    "metric {} requested twice",
                    metric
                )));
            }
        }
        Ok(())
    }
}

/// Everything one range acquisition needs.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub query: String,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub step: Step,
    pub resample: Option<Resample>,
    pub selection: Selection,
    pub deadline: Option<StdDuration>,
}

impl RequestConfig {
    /// A one-minute-step request with no resampling and no deadline.
    pub fn new(
        query: impl Into<String>,
        start: OffsetDateTime,
        end: OffsetDateTime,
        metrics: Vec<String>,
    ) -> Self {
        RequestConfig {
            query: query.into(),
            start,
            end,
            step: Step::MINUTE,
            resample: None,
            selection: Selection::new(metrics),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatestRequest {
    pub query: String,
    /// Evaluation time; the backend's "now" when unset.
    pub at: Option<OffsetDateTime>,
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowFailure {
    pub window: TimeWindow,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionReport {
    pub windows: usize,
    pub failures: Vec<WindowFailure>,
    pub normalize: NormalizeStats,
    /// Rows assembled before resampling and filtering.
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grouped {
    Rows(BTreeMap<String, Vec<WideRow>>),
    Buckets(BTreeMap<String, Vec<Bucket>>),
}

impl Grouped {
    pub fn total_records(&self) -> usize {
        match self {
            Grouped::Rows(stations) => stations.values().map(Vec::len).sum(),
            Grouped::Buckets(stations) => stations.values().map(Vec::len).sum(),
        }
    }

    pub fn stations(&self) -> Vec<&str> {
        match self {
            Grouped::Rows(stations) => stations.keys().map(String::as_str).collect(),
            Grouped::Buckets(stations) => stations.keys().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub metrics: Vec<String>,
    pub grouped: Grouped,
    pub report: AcquisitionReport,
}

impl Acquisition {
    pub fn total_records(&self) -> usize {
        self.grouped.total_records()
    }
}

type WindowOutcome = Result<QueryResponse, AcquireError>;

pub struct Engine {
    backend: Arc<dyn QueryBackend>,
    settings: EngineSettings,
    logger: Logger,
}

impl Engine {
    pub fn new(backend: Arc<dyn QueryBackend>, settings: EngineSettings, logger: Logger) -> Self {
        Engine {
            backend,
            settings,
            logger,
        }
    }

    /// Acquire `request`'s range as grouped station rows.
    ///
    /// Windows that fail transiently or come back malformed are skipped and
    /// reported; a query the backend rejects aborts the call. Cancellation
    /// or an expired deadline discards everything fetched so far.
    pub async fn acquire(
        &self,
        request: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, AcquireError> {
        self.validate(request)?;

        let work = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(self.logger, "acquisition cancelled by caller");
                    Err(AcquireError::Cancelled)
                }
                result = self.run(request) => result,
            }
        };

        match request.deadline {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                warn!(self.logger, "acquisition exceeded deadline of {:?}", limit);
                AcquireError::TimedOut(limit)
            })?,
            None => work.await,
        }
    }

    /// Latest value of every series, through the instant query endpoint.
    pub async fn latest(
        &self,
        request: &LatestRequest,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, AcquireError> {
        request.selection.validate()?;

        let fetch = self.settings.retry.run(&self.logger, || {
            self.backend.query_instant(&request.query, request.at)
        });
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            result = fetch => result,
        };
        let response = outcome.map_err(|e| {
            AcquireError::from_fetch(FetchTarget::Instant(request.at), e.attempts, e.error)
        })?;

        let (samples, stats) = normalize(&response, &self.settings.labels, &self.logger);
        if samples.is_empty() {
            return Err(AcquireError::NoData {
                windows: 1,
                failed: 0,
            });
        }
        let rows = assemble(&samples, request.selection.columns());
        let report = AcquisitionReport {
            windows: 1,
            failures: Vec::new(),
            normalize: stats,
            rows: rows.len(),
        };
        let grouped = Grouped::Rows(group_by_station(rows, &request.selection.filter));
        info!(
            self.logger,
            "latest values for {} station(s)",
            grouped.stations().len()
        );

        Ok(Acquisition {
            metrics: request.selection.metrics.clone(),
            grouped,
            report,
        })
    }

    /// Station identifiers known to the backend that pass `filter`, sorted.
    pub async fn stations(&self, filter: &StationFilter) -> Result<Vec<String>, AcquireError> {
        let label = &self.settings.labels.station;
        let mut stations = self
            .settings
            .retry
            .run(&self.logger, || self.backend.label_values(label))
            .await
            .map_err(|e| {
                AcquireError::from_fetch(FetchTarget::LabelValues(label.clone()), e.attempts, e.error)
            })?;
        stations.retain(|station| filter.matches(station));
        stations.sort();
        stations.dedup();
        debug!(self.logger, "{} station(s) after filtering", stations.len());
        Ok(stations)
    }

    fn validate(&self, request: &RequestConfig) -> Result<(), AcquireError> {
        if request.end < request.start {
            return Err(AcquireError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }
        request.selection.validate()?;
        if let Some(bucketing) = &request.resample {
            if bucketing.width < self.settings.min_resample {
                return Err(AcquireError::InvalidRequest(format!(
                    "resample interval {} is below the minimum of {}",
                    bucketing.width, self.settings.min_resample
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, request: &RequestConfig) -> Result<Acquisition, AcquireError> {
        let windows = plan_windows(request.start, request.end, self.settings.max_window_span)?;
        info!(
            self.logger,
            "acquiring {} window(s)", windows.len();
            "start" => iso8601(request.start),
            "end" => iso8601(request.end),
            "step" => request.step.to_string()
        );

        let outcomes = match self.settings.scheduling {
            Scheduling::Sequential { delay } => {
                self.fetch_sequential(request, &windows, delay).await?
            }
            Scheduling::Parallel { workers } => {
                self.fetch_parallel(request, &windows, workers).await?
            }
        };

        let mut report = AcquisitionReport {
            windows: windows.len(),
            ..AcquisitionReport::default()
        };
        let mut samples = Vec::new();
        for (window, outcome) in windows.iter().zip(outcomes) {
            match outcome {
                Ok(response) => {
                    let (mut window_samples, stats) =
                        normalize(&response, &self.settings.labels, &self.logger);
                    report.normalize += stats;
                    samples.append(&mut window_samples);
                }
                Err(err) => {
                    warn!(self.logger, "skipping window {}: {}", window, err);
                    report.failures.push(WindowFailure {
                        window: *window,
                        cause: err.to_string(),
                    });
                }
            }
        }

        if samples.is_empty() {
            return Err(AcquireError::NoData {
                windows: windows.len(),
                failed: report.failures.len(),
            });
        }

        let mut rows = assemble(&samples, request.selection.columns());
        report.rows = rows.len();
        let filter = &request.selection.filter;
        let grouped = match &request.resample {
            Some(bucketing) => {
                let buckets = resample(
                    &rows,
                    request.start,
                    request.end,
                    &request.selection.metrics,
                    bucketing,
                )?;
                Grouped::Buckets(group_by_station(buckets, filter))
            }
            None => {
                rows.retain(|row| request.start <= row.timestamp && row.timestamp <= request.end);
                Grouped::Rows(group_by_station(rows, filter))
            }
        };

        info!(
            self.logger,
            "acquired {} record(s) for {} station(s)",
            grouped.total_records(),
            grouped.stations().len();
            "samples" => report.normalize.samples,
            "failed_windows" => report.failures.len(),
            "unattributed" => report.normalize.unattributed_entries,
            "invalid" => report.normalize.invalid_points
        );

        Ok(Acquisition {
            metrics: request.selection.metrics.clone(),
            grouped,
            report,
        })
    }

    async fn fetch_sequential(
        &self,
        request: &RequestConfig,
        windows: &[TimeWindow],
        delay: StdDuration,
    ) -> Result<Vec<WindowOutcome>, AcquireError> {
        let mut outcomes = Vec::with_capacity(windows.len());
        for (idx, window) in windows.iter().enumerate() {
            if idx > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            let outcome = fetch_window(
                self.backend.as_ref(),
                &self.settings.retry,
                &request.query,
                window,
                &request.step,
                &self.logger,
            )
            .await;
            outcomes.push(triage(outcome)?);
        }
        Ok(outcomes)
    }

    async fn fetch_parallel(
        &self,
        request: &RequestConfig,
        windows: &[TimeWindow],
        workers: usize,
    ) -> Result<Vec<WindowOutcome>, AcquireError> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();

        for (idx, window) in windows.iter().copied().enumerate() {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.settings.retry.clone();
            let query = request.query.clone();
            let step = request.step;
            let logger = self.logger.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome =
                    fetch_window(backend.as_ref(), &retry, &query, &window, &step, &logger).await;
                (idx, outcome)
            });
        }

        // Slots keep window order so merging never depends on completion order.
        let mut slots: Vec<Option<WindowOutcome>> = windows.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (idx, outcome) = match joined {
                Ok(done) => done,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => return Err(AcquireError::Cancelled),
            };
            slots[idx] = Some(triage(outcome)?);
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or(AcquireError::Cancelled))
            .collect()
    }
}

async fn fetch_window(
    backend: &dyn QueryBackend,
    retry: &RetryPolicy,
    query: &str,
    window: &TimeWindow,
    step: &Step,
    logger: &Logger,
) -> WindowOutcome {
    let logger = logger.new(o!("window" => window.to_string()));
    retry
        .run(&logger, || backend.query_range(query, window, step))
        .await
        .map_err(|e| AcquireError::from_fetch(FetchTarget::Window(*window), e.attempts, e.error))
}

/// Keep skippable failures as outcomes, surface everything else.
fn triage(outcome: WindowOutcome) -> Result<WindowOutcome, AcquireError> {
    match outcome {
        Err(err) if !err.is_skippable() => Err(err),
        outcome => Ok(outcome),
    }
}
