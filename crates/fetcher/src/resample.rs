//! Fixed-width bucketing of wide rows, one independent timeline per station.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use crate::{AcquireError, WideRow};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Arithmetic mean of the non-null values.
    #[default]
    Mean,
    /// Chronologically last non-null value.
    Last,
    Min,
    Max,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" | "avg" | "average" => Ok(Aggregation::Mean),
            "last" => Ok(Aggregation::Last),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => Err(format!(
                "unknown aggregation `{}`: expected mean, last, min or max",
                other
            )),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregation::Mean => "mean",
            Aggregation::Last => "last",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        };
        f.write_str(name)
    }
}

/// A default aggregation plus per-metric exceptions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    pub default: Aggregation,
    pub overrides: BTreeMap<String, Aggregation>,
}

impl AggregationPlan {
    pub fn new(default: Aggregation) -> Self {
        AggregationPlan {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with(mut self, metric: impl Into<String>, aggregation: Aggregation) -> Self {
        self.overrides.insert(metric.into(), aggregation);
        self
    }

    pub fn for_metric(&self, metric: &str) -> Aggregation {
        self.overrides.get(metric).copied().unwrap_or(self.default)
    }
}

/// Resampling parameters of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Resample {
    pub width: Duration,
    pub plan: AggregationPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub station: String,
    /// Start of the half-open interval `[bucket_start, bucket_start + width)`.
    pub bucket_start: OffsetDateTime,
    pub aggregates: BTreeMap<String, Option<f64>>,
}

impl Bucket {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.aggregates.get(metric).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: u32,
    min: f64,
    max: f64,
    last: Option<(OffsetDateTime, f64)>,
}

impl Accumulator {
    fn push(&mut self, timestamp: OffsetDateTime, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
        match self.last {
            Some((seen, _)) if seen > timestamp => {}
            _ => self.last = Some((timestamp, value)),
        }
    }

    fn finish(&self, aggregation: Aggregation) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match aggregation {
            Aggregation::Mean => Some(self.sum / f64::from(self.count)),
            Aggregation::Last => self.last.map(|(_, value)| value),
            Aggregation::Min => Some(self.min),
            Aggregation::Max => Some(self.max),
        }
    }
}

/// Number of buckets of `width` needed to cover `[start, end)`.
pub fn bucket_count(start: OffsetDateTime, end: OffsetDateTime, width: Duration) -> usize {
    let span = (end - start).whole_nanoseconds();
    let width = width.whole_nanoseconds();
    if span <= 0 || width <= 0 {
        return 0;
    }
    ((span + width - 1) / width) as usize
}

/// Bucket `rows` over `[start, end)` anchored at `start`.
///
/// Each station with at least one row inside the range gets every bucket of
/// the range; a bucket without contributing values carries nulls. Rows
/// outside the range are ignored.
pub fn resample(
    rows: &[WideRow],
    start: OffsetDateTime,
    end: OffsetDateTime,
    metrics: &[String],
    resample: &Resample,
) -> Result<Vec<Bucket>, AcquireError> {
    if !resample.width.is_positive() {
        return Err(AcquireError::InvalidRequest(format!(
            "resample interval must be positive, got {}",
            resample.width
        )));
    }
    if end < start {
        return Err(AcquireError::InvalidRange { start, end });
    }

    let count = bucket_count(start, end, resample.width);
    let width_nanos = resample.width.whole_nanoseconds();

    let mut stations: BTreeMap<&str, BTreeMap<usize, Vec<Accumulator>>> = BTreeMap::new();
    for row in rows {
        if row.timestamp < start || row.timestamp >= end {
            continue;
        }
        let filled = stations.entry(row.station.as_str()).or_default();
        let idx = ((row.timestamp - start).whole_nanoseconds() / width_nanos) as usize;
        let accumulators = filled
            .entry(idx)
            .or_insert_with(|| vec![Accumulator::default(); metrics.len()]);
        for (acc, metric) in accumulators.iter_mut().zip(metrics) {
            if let Some(value) = row.value(metric) {
                acc.push(row.timestamp, value);
            }
        }
    }

    let aggregations: Vec<Aggregation> = metrics
        .iter()
        .map(|metric| resample.plan.for_metric(metric))
        .collect();

    let mut buckets = Vec::with_capacity(stations.len() * count);
    for (station, filled) in stations {
        let mut bucket_start = start;
        for idx in 0..count {
            let aggregates = metrics
                .iter()
                .enumerate()
                .map(|(m, metric)| {
                    let value = filled
                        .get(&idx)
                        .and_then(|accs| accs[m].finish(aggregations[m]));
                    (metric.clone(), value)
                })
                .collect();
            buckets.push(Bucket {
                station: station.to_string(),
                bucket_start,
                aggregates,
            });
            bucket_start += resample.width;
        }
    }
    Ok(buckets)
}
