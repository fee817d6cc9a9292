//! Flattening backend series into `(station, metric, timestamp, value)` samples.

use slog::{debug, Logger};
use time::OffsetDateTime;

use crate::{QueryResponse, RawPoint};

/// Label names that attribute a series to a station and a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelNames {
    pub station: String,
    pub metric: String,
}

impl Default for LabelNames {
    fn default() -> Self {
        LabelNames {
            station: aire_core::DEFAULT_STATION_LABEL.to_string(),
            metric: aire_core::DEFAULT_METRIC_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub station: String,
    pub metric: String,
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub entries: usize,
    pub samples: usize,
    /// Entries without a station or metric label.
    pub unattributed_entries: usize,
    /// Points whose value or timestamp could not be used.
    pub invalid_points: usize,
}

impl std::ops::AddAssign for NormalizeStats {
    fn add_assign(&mut self, other: Self) {
        self.entries += other.entries;
        self.samples += other.samples;
        self.unattributed_entries += other.unattributed_entries;
        self.invalid_points += other.invalid_points;
    }
}

pub fn normalize(
    response: &QueryResponse,
    labels: &LabelNames,
    logger: &Logger,
) -> (Vec<Sample>, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let mut samples = Vec::new();

    for entry in &response.data.result {
        stats.entries += 1;
        let (Some(station), Some(metric)) = (
            entry.metric.get(&labels.station),
            entry.metric.get(&labels.metric),
        ) else {
            stats.unattributed_entries += 1;
            debug!(logger, "dropping series without attribution"; "labels" => format!("{:?}", entry.metric));
            continue;
        };

        for point in entry.points() {
            match parse_point(point) {
                Some((timestamp, value)) => samples.push(Sample {
                    station: station.clone(),
                    metric: metric.clone(),
                    timestamp,
                    value,
                }),
                None => {
                    stats.invalid_points += 1;
                    debug!(
                        logger,
                        "dropping unusable point";
                        "station" => station, "metric" => metric,
                        "timestamp" => point.0, "raw" => point.1.to_string()
                    );
                }
            }
        }
    }

    stats.samples = samples.len();
    (samples, stats)
}

fn parse_point((secs, raw): &RawPoint) -> Option<(OffsetDateTime, f64)> {
    let timestamp = timestamp_from_unix(*secs)?;
    let value = match raw {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    value.is_finite().then_some((timestamp, value))
}

/// Backend timestamps carry at most millisecond precision.
pub fn timestamp_from_unix(secs: f64) -> Option<OffsetDateTime> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(millis.checked_mul(1_000_000)?).ok()
}
