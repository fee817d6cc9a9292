//! Pivot long-format samples into one row per `(station, timestamp)`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use serde::Deserialize;
use time::OffsetDateTime;

use crate::Sample;

/// How several reports of the same `(station, metric, timestamp)` collapse
/// into one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconcile {
    /// Arithmetic mean of every report.
    #[default]
    Mean,
    /// The report that arrived first, in window order.
    First,
    /// The report that arrived last, in window order.
    Last,
}

impl FromStr for Reconcile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" | "avg" | "average" => Ok(Reconcile::Mean),
            "first" => Ok(Reconcile::First),
            "last" => Ok(Reconcile::Last),
            other => Err(format!(
                "unknown reconciliation `{}`: expected mean, first or last",
                other
            )),
        }
    }
}

impl fmt::Display for Reconcile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reconcile::Mean => "mean",
            Reconcile::First => "first",
            Reconcile::Last => "last",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub station: String,
    pub timestamp: OffsetDateTime,
    /// Exactly one entry per requested metric.
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl WideRow {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy)]
struct Collision {
    sum: f64,
    count: u32,
    first: f64,
    last: f64,
}

impl Collision {
    fn new(value: f64) -> Self {
        Collision {
            sum: value,
            count: 1,
            first: value,
            last: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    fn resolve(&self, strategy: Reconcile) -> f64 {
        match strategy {
            Reconcile::Mean => self.sum / f64::from(self.count),
            Reconcile::First => self.first,
            Reconcile::Last => self.last,
        }
    }
}

/// Column set and cleaning rules applied while pivoting.
#[derive(Debug, Clone, Copy)]
pub struct Columns<'a> {
    pub metrics: &'a [String],
    pub reconcile: Reconcile,
    /// Metrics for which a reported `0` means "not set".
    pub zero_is_missing: &'a [String],
}

/// Assemble samples into rows ordered by station, then timestamp.
///
/// Every `(station, timestamp)` seen in `samples` produces a row, even when
/// none of its samples belong to a requested metric. A zero reported for a
/// zero-is-missing metric does not take part in reconciliation.
pub fn assemble(samples: &[Sample], columns: Columns<'_>) -> Vec<WideRow> {
    let positions: HashMap<&str, usize> = columns
        .metrics
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();
    let zero_is_missing: Vec<bool> = columns
        .metrics
        .iter()
        .map(|name| columns.zero_is_missing.contains(name))
        .collect();

    let mut groups: BTreeMap<(&str, OffsetDateTime), Vec<Option<Collision>>> = BTreeMap::new();
    for sample in samples {
        let slots = groups
            .entry((sample.station.as_str(), sample.timestamp))
            .or_insert_with(|| vec![None; columns.metrics.len()]);
        let Some(&idx) = positions.get(sample.metric.as_str()) else {
            continue;
        };
        if zero_is_missing[idx] && sample.value == 0.0 {
            continue;
        }
        match slots[idx].as_mut() {
            Some(collision) => collision.push(sample.value),
            None => slots[idx] = Some(Collision::new(sample.value)),
        }
    }

    groups
        .into_iter()
        .map(|((station, timestamp), slots)| WideRow {
            station: station.to_string(),
            timestamp,
            metrics: columns
                .metrics
                .iter()
                .zip(slots)
                .map(|(name, slot)| (name.clone(), slot.map(|c| c.resolve(columns.reconcile))))
                .collect(),
        })
        .collect()
}
