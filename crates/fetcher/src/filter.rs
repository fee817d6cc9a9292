//! Station include/exclude filtering and grouping of final rows.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::{Bucket, WideRow};

/// Case-insensitive substring filter over station identifiers.
///
/// A station passes when it matches at least one include pattern (or no
/// include patterns were given) and matches no exclude pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl StationFilter {
    pub fn new<I, E, S>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        StationFilter {
            include: patterns(include),
            exclude: patterns(exclude),
        }
    }

    /// Build from comma separated lists, e.g. `"bogota,medellin"`.
    pub fn from_csv(include: &str, exclude: &str) -> Self {
        StationFilter::new(include.split(','), exclude.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, station: &str) -> bool {
        let station = station.to_lowercase();
        let included = self.include.is_empty()
            || self.include.iter().any(|p| station.contains(p.as_str()));
        included && !self.exclude.iter().any(|p| station.contains(p.as_str()))
    }
}

fn patterns<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|p| p.as_ref().trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Anything the output stage can group and serialize.
pub trait StationRow {
    fn station(&self) -> &str;
    fn timestamp(&self) -> OffsetDateTime;
    fn value(&self, metric: &str) -> Option<f64>;
}

impl StationRow for WideRow {
    fn station(&self) -> &str {
        &self.station
    }

    fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    fn value(&self, metric: &str) -> Option<f64> {
        WideRow::value(self, metric)
    }
}

impl StationRow for Bucket {
    fn station(&self) -> &str {
        &self.station
    }

    fn timestamp(&self) -> OffsetDateTime {
        self.bucket_start
    }

    fn value(&self, metric: &str) -> Option<f64> {
        Bucket::value(self, metric)
    }
}

/// Keep rows of matching stations, grouped per station in chronological order.
pub fn group_by_station<R: StationRow>(
    rows: Vec<R>,
    filter: &StationFilter,
) -> BTreeMap<String, Vec<R>> {
    let keep_all = filter.is_empty();
    let mut grouped: BTreeMap<String, Vec<R>> = BTreeMap::new();
    for row in rows {
        if !keep_all && !filter.matches(row.station()) {
            continue;
        }
        match grouped.get_mut(row.station()) {
            Some(series) => series.push(row),
            None => {
                grouped.insert(row.station().to_string(), vec![row]);
            }
        }
    }
    for series in grouped.values_mut() {
        series.sort_by_key(|row| row.timestamp());
    }
    grouped
}
