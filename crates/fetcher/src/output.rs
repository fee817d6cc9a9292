//! JSON envelope handed to the presentation layer.
//!
//! ```json
//! { "total_records": 2, "data": { "S1": [ { "date": "2024-01-01T00:00:00Z", "PM25": 12.5 } ] } }
//! ```

use std::collections::BTreeMap;

use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serialize, Serializer,
};

use crate::{iso8601, Acquisition, Grouped, StationRow};

/// Borrowed view of an [`Acquisition`] that serializes as the output envelope.
pub struct Envelope<'a> {
    acquisition: &'a Acquisition,
    round: Option<u32>,
}

impl Acquisition {
    /// Values are rounded to `round` decimals when set.
    pub fn envelope(&self, round: Option<u32>) -> Envelope<'_> {
        Envelope {
            acquisition: self,
            round,
        }
    }

    pub fn to_json(&self, round: Option<u32>) -> serde_json::Result<String> {
        serde_json::to_string(&self.envelope(round))
    }
}

impl Serialize for Envelope<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let metrics = &self.acquisition.metrics;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("total_records", &self.acquisition.total_records())?;
        match &self.acquisition.grouped {
            Grouped::Rows(stations) => map.serialize_entry(
                "data",
                &Stations {
                    stations,
                    metrics,
                    round: self.round,
                },
            )?,
            Grouped::Buckets(stations) => map.serialize_entry(
                "data",
                &Stations {
                    stations,
                    metrics,
                    round: self.round,
                },
            )?,
        }
        map.end()
    }
}

struct Stations<'a, R> {
    stations: &'a BTreeMap<String, Vec<R>>,
    metrics: &'a [String],
    round: Option<u32>,
}

impl<R: StationRow> Serialize for Stations<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.stations.len()))?;
        for (station, rows) in self.stations {
            map.serialize_entry(
                station,
                &Series {
                    rows,
                    metrics: self.metrics,
                    round: self.round,
                },
            )?;
        }
        map.end()
    }
}

struct Series<'a, R> {
    rows: &'a [R],
    metrics: &'a [String],
    round: Option<u32>,
}

impl<R: StationRow> Serialize for Series<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in self.rows {
            seq.serialize_element(&Row {
                row,
                metrics: self.metrics,
                round: self.round,
            })?;
        }
        seq.end()
    }
}

struct Row<'a, R> {
    row: &'a R,
    metrics: &'a [String],
    round: Option<u32>,
}

impl<R: StationRow> Serialize for Row<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.metrics.len() + 1))?;
        map.serialize_entry("date", &iso8601(self.row.timestamp()))?;
        for metric in self.metrics {
            let value = self
                .row
                .value(metric)
                .map(|v| self.round.map_or(v, |decimals| round_to(v, decimals)));
            map.serialize_entry(metric, &value)?;
        }
        map.end()
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(15) as i32);
    (value * factor).round() / factor
}
