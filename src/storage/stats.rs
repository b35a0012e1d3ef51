//! Running aggregates over stored points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregates for a single point type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeStats {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Aggregate view over a set of points. Always recomputable from storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_points: u64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub by_type: BTreeMap<String, TypeStats>,
}

#[derive(Debug, Default)]
struct Running {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Running {
    fn accumulate(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map(|min| min.min(value)).unwrap_or(value));
        self.max = Some(self.max.map(|max| max.max(value)).unwrap_or(value));
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Accumulates values by type and produces a `StatsSnapshot`.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    total: Running,
    by_type: BTreeMap<String, Running>,
}

impl StatsAccumulator {
    pub fn accumulate(&mut self, point_type: &str, value: f64) {
        self.total.accumulate(value);
        match self.by_type.get_mut(point_type) {
            Some(running) => running.accumulate(value),
            None => {
                let mut running = Running::default();
                running.accumulate(value);
                self.by_type.insert(point_type.to_string(), running);
            }
        }
    }

    pub fn finish(self) -> StatsSnapshot {
        StatsSnapshot {
            total_points: self.total.count,
            avg: self.total.avg(),
            min: self.total.min,
            max: self.total.max,
            by_type: self
                .by_type
                .into_iter()
                .map(|(point_type, running)| {
                    let stats = TypeStats {
                        count: running.count,
                        avg: running.avg().unwrap_or_default(),
                        min: running.min.unwrap_or_default(),
                        max: running.max.unwrap_or_default(),
                    };
                    (point_type, stats)
                })
                .collect(),
        }
    }
}
