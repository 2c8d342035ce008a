//! Local metric store consumed by the metric synchronizer

use crate::labels::{labels_to_text, Labels};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Information attached to a metric that is not part of its identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub service_name: String,
    pub service_instance: String,
    /// Runtime ID of the container the metric is about
    pub container_id: String,
    /// Labels text of the metric this status describes
    pub status_of: String,
    /// Agent owning the metric when it is not the main agent
    pub bleemeo_agent_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub labels: Labels,
    pub annotations: Annotations,
    pub point: Point,
}

/// A metric known to the store and when it was last pushed
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMetric {
    pub labels: Labels,
    pub annotations: Annotations,
    pub last_seen: DateTime<Utc>,
}

pub trait MetricStore: Send + Sync {
    /// Every metric that received at least one point.
    fn metrics(&self) -> Vec<LocalMetric>;

    fn push_points(&self, points: Vec<MetricPoint>);

    /// Forget every metric, e.g. when collection is reset.
    fn drop_all(&self);
}

struct StoredMetric {
    labels: Labels,
    annotations: Annotations,
    last_point: Point,
}

/// In-memory store keeping the last point of each metric
#[derive(Default)]
pub struct MemoryStore {
    metrics: DashMap<String, StoredMetric>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last point of a metric, by labels text
    pub fn last_point(&self, labels_text: &str) -> Option<Point> {
        self.metrics.get(labels_text).map(|m| m.last_point)
    }

    /// Forget metrics not pushed since `deadline`.
    pub fn drop_older_than(&self, deadline: DateTime<Utc>) -> usize {
        let before = self.metrics.len();
        self.metrics.retain(|_, m| m.last_point.time >= deadline);
        before - self.metrics.len()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl MetricStore for MemoryStore {
    fn metrics(&self) -> Vec<LocalMetric> {
        self.metrics
            .iter()
            .map(|m| LocalMetric {
                labels: m.labels.clone(),
                annotations: m.annotations.clone(),
                last_seen: m.last_point.time,
            })
            .collect()
    }

    fn push_points(&self, points: Vec<MetricPoint>) {
        for point in points {
            let key = labels_to_text(&point.labels);
            let mut entry = self.metrics.entry(key).or_insert_with(|| StoredMetric {
                labels: point.labels.clone(),
                annotations: point.annotations.clone(),
                last_point: point.point,
            });

            // Out of order points never move last_seen backward
            if point.point.time >= entry.last_point.time {
                entry.last_point = point.point;
                entry.annotations = point.annotations;
            }
        }
    }

    fn drop_all(&self) {
        self.metrics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::from_pairs;
    use chrono::Duration;

    fn point(name: &str, time: DateTime<Utc>, value: f64) -> MetricPoint {
        MetricPoint {
            labels: from_pairs([("__name__", name)]),
            annotations: Annotations::default(),
            point: Point { time, value },
        }
    }

    #[test]
    fn test_store_keeps_latest_point() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.push_points(vec![point("cpu_used", now, 10.0)]);
        store.push_points(vec![point("cpu_used", now - Duration::seconds(10), 5.0)]);

        let metrics = store.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].last_seen, now);
        assert_eq!(store.last_point("__name__=\"cpu_used\"").unwrap().value, 10.0);
    }

    #[test]
    fn test_store_expiry_and_drop() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.push_points(vec![
            point("cpu_used", now, 1.0),
            point("mem_used", now - Duration::hours(2), 1.0),
        ]);

        assert_eq!(store.drop_older_than(now - Duration::hours(1)), 1);
        assert_eq!(store.len(), 1);

        store.drop_all();
        assert!(store.is_empty());
    }
}
