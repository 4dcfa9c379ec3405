use super::{format_tags, MetricsSink, Tags};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Count/sum/min/max of an observed series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of everything an [`InMemoryMetrics`] has seen
///
/// Series are keyed by `name` or `name{k=v,...}` when tagged.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    /// Sum of a counter across all tag sets
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(key, _)| series_name(key) == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// One histogram merged across all tag sets
    pub fn histogram_total(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms
            .iter()
            .filter(|(key, _)| series_name(key) == name)
            .map(|(_, h)| *h)
            .reduce(|mut acc, h| {
                acc.merge(&h);
                acc
            })
    }

    /// Counter values of `name` split by one tag, e.g. errors by kind
    pub fn counter_by_tag(&self, name: &str, tag: &str) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.counters {
            if series_name(key) != name {
                continue;
            }
            if let Some(tag_value) = tag_value(key, tag) {
                *out.entry(tag_value.to_string()).or_insert(0) += value;
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, HistogramSummary>,
}

/// Metrics sink that keeps every series in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<Series>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a panicking writer; the maps are still usable.
    fn lock(&self) -> MutexGuard<'_, Series> {
        self.series.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counter(&self, name: &str, tags: Tags<'_>) -> u64 {
        self.lock()
            .counters
            .get(&series_key(name, tags))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, tags: Tags<'_>) -> Option<f64> {
        self.lock().gauges.get(&series_key(name, tags)).copied()
    }

    pub fn histogram(&self, name: &str, tags: Tags<'_>) -> Option<HistogramSummary> {
        self.lock().histograms.get(&series_key(name, tags)).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.lock();
        MetricsSnapshot {
            counters: series.counters.clone(),
            gauges: series.gauges.clone(),
            histograms: series.histograms.clone(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        *self
            .lock()
            .counters
            .entry(series_key(name, tags))
            .or_insert(0) += 1;
    }

    fn observe(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.lock()
            .histograms
            .entry(series_key(name, tags))
            .and_modify(|h| h.record(value))
            .or_insert_with(|| HistogramSummary::new(value));
    }

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.lock().gauges.insert(series_key(name, tags), value);
    }
}

fn series_key(name: &str, tags: Tags<'_>) -> String {
    if tags.is_empty() {
        name.to_string()
    } else {
        format!("{}{{{}}}", name, format_tags(tags))
    }
}

fn series_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

fn tag_value<'a>(key: &'a str, tag: &str) -> Option<&'a str> {
    let inner = key.split_once('{')?.1.strip_suffix('}')?;
    inner.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == tag).then_some(v)
    })
}
