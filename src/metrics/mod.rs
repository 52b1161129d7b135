//! Metrics registry (C1): typed counters/gauges/histograms with
//! Prometheus/JSON/text export (spec.md §4.9).
//!
//! Every metric owns its own lock so a write from any other component never
//! contends with an unrelated metric (spec.md §5).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

pub type Labels = Vec<(String, String)>;

fn label_key(labels: &Labels) -> String {
    let mut sorted = labels.clone();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

struct Counter {
    values: Mutex<HashMap<String, (Labels, f64)>>,
}

impl Counter {
    fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn inc(&self, delta: f64, labels: Labels) {
        let delta = delta.max(0.0);
        let mut values = self.values.lock().unwrap();
        let key = label_key(&labels);
        let entry = values.entry(key).or_insert((labels, 0.0));
        entry.1 = (entry.1 + delta).max(0.0);
    }

    fn snapshot(&self) -> Vec<(Labels, f64)> {
        self.values
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>()
    }
}

struct Gauge {
    values: Mutex<HashMap<String, (Labels, f64)>>,
}

impl Gauge {
    fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, value: f64, labels: Labels) {
        let mut values = self.values.lock().unwrap();
        let key = label_key(&labels);
        values.insert(key, (labels, value));
    }

    fn inc(&self, delta: f64, labels: Labels) {
        let mut values = self.values.lock().unwrap();
        let key = label_key(&labels);
        let entry = values.entry(key).or_insert((labels, 0.0));
        entry.1 += delta;
    }

    fn dec(&self, delta: f64, labels: Labels) {
        self.inc(-delta, labels);
    }

    fn snapshot(&self) -> Vec<(Labels, f64)> {
        self.values
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>()
    }
}

struct HistogramSeries {
    labels: Labels,
    bucket_counts: Vec<u64>,
    samples: Vec<f64>,
    sum: f64,
    count: u64,
}

struct Histogram {
    bucket_bounds: Vec<f64>,
    sample_cap: usize,
    series: Mutex<HashMap<String, HistogramSeries>>,
}

impl Histogram {
    fn new(mut bucket_bounds: Vec<f64>, sample_cap: usize) -> Self {
        bucket_bounds.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Self {
            bucket_bounds,
            sample_cap,
            series: Mutex::new(HashMap::new()),
        }
    }

    fn observe(&self, value: f64, labels: Labels) {
        let mut series_map = self.series.lock().unwrap();
        let key = label_key(&labels);
        let bucket_count = self.bucket_bounds.len() + 1; // + infinity
        let series = series_map.entry(key).or_insert_with(|| HistogramSeries {
            labels,
            bucket_counts: vec![0; bucket_count],
            samples: Vec::new(),
            sum: 0.0,
            count: 0,
        });

        let mut placed = false;
        for (i, bound) in self.bucket_bounds.iter().enumerate() {
            if value <= *bound {
                series.bucket_counts[i] += 1;
                placed = true;
                break;
            }
        }
        if !placed {
            let last = series.bucket_counts.len() - 1;
            series.bucket_counts[last] += 1;
        }
        // Cumulative counts: every bucket above the placed one also counts.
        // Recomputed lazily at export time from per-bucket deltas instead —
        // store deltas here, cumulative sum happens in `cumulative_counts`.

        series.sum += value;
        series.count += 1;
        series.samples.push(value);
        if series.samples.len() > self.sample_cap {
            series.samples.remove(0);
        }
    }

    fn percentile(&self, labels: &Labels, p: f64) -> Option<f64> {
        let series_map = self.series.lock().unwrap();
        let key = label_key(labels);
        let series = series_map.get(&key)?;
        if series.samples.is_empty() {
            return None;
        }
        let mut sorted = series.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = (p.clamp(0.0, 1.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

/// One exportable histogram series: per-bucket cumulative counts, matching
/// the Prometheus convention (`le="<upper>"`, `+Inf` implicit as the last).
pub struct HistogramExport {
    pub labels: Labels,
    pub bucket_bounds: Vec<f64>,
    pub cumulative_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

/// Thread-safe typed metrics registry.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, Histogram>>,
    sample_cap: usize,
}

impl MetricsRegistry {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
            sample_cap,
        }
    }

    pub fn counter_inc(&self, name: &str, delta: f64, labels: Labels) {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .inc(delta, labels);
    }

    pub fn gauge_set(&self, name: &str, value: f64, labels: Labels) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .set(value, labels);
    }

    pub fn gauge_inc(&self, name: &str, delta: f64, labels: Labels) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .inc(delta, labels);
    }

    pub fn gauge_dec(&self, name: &str, delta: f64, labels: Labels) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .dec(delta, labels);
    }

    pub fn register_histogram(&self, name: &str, bucket_bounds: Vec<f64>) {
        let mut histograms = self.histograms.lock().unwrap();
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(bucket_bounds, self.sample_cap));
    }

    pub fn histogram_observe(&self, name: &str, value: f64, labels: Labels) {
        let mut histograms = self.histograms.lock().unwrap();
        let histogram = histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_buckets(), self.sample_cap));
        histogram.observe(value, labels);
    }

    pub fn histogram_percentile(&self, name: &str, labels: &Labels, p: f64) -> Option<f64> {
        let histograms = self.histograms.lock().unwrap();
        histograms.get(name)?.percentile(labels, p)
    }

    fn counters_snapshot(&self) -> Vec<(String, Vec<(Labels, f64)>)> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, c)| (name.clone(), c.snapshot()))
            .collect()
    }

    fn gauges_snapshot(&self) -> Vec<(String, Vec<(Labels, f64)>)> {
        self.gauges
            .lock()
            .unwrap()
            .iter()
            .map(|(name, g)| (name.clone(), g.snapshot()))
            .collect()
    }

    fn histograms_snapshot(&self) -> Vec<(String, Vec<HistogramExport>)> {
        self.histograms
            .lock()
            .unwrap()
            .iter()
            .map(|(name, h)| {
                let series = h.series.lock().unwrap();
                let exports = series
                    .values()
                    .map(|s| {
                        let mut cumulative = Vec::with_capacity(s.bucket_counts.len());
                        let mut running = 0u64;
                        for c in &s.bucket_counts {
                            running += c;
                            cumulative.push(running);
                        }
                        HistogramExport {
                            labels: s.labels.clone(),
                            bucket_bounds: h.bucket_bounds.clone(),
                            cumulative_counts: cumulative,
                            sum: s.sum,
                            count: s.count,
                        }
                    })
                    .collect::<Vec<_>>();
                (name.clone(), exports)
            })
            .collect()
    }

    pub fn export(&self, format: ExportFormat) -> String {
        match format {
            ExportFormat::Json => self.export_json(),
            ExportFormat::Prometheus => self.export_prometheus(),
            ExportFormat::Text => self.export_text(),
        }
    }

    fn export_json(&self) -> String {
        #[derive(Serialize)]
        struct Root {
            counters: HashMap<String, HashMap<String, f64>>,
            gauges: HashMap<String, HashMap<String, f64>>,
            histograms: HashMap<String, HashMap<String, serde_json::Value>>,
        }

        let counters = self
            .counters_snapshot()
            .into_iter()
            .map(|(name, entries)| {
                let map = entries
                    .into_iter()
                    .map(|(labels, v)| (label_key(&labels), v))
                    .collect();
                (name, map)
            })
            .collect();

        let gauges = self
            .gauges_snapshot()
            .into_iter()
            .map(|(name, entries)| {
                let map = entries
                    .into_iter()
                    .map(|(labels, v)| (label_key(&labels), v))
                    .collect();
                (name, map)
            })
            .collect();

        let histograms = self
            .histograms_snapshot()
            .into_iter()
            .map(|(name, entries)| {
                let map = entries
                    .into_iter()
                    .map(|h| {
                        (
                            label_key(&h.labels),
                            serde_json::json!({
                                "count": h.count,
                                "sum": h.sum,
                                "buckets": h.bucket_bounds,
                                "cumulative_counts": h.cumulative_counts,
                            }),
                        )
                    })
                    .collect();
                (name, map)
            })
            .collect();

        serde_json::to_string(&Root {
            counters,
            gauges,
            histograms,
        })
        .unwrap_or_default()
    }

    fn export_prometheus(&self) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut out = String::new();

        for (name, entries) in self.counters_snapshot() {
            for (labels, value) in entries {
                out.push_str(&format!(
                    "{name}{} {value} {now_ms}\n",
                    prometheus_labels(&labels)
                ));
            }
        }
        for (name, entries) in self.gauges_snapshot() {
            for (labels, value) in entries {
                out.push_str(&format!(
                    "{name}{} {value} {now_ms}\n",
                    prometheus_labels(&labels)
                ));
            }
        }
        for (name, entries) in self.histograms_snapshot() {
            for h in entries {
                out.push_str(&format!(
                    "{name}_count{} {} {now_ms}\n",
                    prometheus_labels(&h.labels),
                    h.count
                ));
                out.push_str(&format!(
                    "{name}_sum{} {} {now_ms}\n",
                    prometheus_labels(&h.labels),
                    h.sum
                ));
                for (bound, cumulative) in h.bucket_bounds.iter().zip(h.cumulative_counts.iter()) {
                    out.push_str(&format!(
                        "{name}_bucket{{le=\"{bound}\"}} {cumulative} {now_ms}\n",
                    ));
                }
                let total = h.cumulative_counts.last().copied().unwrap_or(0);
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {total} {now_ms}\n"));
            }
        }
        out
    }

    fn export_text(&self) -> String {
        let mut out = String::new();
        for (name, entries) in self.counters_snapshot() {
            for (labels, value) in entries {
                out.push_str(&format!("counter {name}{:?} = {value}\n", labels));
            }
        }
        for (name, entries) in self.gauges_snapshot() {
            for (labels, value) in entries {
                out.push_str(&format!("gauge {name}{:?} = {value}\n", labels));
            }
        }
        for (name, entries) in self.histograms_snapshot() {
            for h in entries {
                out.push_str(&format!(
                    "histogram {name}{:?}: count={} sum={:.3}\n",
                    h.labels, h.count, h.sum
                ));
            }
        }
        out
    }
}

fn prometheus_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let joined = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{joined}}}")
}

fn default_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

#[derive(Debug, Clone, Copy)]
pub enum ExportFormat {
    Json,
    Prometheus,
    Text,
}
