//! In-process metrics registry
//!
//! Counters and gauges registered by name and rendered in the Prometheus
//! text exposition format for `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

/// Process-wide registry used by the binary.
pub static METRICS: LazyLock<Arc<MetricsRegistry>> =
    LazyLock::new(|| Arc::new(MetricsRegistry::new()));

/// Counter of retried outbound HTTP requests.
pub const RETRIES_COUNTER: &str = "wrphub_retries_total";

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can go up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
}

#[derive(Debug)]
struct Entry {
    help: String,
    metric: Metric,
}

/// Named collection of metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter, or return the existing one with the same name.
    ///
    /// A name already registered as a gauge yields a fresh, unregistered
    /// counter so callers never observe a type mismatch.
    pub fn register_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let mut entries = self.entries.write();
        match entries.get(name) {
            Some(Entry {
                metric: Metric::Counter(counter),
                ..
            }) => counter.clone(),
            Some(_) => Arc::new(Counter::default()),
            None => {
                let counter = Arc::new(Counter::default());
                entries.insert(
                    name.to_string(),
                    Entry {
                        help: help.to_string(),
                        metric: Metric::Counter(counter.clone()),
                    },
                );
                counter
            }
        }
    }

    /// Register a gauge, or return the existing one with the same name.
    pub fn register_gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let mut entries = self.entries.write();
        match entries.get(name) {
            Some(Entry {
                metric: Metric::Gauge(gauge),
                ..
            }) => gauge.clone(),
            Some(_) => Arc::new(Gauge::default()),
            None => {
                let gauge = Arc::new(Gauge::default());
                entries.insert(
                    name.to_string(),
                    Entry {
                        help: help.to_string(),
                        metric: Metric::Gauge(gauge.clone()),
                    },
                );
                gauge
            }
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let entries = self.entries.read();
        let mut out = String::new();
        for (name, entry) in entries.iter() {
            let (kind, value) = match &entry.metric {
                Metric::Counter(c) => ("counter", c.get().to_string()),
                Metric::Gauge(g) => ("gauge", g.get().to_string()),
            };
            let _ = writeln!(out, "# HELP {name} {}", entry.help);
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
