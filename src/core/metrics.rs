//! Rolling per-instance call metrics
//!
//! Samples are retained in bounded deques (count- and age-limited). The
//! aggregates feed the gateway status export and are available as an optional
//! signal for routing decisions.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::MetricsConfig;

/// One observed call outcome
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub recorded_at: Instant,
    pub latency: Duration,
    pub success: bool,
}

/// Aggregate over a window of samples
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsAggregate {
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub request_count: usize,
}

/// System-wide rollup for status export
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub totals: MetricsAggregate,
    pub instances: Vec<InstanceMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub instance_id: String,
    #[serde(flatten)]
    pub aggregate: MetricsAggregate,
}

/// Collector of per-instance latency/outcome samples
#[derive(Debug)]
pub struct MetricsCollector {
    samples: DashMap<String, VecDeque<MetricSample>>,
    config: MetricsConfig,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            samples: DashMap::new(),
            config,
        }
    }

    /// Append one sample, enforcing the per-instance count cap inline. Age
    /// eviction is left to the background sweeper.
    pub fn record_outcome(&self, instance_id: &str, latency: Duration, success: bool) {
        let mut entry = self.samples.entry(instance_id.to_string()).or_default();
        entry.push_back(MetricSample {
            recorded_at: Instant::now(),
            latency,
            success,
        });
        while entry.len() > self.config.max_samples_per_instance {
            entry.pop_front();
        }
    }

    /// Aggregate samples newer than `window`, optionally restricted to one
    /// instance. Read-only.
    pub fn aggregate(&self, window: Duration, filter: Option<&str>) -> MetricsAggregate {
        let cutoff = Instant::now().checked_sub(window);
        let mut count = 0usize;
        let mut successes = 0usize;
        let mut total_latency = Duration::ZERO;

        for entry in self.samples.iter() {
            if let Some(id) = filter
                && entry.key() != id
            {
                continue;
            }
            for sample in entry.value() {
                if let Some(cutoff) = cutoff
                    && sample.recorded_at < cutoff
                {
                    continue;
                }
                count += 1;
                total_latency += sample.latency;
                if sample.success {
                    successes += 1;
                }
            }
        }

        if count == 0 {
            return MetricsAggregate::default();
        }
        let success_rate = successes as f64 / count as f64;
        MetricsAggregate {
            avg_latency_ms: total_latency.as_secs_f64() * 1000.0 / count as f64,
            success_rate,
            error_rate: 1.0 - success_rate,
            request_count: count,
        }
    }

    /// Per-instance aggregates combined into a system-wide rollup
    pub fn system_snapshot(&self) -> SystemMetrics {
        let window = Duration::from_secs(self.config.retention_secs);
        let instances = self
            .samples
            .iter()
            .map(|entry| InstanceMetrics {
                instance_id: entry.key().clone(),
                aggregate: self.aggregate(window, Some(entry.key())),
            })
            .collect();

        SystemMetrics {
            totals: self.aggregate(window, None),
            instances,
        }
    }

    /// Evict samples older than the retention window
    fn sweep(&self) {
        let cutoff = Instant::now().checked_sub(Duration::from_secs(self.config.retention_secs));
        let Some(cutoff) = cutoff else { return };

        let mut evicted = 0usize;
        for mut entry in self.samples.iter_mut() {
            let before = entry.len();
            while entry
                .front()
                .is_some_and(|sample| sample.recorded_at < cutoff)
            {
                entry.pop_front();
            }
            evicted += before - entry.len();
        }
        if evicted > 0 {
            debug!(evicted, "Swept expired metric samples");
        }
    }

    /// Start the background sweep loop. The returned handle stops the loop
    /// on shutdown; it also stops once the collector itself is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> MetricsSweeper {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let collector = Arc::downgrade(self);
        let interval_secs = self.config.sweep_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                if shutdown_flag.load(Ordering::Acquire) {
                    debug!("Metrics sweeper shutting down");
                    break;
                }
                let Some(collector) = collector.upgrade() else {
                    break;
                };
                collector.sweep();
            }
        });

        MetricsSweeper { handle, shutdown }
    }
}

/// Sweeper task handle with graceful shutdown
pub struct MetricsSweeper {
    handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for MetricsSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsSweeper")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl MetricsSweeper {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig {
            max_samples_per_instance: 5,
            retention_secs: 600,
            sweep_interval_secs: 60,
        })
    }

    #[test]
    fn test_aggregate_empty() {
        let metrics = collector();
        let agg = metrics.aggregate(Duration::from_secs(60), None);
        assert_eq!(agg.request_count, 0);
        assert_eq!(agg.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_aggregate_counts_and_rates() {
        let metrics = collector();
        metrics.record_outcome("ollama-local", Duration::from_millis(100), true);
        metrics.record_outcome("ollama-local", Duration::from_millis(300), true);
        metrics.record_outcome("ollama-local", Duration::from_millis(200), false);

        let agg = metrics.aggregate(Duration::from_secs(60), None);
        assert_eq!(agg.request_count, 3);
        assert!((agg.avg_latency_ms - 200.0).abs() < 1.0);
        assert!((agg.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((agg.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_filter_by_instance() {
        let metrics = collector();
        metrics.record_outcome("a", Duration::from_millis(100), true);
        metrics.record_outcome("b", Duration::from_millis(500), false);

        let agg = metrics.aggregate(Duration::from_secs(60), Some("a"));
        assert_eq!(agg.request_count, 1);
        assert_eq!(agg.success_rate, 1.0);
    }

    #[test]
    fn test_count_cap_enforced() {
        let metrics = collector();
        for _ in 0..20 {
            metrics.record_outcome("a", Duration::from_millis(10), true);
        }
        let agg = metrics.aggregate(Duration::from_secs(60), Some("a"));
        assert_eq!(agg.request_count, 5);
    }

    #[test]
    fn test_sweep_evicts_old_samples() {
        let metrics = MetricsCollector::new(MetricsConfig {
            max_samples_per_instance: 100,
            retention_secs: 0,
            sweep_interval_secs: 60,
        });
        metrics.record_outcome("a", Duration::from_millis(10), true);
        std::thread::sleep(Duration::from_millis(5));
        metrics.sweep();
        let agg = metrics.aggregate(Duration::from_secs(60), None);
        assert_eq!(agg.request_count, 0);
    }

    #[test]
    fn test_system_snapshot_rollup() {
        let metrics = collector();
        metrics.record_outcome("a", Duration::from_millis(100), true);
        metrics.record_outcome("b", Duration::from_millis(200), false);

        let snapshot = metrics.system_snapshot();
        assert_eq!(snapshot.totals.request_count, 2);
        assert_eq!(snapshot.instances.len(), 2);
        let a = snapshot
            .instances
            .iter()
            .find(|m| m.instance_id == "a")
            .unwrap();
        assert_eq!(a.aggregate.request_count, 1);
    }
}
