//! Configuration types for the gateway
//!
//! All defaults are resolved once at construction; collaborators receive the
//! resolved structs rather than merging loose option bags at call sites.

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Worker instances registered at startup
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    /// Deterministic fallback order for role routing. When empty, the first
    /// healthy instance in registration order is used.
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

/// Priority job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending jobs before submissions are rejected with backpressure
    pub capacity: usize,
    /// Maximum number of jobs executing concurrently
    pub max_concurrent: usize,
    /// Interval between dispatch ticks in milliseconds
    pub tick_interval_ms: u64,
    /// Priority added to a job each time it is requeued after a failed
    /// attempt, so retried jobs are not starved by fresh submissions
    pub retry_priority_boost: i32,
    /// Default attempt budget for jobs that do not specify one
    pub default_max_attempts: u32,
    /// Seconds a terminal job record is retained for status queries
    pub completed_ttl_secs: u64,
    /// Interval between settled-record cleanup sweeps in seconds
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_concurrent: 4,
            tick_interval_ms: 50,
            retry_priority_boost: 1,
            default_max_attempts: 3,
            completed_ttl_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

/// Retry executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per dispatched call (1 = no retry)
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    /// D' = D * (1 + U[-j, +j]) where j is jitter factor
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

fn default_retry_jitter_factor() -> f32 {
    0.2
}

/// Circuit breaker configuration, applied per destination key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close the circuit
    pub success_threshold: u32,
    /// Seconds an open circuit waits before permitting a half-open trial
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout_secs: 30,
        }
    }
}

/// Health check configuration for instance probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Consecutive probe failures before an instance is marked unhealthy
    pub failure_threshold: u32,
    /// Consecutive probe successes before an instance is marked healthy again
    pub success_threshold: u32,
    /// Probe timeout in seconds
    pub timeout_secs: u64,
    /// Interval between probe rounds in seconds
    pub check_interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_secs: 5,
            check_interval_secs: 30,
        }
    }
}

/// Metrics collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Maximum samples retained per instance
    pub max_samples_per_instance: usize,
    /// Seconds a sample is retained before the sweeper evicts it
    pub retention_secs: u64,
    /// Interval between sweeper runs in seconds
    pub sweep_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_samples_per_instance: 1000,
            retention_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Static registration entry for one worker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable identifier; also the circuit breaker key for this instance
    pub id: String,
    /// Backend endpoint, e.g. `http://localhost:11434`
    pub endpoint: String,
    /// Model served by this instance, e.g. `llama2`
    pub bound_model: String,
    /// Logical roles initially assigned to this instance
    #[serde(default)]
    pub roles: Vec<String>,
    /// Advisory concurrent-request bound for the backend
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_max_concurrent_requests() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.health_check.check_interval_secs, 30);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_instance_config_deserialization() {
        let json = r#"{
            "id": "ollama-local",
            "endpoint": "http://localhost:11434",
            "bound_model": "llama2",
            "roles": ["judge", "prosecutor"]
        }"#;
        let config: InstanceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.id, "ollama-local");
        assert_eq!(config.roles, vec!["judge", "prosecutor"]);
        assert_eq!(config.max_concurrent_requests, 4);
        assert!(config.description.is_none());
    }

    #[test]
    fn test_gateway_config_roundtrip() {
        let config = GatewayConfig {
            fallback_order: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.fallback_order, config.fallback_order);
        assert_eq!(parsed.retry.jitter_factor, config.retry.jitter_factor);
    }
}
