//! Gateway configuration

pub mod types;

pub use types::{
    CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, InstanceConfig, MetricsConfig,
    QueueConfig, RetryConfig,
};
