//! Request dispatch and resilience layer for courtroom-agent inference.
//!
//! The crate accepts inference jobs destined for language-model backends,
//! queues them by priority, bounds concurrency, retries transient failures,
//! isolates failing backends via circuit breakers, and routes work across a
//! pool of health-checked worker instances selected by logical role (judge,
//! prosecutor, defense counsel, ...).
//!
//! The stack, bottom up:
//!
//! - [`crate::core::metrics`]: rolling per-instance latency/outcome samples
//! - [`crate::core::circuit_breaker`]: per-destination closed/open/half-open
//!   breaker
//! - [`crate::core::retry`]: per-attempt retry with exponential backoff and
//!   jitter
//! - [`crate::core::pool`]: health-checked worker registry with role routing
//! - [`crate::core::queue`]: priority queue with tick-driven,
//!   concurrency-capped dispatch and coarse per-job retry
//! - [`gateway`]: composition root wiring the above and exporting a status
//!   snapshot
//!
//! The crate is transport-agnostic: the surrounding application supplies the
//! wire protocol through the [`InstanceClient`] trait and observes job
//! outcomes through polling or a broadcast subscription.

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;

pub use crate::{
    config::{
        CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, InstanceConfig, MetricsConfig,
        QueueConfig, RetryConfig,
    },
    core::{
        CircuitState, DispatchError, DispatchResult, InstanceClient, InstanceId, JobEvent, JobId,
        JobSpec, JobState, JobStatus, WorkerInstance,
    },
    gateway::{Gateway, GatewayStatus},
};
