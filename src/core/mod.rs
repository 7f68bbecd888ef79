//! Core dispatch and resilience components

pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use instance::{InstanceClient, InstanceId, WorkerInstance};
pub use job::{Job, JobEvent, JobId, JobSpec, JobState, JobStatus};
pub use metrics::{MetricsAggregate, MetricsCollector, SystemMetrics};
pub use pool::{InstancePool, InstanceStatus};
pub use queue::{JobExecutor, PriorityJobQueue, QueueStats};
pub use retry::{BackoffCalculator, RetryExecutor};
