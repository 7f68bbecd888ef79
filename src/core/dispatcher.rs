//! Dispatch path composition
//!
//! The dispatcher implements the queue's [`JobExecutor`] seam: each
//! queue-level attempt routes the job's role to a healthy instance, guards
//! the worker call with that instance's circuit breaker, and retries
//! transient failures with backoff. Routing runs again on every retry, so a
//! retried call may land on a different instance than the one that failed.

use std::{fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{
    config::RetryConfig,
    core::{
        circuit_breaker::CircuitBreakerRegistry,
        error::{DispatchError, DispatchResult},
        instance::InstanceClient,
        metrics::MetricsCollector,
        pool::InstancePool,
        queue::JobExecutor,
        retry::RetryExecutor,
    },
};

/// Executes one queue-level attempt through the resilience stack
pub struct Dispatcher {
    pool: Arc<InstancePool>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsCollector>,
    client: Arc<dyn InstanceClient>,
    retry_config: RetryConfig,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("retry_config", &self.retry_config)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        pool: Arc<InstancePool>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsCollector>,
        client: Arc<dyn InstanceClient>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            pool,
            breakers,
            metrics,
            client,
            retry_config,
        }
    }

    /// One routed, breaker-guarded worker call.
    ///
    /// The breaker key is the instance id, so one failing endpoint never
    /// poisons calls routed to its fallbacks.
    async fn attempt(&self, role: &str, payload: &Value) -> DispatchResult<Value> {
        let instance = self.pool.route_for_role(role)?;
        let key = instance.id().to_string();

        let started = Instant::now();
        let result = self
            .breakers
            .execute(&key, || self.client.generate(&instance, payload))
            .await;

        match &result {
            // a fast-failed call never reached the worker; nothing to sample
            Err(DispatchError::CircuitOpen { .. }) => {}
            _ => self
                .metrics
                .record_outcome(&key, started.elapsed(), result.is_ok()),
        }
        result
    }
}

#[async_trait]
impl JobExecutor for Dispatcher {
    async fn execute(&self, role: &str, payload: &Value) -> DispatchResult<Value> {
        RetryExecutor::run(
            &self.retry_config,
            |_attempt| self.attempt(role, payload),
            |next_attempt, error, delay| {
                debug!(
                    role,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying worker call"
                );
            },
        )
        .await
    }
}
