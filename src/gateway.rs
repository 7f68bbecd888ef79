//! Gateway composition root
//!
//! All collaborators are built here and handed to each other as constructor
//! parameters: metrics feed the status export, the breaker registry and the
//! instance pool feed the dispatcher, and the dispatcher is the queue's
//! executor. The gateway owns every background loop and stops them on
//! shutdown (and on drop).

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    config::GatewayConfig,
    core::{
        circuit_breaker::{CircuitBreakerRegistry, CircuitState},
        dispatcher::Dispatcher,
        error::DispatchResult,
        instance::{InstanceClient, InstanceId},
        job::{JobEvent, JobId, JobSpec, JobStatus},
        metrics::{MetricsAggregate, MetricsCollector, MetricsSweeper},
        pool::{HealthChecker, InstancePool, InstanceStatus},
        queue::{PriorityJobQueue, QueueStats, QueueTicker},
    },
};

/// In-process gateway over the dispatch and resilience stack
pub struct Gateway {
    config: GatewayConfig,
    queue: Arc<PriorityJobQueue>,
    pool: Arc<InstancePool>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsCollector>,
    loops: Mutex<Option<BackgroundLoops>>,
}

struct BackgroundLoops {
    ticker: QueueTicker,
    health_checker: HealthChecker,
    sweeper: MetricsSweeper,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("queue", &self.queue)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Gateway {
    /// Build the gateway and register every configured instance. Each
    /// registration runs its initial health probe before returning, so a
    /// started gateway routes only to instances that have been probed once.
    pub async fn new(
        config: GatewayConfig,
        client: Arc<dyn InstanceClient>,
    ) -> DispatchResult<Self> {
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let pool = Arc::new(InstancePool::new(
            client.clone(),
            config.health_check.clone(),
            config.fallback_order.clone(),
        ));

        for instance in &config.instances {
            pool.register_instance(instance).await?;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            client,
            config.retry.clone(),
        ));
        let queue = PriorityJobQueue::new(config.queue.clone(), dispatcher);

        Ok(Self {
            config,
            queue,
            pool,
            breakers,
            metrics,
            loops: Mutex::new(None),
        })
    }

    /// Start the dispatch ticker, the health-check loop, and the metrics
    /// sweeper. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock().expect("gateway loops lock poisoned");
        if loops.is_some() {
            return;
        }
        *loops = Some(BackgroundLoops {
            ticker: self.queue.start(),
            health_checker: self.pool.start_health_checker(),
            sweeper: self.metrics.start_sweeper(),
        });
        info!(
            instances = self.pool.len(),
            max_concurrent = self.config.queue.max_concurrent,
            "Gateway started"
        );
    }

    /// Stop all background loops. Active jobs run to completion on their own
    /// tasks; no new jobs are dispatched.
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock().expect("gateway loops lock poisoned");
        if let Some(loops) = loops.take() {
            loops.ticker.shutdown();
            loops.health_checker.shutdown();
            loops.sweeper.shutdown();
            info!("Gateway shut down");
        }
    }

    // Queue surface

    pub fn submit(&self, spec: JobSpec) -> DispatchResult<JobId> {
        self.queue.submit(spec)
    }

    pub fn job_status(&self, id: &JobId) -> Option<JobStatus> {
        self.queue.status(id)
    }

    pub fn cancel(&self, id: &JobId) -> bool {
        self.queue.cancel(id)
    }

    pub fn retry_failed(&self, id: &JobId) -> DispatchResult<()> {
        self.queue.retry_failed(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    // Operator surface

    pub fn reassign_role(&self, role: &str, instance_id: &InstanceId) -> DispatchResult<()> {
        self.pool.reassign_role(role, instance_id)
    }

    pub async fn restart_instance(&self, instance_id: &InstanceId) -> DispatchResult<()> {
        self.pool.restart(instance_id).await
    }

    pub fn breaker_state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.state(key)
    }

    pub fn reset_breaker(&self, key: &str) {
        self.breakers.reset(key);
    }

    pub fn force_open_breaker(&self, key: &str) {
        self.breakers.force_open(key);
    }

    /// Aggregate snapshot for external monitoring/health endpoints.
    /// Read-only; safe to poll.
    pub fn status(&self) -> GatewayStatus {
        let breakers = self
            .breakers
            .stats()
            .into_iter()
            .map(|(key, stats)| {
                (
                    key,
                    BreakerStatus {
                        state: stats.state.as_str().to_string(),
                        failure_count: stats.consecutive_failures,
                    },
                )
            })
            .collect();
        let window = Duration::from_secs(self.config.metrics.retention_secs);

        GatewayStatus {
            queue: self.queue.stats(),
            breakers,
            instances: self.pool.statuses(),
            metrics: self.metrics.aggregate(window, None),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Point-in-time system snapshot exported to monitoring
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub queue: QueueStats,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub instances: Vec<InstanceStatus>,
    pub metrics: MetricsAggregate,
}

/// Breaker view exposed through the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: String,
    pub failure_count: u32,
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::{config::InstanceConfig, core::instance::WorkerInstance};

    #[derive(Debug)]
    struct EchoClient;

    #[async_trait]
    impl InstanceClient for EchoClient {
        async fn generate(
            &self,
            instance: &WorkerInstance,
            payload: &Value,
        ) -> DispatchResult<Value> {
            Ok(json!({"instance": instance.id().as_str(), "echo": payload}))
        }

        async fn probe(&self, _instance: &WorkerInstance) -> DispatchResult<()> {
            Ok(())
        }
    }

    fn config_with_instances(ids: &[(&str, &[&str])]) -> GatewayConfig {
        GatewayConfig {
            instances: ids
                .iter()
                .map(|(id, roles)| InstanceConfig {
                    id: id.to_string(),
                    endpoint: format!("http://{id}:11434"),
                    bound_model: "llama2".to_string(),
                    roles: roles.iter().map(|r| r.to_string()).collect(),
                    max_concurrent_requests: 4,
                    description: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_registers_configured_instances() {
        let config = config_with_instances(&[("a", &["judge"]), ("b", &["prosecutor"])]);
        let gateway = Gateway::new(config, Arc::new(EchoClient)).await.unwrap();

        let status = gateway.status();
        assert_eq!(status.instances.len(), 2);
        assert!(status.instances.iter().all(|i| i.healthy));
        assert_eq!(status.queue.pending, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_clears() {
        let gateway = Gateway::new(config_with_instances(&[("a", &["judge"])]), Arc::new(EchoClient))
            .await
            .unwrap();
        gateway.start();
        gateway.start();
        gateway.shutdown();
        // restartable after shutdown
        gateway.start();
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_status_snapshot_serializes() {
        let gateway = Gateway::new(config_with_instances(&[("a", &["judge"])]), Arc::new(EchoClient))
            .await
            .unwrap();
        gateway
            .submit(JobSpec::new("judge", json!({"prompt": "opening statement"})))
            .unwrap();

        let snapshot = serde_json::to_value(gateway.status()).unwrap();
        assert_eq!(snapshot["queue"]["pending"], 1);
        assert_eq!(snapshot["instances"][0]["id"], "a");
        assert_eq!(snapshot["instances"][0]["assigned_roles"][0], "judge");
        assert_eq!(snapshot["metrics"]["request_count"], 0);
    }

    #[tokio::test]
    async fn test_operator_breaker_surface() {
        let gateway = Gateway::new(config_with_instances(&[("a", &["judge"])]), Arc::new(EchoClient))
            .await
            .unwrap();
        assert!(gateway.breaker_state("a").is_none());

        gateway.force_open_breaker("a");
        assert_eq!(gateway.breaker_state("a"), Some(CircuitState::Open));

        gateway.reset_breaker("a");
        assert_eq!(gateway.breaker_state("a"), Some(CircuitState::Closed));
    }
}
