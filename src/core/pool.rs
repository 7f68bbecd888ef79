//! Instance pool: health-checked worker registry with role routing
//!
//! Roles map to at most one assigned instance at a time. Routing may fall
//! back to a different healthy instance at read time without changing the
//! assignment; reclaiming a role always requires an explicit
//! `reassign_role`.

use std::{
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{HealthCheckConfig, InstanceConfig},
    core::{
        error::{DispatchError, DispatchResult},
        instance::{InstanceClient, InstanceId, WorkerInstance},
    },
};

/// Registry of worker instances with role-based routing
pub struct InstancePool {
    instances: DashMap<InstanceId, Arc<WorkerInstance>>,
    /// Role -> currently assigned instance. DashMap entry updates are atomic
    /// per key, so a reader observes the mapping strictly before or strictly
    /// after a reassignment, never a torn state.
    role_map: DashMap<String, InstanceId>,
    /// Registration order, the default deterministic fallback sequence
    registration_order: Mutex<Vec<InstanceId>>,
    /// Explicit fallback priority from configuration; takes precedence over
    /// registration order when non-empty
    fallback_order: Vec<InstanceId>,
    client: Arc<dyn InstanceClient>,
    health_config: HealthCheckConfig,
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("instances", &self.instances.len())
            .field("roles", &self.role_map.len())
            .finish()
    }
}

impl InstancePool {
    pub fn new(
        client: Arc<dyn InstanceClient>,
        health_config: HealthCheckConfig,
        fallback_order: Vec<String>,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            role_map: DashMap::new(),
            registration_order: Mutex::new(Vec::new()),
            fallback_order: fallback_order
                .into_iter()
                .map(InstanceId::from_string)
                .collect(),
            client,
            health_config,
        }
    }

    /// Register a worker instance and perform its initial health probe.
    ///
    /// The instance only becomes eligible for routing once the initial probe
    /// succeeds; a failed probe registers it unhealthy and the periodic
    /// health loop will pick it up later.
    pub async fn register_instance(&self, config: &InstanceConfig) -> DispatchResult<InstanceId> {
        if config.endpoint.is_empty() {
            return Err(DispatchError::validation("instance endpoint is empty"));
        }

        let instance = Arc::new(WorkerInstance::from_config(config));
        let id = instance.id().clone();

        match self.probe_instance(&instance).await {
            Ok(()) => {
                instance.set_healthy(true);
                info!(instance = %id, endpoint = %instance.endpoint(), "Instance registered healthy");
            }
            Err(err) => {
                warn!(instance = %id, endpoint = %instance.endpoint(), error = %err,
                    "Initial health probe failed; instance registered unhealthy");
            }
        }

        for role in &config.roles {
            self.role_map.insert(role.clone(), id.clone());
        }
        self.instances.insert(id.clone(), instance);
        self.registration_order
            .lock()
            .expect("registration order lock poisoned")
            .push(id.clone());

        Ok(id)
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<WorkerInstance>> {
        self.instances.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Roles currently assigned to an instance
    pub fn assigned_roles(&self, id: &InstanceId) -> Vec<String> {
        let mut roles: Vec<String> = self
            .role_map
            .iter()
            .filter(|entry| entry.value() == id)
            .map(|entry| entry.key().clone())
            .collect();
        roles.sort();
        roles
    }

    /// Resolve a role to a healthy instance.
    ///
    /// Prefers the assigned instance; degrades to the deterministic fallback
    /// order (explicit configuration list, else registration order) when the
    /// assignment is unhealthy or missing.
    pub fn route_for_role(&self, role: &str) -> DispatchResult<Arc<WorkerInstance>> {
        let assigned = self.role_map.get(role).map(|entry| entry.value().clone());

        if let Some(ref id) = assigned
            && let Some(instance) = self.get(id)
            && instance.is_healthy()
        {
            return Ok(instance);
        }

        for id in self.fallback_candidates() {
            if let Some(instance) = self.get(&id)
                && instance.is_healthy()
            {
                debug!(role, assigned = ?assigned, fallback = %id, "Routing role to fallback instance");
                return Ok(instance);
            }
        }

        if self.instances.is_empty() {
            Err(DispatchError::NoHealthyInstance {
                role: role.to_string(),
            })
        } else {
            Err(DispatchError::PoolExhausted {
                role: role.to_string(),
            })
        }
    }

    fn fallback_candidates(&self) -> Vec<InstanceId> {
        if !self.fallback_order.is_empty() {
            return self.fallback_order.clone();
        }
        self.registration_order
            .lock()
            .expect("registration order lock poisoned")
            .clone()
    }

    /// Atomically move a role to the target instance's assignment set
    pub fn reassign_role(&self, role: &str, instance_id: &InstanceId) -> DispatchResult<()> {
        if !self.instances.contains_key(instance_id) {
            return Err(DispatchError::InstanceNotFound {
                id: instance_id.to_string(),
            });
        }
        let previous = self.role_map.insert(role.to_string(), instance_id.clone());
        info!(role, from = ?previous, to = %instance_id, "Role reassigned");
        Ok(())
    }

    /// Recreate the instance's client state and re-probe immediately
    pub async fn restart(&self, instance_id: &InstanceId) -> DispatchResult<()> {
        let instance = self
            .get(instance_id)
            .ok_or_else(|| DispatchError::InstanceNotFound {
                id: instance_id.to_string(),
            })?;

        info!(instance = %instance_id, "Restarting instance client");
        self.client.reconnect(&instance).await?;

        match self.probe_instance(&instance).await {
            Ok(()) => {
                instance.set_healthy(true);
                Ok(())
            }
            Err(err) => {
                instance.set_healthy(false);
                warn!(instance = %instance_id, error = %err, "Post-restart probe failed");
                Ok(())
            }
        }
    }

    /// One probe with the configured timeout. Errors are returned to the
    /// caller for logging; they are never propagated out of the health loop.
    async fn probe_instance(&self, instance: &WorkerInstance) -> DispatchResult<()> {
        let timeout = Duration::from_secs(self.health_config.timeout_secs);
        match tokio::time::timeout(timeout, self.client.probe(instance)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::transient(format!(
                "health probe timed out after {}s for {}",
                self.health_config.timeout_secs,
                instance.endpoint()
            ))),
        }
    }

    /// Probe every registered instance in parallel, flipping health flags
    /// through the consecutive-outcome thresholds.
    async fn probe_all(&self) {
        let instances: Vec<Arc<WorkerInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let probes = instances.iter().map(|instance| async {
            let result = self.probe_instance(instance).await;
            if let Err(ref err) = result {
                debug!(instance = %instance.id(), error = %err, "Health probe failed");
            }
            instance.record_probe(
                result.is_ok(),
                self.health_config.failure_threshold,
                self.health_config.success_threshold,
            );
        });
        futures::future::join_all(probes).await;
    }

    /// Start the periodic health-check loop. The loop stops when the handle
    /// is shut down or the pool is dropped.
    pub fn start_health_checker(self: &Arc<Self>) -> HealthChecker {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let pool: Weak<InstancePool> = Arc::downgrade(self);
        let interval_secs = self.health_config.check_interval_secs.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                if shutdown_flag.load(Ordering::Acquire) {
                    debug!("Pool health checker shutting down");
                    break;
                }
                let Some(pool) = pool.upgrade() else { break };
                pool.probe_all().await;
            }
        });

        HealthChecker { handle, shutdown }
    }

    /// Per-instance view for the status export
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .instances
            .iter()
            .map(|entry| {
                let instance = entry.value();
                InstanceStatus {
                    id: instance.id().to_string(),
                    endpoint: instance.endpoint().to_string(),
                    bound_model: instance.bound_model().to_string(),
                    healthy: instance.is_healthy(),
                    assigned_roles: self.assigned_roles(instance.id()),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}

/// Instance view exposed through the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub endpoint: String,
    pub bound_model: String,
    pub healthy: bool,
    pub assigned_roles: Vec<String>,
}

/// Health checker task handle with graceful shutdown
pub struct HealthChecker {
    handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl HealthChecker {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;

    /// Probe stub whose per-instance outcome can be flipped at runtime
    #[derive(Debug, Default)]
    struct StubClient {
        failing: DashMap<String, bool>,
        probes: AtomicU32,
        reconnects: AtomicU32,
    }

    impl StubClient {
        fn set_failing(&self, id: &str, failing: bool) {
            self.failing.insert(id.to_string(), failing);
        }
    }

    #[async_trait]
    impl InstanceClient for StubClient {
        async fn generate(
            &self,
            _instance: &WorkerInstance,
            _payload: &Value,
        ) -> DispatchResult<Value> {
            Ok(json!({"text": "ok"}))
        }

        async fn probe(&self, instance: &WorkerInstance) -> DispatchResult<()> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            let failing = self
                .failing
                .get(instance.id().as_str())
                .map(|v| *v)
                .unwrap_or(false);
            if failing {
                Err(DispatchError::transient("probe refused"))
            } else {
                Ok(())
            }
        }

        async fn reconnect(&self, _instance: &WorkerInstance) -> DispatchResult<()> {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn instance_config(id: &str, roles: &[&str]) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            endpoint: format!("http://{id}:11434"),
            bound_model: "llama2".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            max_concurrent_requests: 4,
            description: None,
        }
    }

    fn pool_with(client: Arc<StubClient>, fallback: Vec<String>) -> Arc<InstancePool> {
        Arc::new(InstancePool::new(
            client,
            HealthCheckConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout_secs: 5,
                check_interval_secs: 30,
            },
            fallback,
        ))
    }

    #[tokio::test]
    async fn test_register_and_route() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client, vec![]);

        let id = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "a");

        let routed = pool.route_for_role("judge").unwrap();
        assert_eq!(routed.id().as_str(), "a");
        assert_eq!(pool.assigned_roles(&id), vec!["judge"]);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_endpoint() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client, vec![]);
        let mut config = instance_config("a", &[]);
        config.endpoint = String::new();
        assert!(matches!(
            pool.register_instance(&config).await,
            Err(DispatchError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_initial_probe_registers_unhealthy() {
        let client = Arc::new(StubClient::default());
        client.set_failing("a", true);
        let pool = pool_with(client, vec![]);

        let id = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        assert!(!pool.get(&id).unwrap().is_healthy());
        assert!(matches!(
            pool.route_for_role("judge"),
            Err(DispatchError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_fallback_to_other_healthy_instance() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client.clone(), vec![]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        pool.register_instance(&instance_config("b", &["prosecutor"]))
            .await
            .unwrap();

        pool.get(&a).unwrap().set_healthy(false);

        let routed = pool.route_for_role("judge").unwrap();
        assert_eq!(routed.id().as_str(), "b");
        // fallback does not change the assignment
        assert_eq!(pool.assigned_roles(&a), vec!["judge"]);
    }

    #[tokio::test]
    async fn test_explicit_fallback_order_wins() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client, vec!["c".to_string(), "b".to_string()]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        pool.register_instance(&instance_config("b", &[])).await.unwrap();
        pool.register_instance(&instance_config("c", &[])).await.unwrap();

        pool.get(&a).unwrap().set_healthy(false);
        let routed = pool.route_for_role("judge").unwrap();
        assert_eq!(routed.id().as_str(), "c");
    }

    #[tokio::test]
    async fn test_empty_pool_vs_exhausted_pool_errors() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client.clone(), vec![]);

        assert!(matches!(
            pool.route_for_role("judge"),
            Err(DispatchError::NoHealthyInstance { .. })
        ));

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        pool.get(&a).unwrap().set_healthy(false);
        assert!(matches!(
            pool.route_for_role("judge"),
            Err(DispatchError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_reassign_role() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client, vec![]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        let b = pool.register_instance(&instance_config("b", &[])).await.unwrap();

        pool.reassign_role("judge", &b).unwrap();
        assert_eq!(pool.route_for_role("judge").unwrap().id(), &b);
        assert!(pool.assigned_roles(&a).is_empty());

        let missing = InstanceId::from_string("nope");
        assert!(matches!(
            pool.reassign_role("judge", &missing),
            Err(DispatchError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_recovered_instance_does_not_reclaim_role() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client.clone(), vec![]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        pool.register_instance(&instance_config("b", &[])).await.unwrap();

        client.set_failing("a", true);
        pool.probe_all().await;
        assert!(!pool.get(&a).unwrap().is_healthy());
        assert_eq!(pool.route_for_role("judge").unwrap().id().as_str(), "b");

        // instance recovers but the assignment is unchanged; routing still
        // prefers it only because it is the assigned instance again
        client.set_failing("a", false);
        pool.probe_all().await;
        assert!(pool.get(&a).unwrap().is_healthy());
        assert_eq!(pool.assigned_roles(&a), vec!["judge"]);
    }

    #[tokio::test]
    async fn test_restart_reconnects_and_reprobes() {
        let client = Arc::new(StubClient::default());
        client.set_failing("a", true);
        let pool = pool_with(client.clone(), vec![]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        assert!(!pool.get(&a).unwrap().is_healthy());

        client.set_failing("a", false);
        pool.restart(&a).await.unwrap();
        assert_eq!(client.reconnects.load(Ordering::Relaxed), 1);
        assert!(pool.get(&a).unwrap().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_flips_unhealthy() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client.clone(), vec![]);

        let a = pool
            .register_instance(&instance_config("a", &["judge"]))
            .await
            .unwrap();
        assert!(pool.get(&a).unwrap().is_healthy());

        let checker = pool.start_health_checker();
        client.set_failing("a", true);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!pool.get(&a).unwrap().is_healthy());
        checker.shutdown();
    }

    #[tokio::test]
    async fn test_statuses() {
        let client = Arc::new(StubClient::default());
        let pool = pool_with(client, vec![]);
        pool.register_instance(&instance_config("a", &["judge", "prosecutor"]))
            .await
            .unwrap();

        let statuses = pool.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].healthy);
        assert_eq!(statuses[0].assigned_roles, vec!["judge", "prosecutor"]);
    }
}
