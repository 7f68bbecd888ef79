//! Worker instance abstraction
//!
//! A `WorkerInstance` is a backend endpoint bound to one model and eligible
//! for one or more logical roles (judge, prosecutor, defense counsel, ...).
//! The wire protocol is supplied by the surrounding application through the
//! [`InstanceClient`] trait; the core stays transport-agnostic.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{config::InstanceConfig, core::error::DispatchResult};

/// Unique identifier for a worker instance
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport seam to the inference backends.
///
/// `generate` executes one inference call; `probe` is the lightweight no-op
/// health check; `reconnect` recreates whatever client state the transport
/// keeps for the endpoint (used by `InstancePool::restart`).
#[async_trait]
pub trait InstanceClient: Send + Sync + fmt::Debug {
    /// Execute one inference request against the instance's endpoint
    async fn generate(&self, instance: &WorkerInstance, payload: &Value) -> DispatchResult<Value>;

    /// Lightweight health probe; `Ok(())` means usable
    async fn probe(&self, instance: &WorkerInstance) -> DispatchResult<()>;

    /// Recreate connection/client state for the endpoint
    async fn reconnect(&self, _instance: &WorkerInstance) -> DispatchResult<()> {
        Ok(())
    }
}

/// One registered backend worker
pub struct WorkerInstance {
    id: InstanceId,
    endpoint: String,
    bound_model: String,
    max_concurrent_requests: usize,
    description: Option<String>,
    healthy: AtomicBool,
    consecutive_probe_failures: AtomicU32,
    consecutive_probe_successes: AtomicU32,
    /// Unix millis of the last completed probe, 0 before the first probe
    last_health_check_ms: AtomicU64,
}

impl fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("bound_model", &self.bound_model)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl WorkerInstance {
    pub fn from_config(config: &InstanceConfig) -> Self {
        let id = if config.id.is_empty() {
            InstanceId::new()
        } else {
            InstanceId::from_string(config.id.clone())
        };
        Self {
            id,
            endpoint: config.endpoint.clone(),
            bound_model: config.bound_model.clone(),
            max_concurrent_requests: config.max_concurrent_requests,
            description: config.description.clone(),
            healthy: AtomicBool::new(false),
            consecutive_probe_failures: AtomicU32::new(0),
            consecutive_probe_successes: AtomicU32::new(0),
            last_health_check_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bound_model(&self) -> &str {
        &self.bound_model
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Time of the last completed probe
    pub fn last_health_check(&self) -> Option<SystemTime> {
        let ms = self.last_health_check_ms.load(Ordering::Acquire);
        (ms != 0).then(|| UNIX_EPOCH + Duration::from_millis(ms))
    }

    fn mark_probed(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_health_check_ms.store(now_ms, Ordering::Release);
    }

    /// Record a probe outcome and flip `healthy` once the configured
    /// consecutive threshold is crossed, so one flaky probe does not bounce
    /// the instance in and out of routing.
    pub(crate) fn record_probe(
        &self,
        success: bool,
        failure_threshold: u32,
        success_threshold: u32,
    ) {
        self.mark_probed();
        if success {
            self.consecutive_probe_failures.store(0, Ordering::Release);
            let successes = self
                .consecutive_probe_successes
                .fetch_add(1, Ordering::AcqRel)
                + 1;
            if !self.is_healthy() && successes >= success_threshold {
                self.set_healthy(true);
                self.consecutive_probe_successes.store(0, Ordering::Release);
            }
        } else {
            self.consecutive_probe_successes.store(0, Ordering::Release);
            let failures = self
                .consecutive_probe_failures
                .fetch_add(1, Ordering::AcqRel)
                + 1;
            if self.is_healthy() && failures >= failure_threshold {
                self.set_healthy(false);
                self.consecutive_probe_failures.store(0, Ordering::Release);
            }
        }
    }
}
