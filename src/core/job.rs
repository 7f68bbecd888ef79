//! Job model for the priority queue
//!
//! A job is one inference request: a payload destined for the instance
//! serving a logical role, with a priority and a bounded attempt budget.

use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::DispatchError;

/// Unique job identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct JobId(String);

impl JobId {
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

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-facing submission parameters
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Optional caller-chosen id; generated when `None`
    pub id: Option<String>,
    pub payload: Value,
    pub priority: i32,
    /// Logical role whose instance should execute the call
    pub role: String,
    /// Attempt budget; queue default when `None`
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn new(role: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            payload,
            priority: 0,
            role: role.into(),
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Job lifecycle state.
///
/// Transitions are `Pending -> Active -> {Completed | Pending | Failed}`;
/// terminal states are never re-entered except by explicit operator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Internal job record tracked by the queue
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: Value,
    /// Effective priority, including any aging boosts from requeues
    pub priority: i32,
    /// Priority as originally submitted
    pub submitted_priority: i32,
    pub role: String,
    pub created_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<DispatchError>,
    /// When the job reached a terminal state, for TTL cleanup
    pub settled_at: Option<Instant>,
}

impl Job {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Read-only job view returned by status queries
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub priority: i32,
    pub role: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            state: job.state,
            priority: job.priority,
            role: job.role.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Outcome notification delivered to subscribers
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A queue-level attempt is starting; fraction is attempts over budget
    Progress { id: JobId, fraction: f64 },
    Completed { id: JobId, result: Value },
    Failed { id: JobId, error: DispatchError },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Progress { id, .. }
            | JobEvent::Completed { id, .. }
            | JobEvent::Failed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = JobSpec::new("judge", json!({"prompt": "rule on the objection"}))
            .with_priority(5)
            .with_max_attempts(2)
            .with_id("job-1");
        assert_eq!(spec.role, "judge");
        assert_eq!(spec.priority, 5);
        assert_eq!(spec.max_attempts, Some(2));
        assert_eq!(spec.id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_status_from_job() {
        let job = Job {
            id: JobId::from_string("job-1"),
            payload: json!({}),
            priority: 7,
            submitted_priority: 5,
            role: "prosecutor".to_string(),
            created_at: Instant::now(),
            attempts: 2,
            max_attempts: 3,
            state: JobState::Pending,
            last_error: Some(DispatchError::transient("timeout")),
            settled_at: None,
        };
        let status = JobStatus::from(&job);
        assert_eq!(status.id, "job-1");
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.attempts, 2);
        assert_eq!(status.last_error.as_deref(), Some("Transient failure: timeout"));
    }

    #[test]
    fn test_event_job_id() {
        let id = JobId::from_string("j");
        let event = JobEvent::Progress {
            id: id.clone(),
            fraction: 0.5,
        };
        assert_eq!(event.job_id(), &id);
    }
}
