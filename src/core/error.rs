//! Error types for the dispatch and resilience layer
//!
//! The retry executor only retries errors classified as transient; everything
//! else propagates immediately. `CircuitOpen` is a fast-fail signal and is
//! never counted as a new downstream failure.

/// Errors produced by the dispatch path
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid job input: {message}")]
    Validation { message: String },

    #[error("Transient failure: {message}")]
    Transient { message: String },

    #[error("Circuit open for destination {key}")]
    CircuitOpen { key: String },

    #[error("No healthy instance available for role {role}")]
    NoHealthyInstance { role: String },

    #[error("Instance pool exhausted while routing role {role}")]
    PoolExhausted { role: String },

    #[error("Job {id} exceeded {max_attempts} attempts: {last_error}")]
    AttemptsExceeded {
        id: String,
        max_attempts: u32,
        last_error: String,
    },

    #[error("Queue over capacity ({capacity} pending jobs)")]
    Backpressure { capacity: usize },

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Caller-forced retryable classification for an error the default
    /// predicate would treat as permanent.
    #[error(transparent)]
    Retryable(Box<DispatchError>),
}

impl DispatchError {
    /// Shorthand for a transient (retryable) failure
    pub fn transient(message: impl Into<String>) -> Self {
        DispatchError::Transient {
            message: message.into(),
        }
    }

    /// Shorthand for a validation (non-retryable) failure
    pub fn validation(message: impl Into<String>) -> Self {
        DispatchError::Validation {
            message: message.into(),
        }
    }

    /// Wrap any error so the retry executor treats it as retryable
    pub fn retryable(inner: DispatchError) -> Self {
        DispatchError::Retryable(Box::new(inner))
    }

    /// Classification consulted by the retry executor.
    ///
    /// Network resets, timeouts, rate limits and 5xx-like worker responses
    /// map to `Transient`. A `CircuitOpen` must short-circuit before any
    /// backoff sleep is scheduled, so it is never retryable here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Transient { .. } | DispatchError::Retryable(_)
        )
    }
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        assert!(DispatchError::transient("connection reset").is_retryable());
    }

    #[test]
    fn test_validation_is_not_retryable() {
        assert!(!DispatchError::validation("empty payload").is_retryable());
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let err = DispatchError::CircuitOpen {
            key: "worker-a".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_wrapper_overrides_classification() {
        let inner = DispatchError::validation("backend rejected schema");
        assert!(!inner.is_retryable());
        let wrapped = DispatchError::retryable(inner);
        assert!(wrapped.is_retryable());
        // transparent display: the wrapper does not change the message
        assert_eq!(
            wrapped.to_string(),
            "Invalid job input: backend rejected schema"
        );
    }

    #[test]
    fn test_display_messages() {
        let err = DispatchError::NoHealthyInstance {
            role: "judge".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No healthy instance available for role judge"
        );

        let err = DispatchError::Backpressure { capacity: 100 };
        assert_eq!(err.to_string(), "Queue over capacity (100 pending jobs)");

        let err = DispatchError::AttemptsExceeded {
            id: "job-1".to_string(),
            max_attempts: 3,
            last_error: "Transient failure: timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Job job-1 exceeded 3 attempts: Transient failure: timeout"
        );
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DispatchError>();
    }

    #[test]
    fn test_implements_std_error() {
        let err = DispatchError::JobNotFound {
            id: "missing".to_string(),
        };
        let _: &dyn Error = &err;
    }
}
