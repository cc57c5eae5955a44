//! Transport-level retry and backoff for hwinv uploads
//!
//! The reporting sink performs exactly one logical upload per call. Anything
//! that retries lives below it, in the transport, and goes through this crate
//! so every transport classifies and spaces out its attempts the same way.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use backoff::ExponentialBackoff;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' gave up after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// The underlying failure, whichever variant carries it
    pub fn source_message(&self) -> String {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source.to_string(),
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Upper bound on attempts regardless of the elapsed-time budget
pub const MAX_ATTEMPTS: usize = 5;

/// Execute an operation with a custom backoff policy
///
/// `f` receives the 1-based attempt number. `Transient` errors are retried
/// until the policy runs out of elapsed time or [`MAX_ATTEMPTS`] is reached;
/// `Permanent` errors are returned on the spot.
pub async fn with_custom_backoff<F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation = op_name, attempt, error = %err, "operation failed permanently");
                return Err(err);
            }
            Err(err) => {
                warn!(operation = op_name, attempt, error = %err, "operation failed");

                let delay = match policy.next_backoff() {
                    Some(delay) if attempt < MAX_ATTEMPTS => delay,
                    _ => {
                        return Err(RetryError::MaxRetriesExceeded {
                            operation: op_name,
                            attempts: attempt,
                            source: err.source_message().into(),
                        });
                    }
                };

                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

#[cfg(feature = "async-rt")]
async fn sleep(delay: Duration) {
    tokio::time::sleep(delay).await;
}

#[cfg(not(feature = "async-rt"))]
async fn sleep(delay: Duration) {
    std::thread::sleep(delay);
}

/// Backoff policy for uploads to the collection service
pub fn transport_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(20)))
        .with_multiplier(2.0)
        .build()
}

/// Tight policy for tests and loopback endpoints
pub fn fast_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(1))
        .with_max_interval(Duration::from_millis(5))
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(Some(Duration::from_secs(1)))
        .with_multiplier(2.0)
        .build()
}

/// Trait for categorizing errors as transient or permanent
#[async_trait]
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wrap an error as `Transient` or `Permanent` according to its classification
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}
