//! Classification of handler failures and retry backoff.

use std::time::Duration;

use tracing::{error, warn};

use crate::handler::Retryable;

/// Exponential backoff with a bounded number of retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackOff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Retries allowed after the first failure. Zero disables retrying.
    pub max_attempts: u32,
}

impl Default for BackOff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl BackOff {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial: interval,
            multiplier: 1.0,
            max_interval: interval,
            max_attempts,
        }
    }

    pub fn none() -> Self {
        Self::fixed(Duration::ZERO, 0)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the budget
    /// is spent.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let millis = (self.initial.as_millis() as f64 * factor)
            .min(self.max_interval.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// Everything an error handler may look at when deciding.
#[derive(Debug)]
pub struct DispatchFailure<'a> {
    pub endpoint_id: &'a str,
    pub error: &'a anyhow::Error,
    pub topic: &'a str,
    pub partition: i32,
    /// Offset of the failed record, or of the first record of a failed batch.
    pub offset: i64,
    /// 1 for the first delivery.
    pub attempt: u32,
    pub batch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Redeliver the same record or batch after the delay.
    Retry(Duration),
    /// Treat the delivery as consumed and commit past it.
    Skip,
    /// Terminal: the container moves to FAILED.
    Fail,
}

pub trait ErrorHandler: Send + Sync {
    fn decide(&self, failure: &DispatchFailure<'_>) -> ErrorDecision;
}

/// Retries errors marked [`Retryable`] until the backoff budget is spent;
/// every other error is terminal.
#[derive(Debug, Clone, Default)]
pub struct DefaultErrorHandler {
    pub backoff: BackOff,
}

impl DefaultErrorHandler {
    pub fn new(backoff: BackOff) -> Self {
        Self { backoff }
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn decide(&self, failure: &DispatchFailure<'_>) -> ErrorDecision {
        if !Retryable::is_retryable(failure.error) {
            return ErrorDecision::Fail;
        }
        match self.backoff.delay(failure.attempt) {
            Some(delay) => {
                warn!(
                    "Listener '{}' failed on {}-{}@{} (attempt {}), retrying in {:?}: {:#}",
                    failure.endpoint_id,
                    failure.topic,
                    failure.partition,
                    failure.offset,
                    failure.attempt,
                    delay,
                    failure.error
                );
                ErrorDecision::Retry(delay)
            }
            None => ErrorDecision::Fail,
        }
    }
}

/// Logs the failure and moves on. The container never fails because of the
/// handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn decide(&self, failure: &DispatchFailure<'_>) -> ErrorDecision {
        error!(
            "Listener '{}' failed on {}-{}@{}, skipping: {:#}",
            failure.endpoint_id, failure.topic, failure.partition, failure.offset, failure.error
        );
        ErrorDecision::Skip
    }
}
