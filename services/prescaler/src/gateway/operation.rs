//! Polling long-running node-pool operations to completion.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::gke::{ClusterLocation, Operation};
use super::{GatewayError, NodePoolApi};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first poll.
    pub base: Duration,

    /// Maximum delay between polls.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before poll number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// How long to keep polling and how fast.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub backoff: BackoffPolicy,
    /// Give up on an operation that has not finished after this long.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Polls `operation` until it reports `DONE`. A finished operation carrying
/// an error fails the call.
pub async fn wait_for_operation(
    api: &dyn NodePoolApi,
    location: &ClusterLocation,
    operation: Operation,
    policy: &PollPolicy,
) -> Result<(), GatewayError> {
    let name = operation.name.clone();
    let poll = async {
        let mut current = operation;
        let mut attempt = 0u32;
        while !current.is_done() {
            tokio::time::sleep(policy.backoff.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
            current = api.get_operation(location, &current.name).await?;
            debug!(operation = %current.name, status = %current.status, attempt, "Polled operation");
        }
        match current.failure() {
            Some(message) => Err(GatewayError::Operation {
                name: current.name,
                message,
            }),
            None => Ok(()),
        }
    };

    tokio::time::timeout(policy.timeout, poll)
        .await
        .map_err(|_| GatewayError::OperationTimeout {
            name,
            after: policy.timeout,
        })?
}
