//! Bounded retries for writes that leave an event stranded when lost.

use std::future::Future;

use tracing::warn;

use super::DbError;
use crate::gateway::BackoffPolicy;

/// How often, and how patiently, a write is retried.
#[derive(Debug, Clone)]
pub struct WriteRetry {
    /// Total tries, the first one included.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WriteRetry {
    /// Runs `write` until it succeeds or attempts run out; the last error is
    /// returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut write: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 0;
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        write = what,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failure() -> DbError {
        DbError::Query(sqlx::Error::PoolTimedOut)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = WriteRetry::default()
            .run("status", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(failure())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let retry = WriteRetry {
            attempts: 3,
            ..Default::default()
        };
        let result: Result<(), _> = retry
            .run("status", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            })
            .await;

        assert!(matches!(result, Err(DbError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
