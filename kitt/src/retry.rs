//! Exponential backoff for transient failures. Only `KittError::Transient`
//! is retried; every other error returns immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::KittError;

#[derive(Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before attempt `n` (1-based beyond the first try).
    fn delay(&self, n: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(n.saturating_sub(1)));
        exp.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or attempts run out.
pub async fn retry<T, F, Fut>(policy: &Backoff, mut op: F) -> Result<T, KittError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KittError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(KittError::Transient(msg)) => {
                attempt += 1;
                if attempt >= policy.attempts {
                    return Err(KittError::Transient(format!(
                        "{msg} (gave up after {attempt} attempts)"
                    )));
                }
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, ?delay, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempts: 4,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = retry(&fast(), move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(KittError::Transient("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Result<(), _> = retry(&fast(), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(KittError::NotFound("x".into()))
            }
        })
        .await;
        assert!(matches!(out, Err(KittError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_cap() {
        let out: Result<(), _> = retry(&fast(), || async {
            Err(KittError::Transient("busy".into()))
        })
        .await;
        match out {
            Err(KittError::Transient(msg)) => assert!(msg.contains("gave up")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn delays_are_capped() {
        let policy = Backoff {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            attempts: 10,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(8), Duration::from_millis(300));
    }
}
