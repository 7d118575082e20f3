//! Exponential-backoff retry with an interrupt signal.
//!
//! The body reports `(interrupt, result)`; an interrupted attempt stops the
//! loop immediately instead of exhausting the remaining attempts.

use std::future::Future;
use std::time::Duration;

/// Retry policy: `attempts` tries, sleeping `base * 2^n` between them.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    attempts: u32,
    base: Duration,
}

impl ExponentialBackoff {
    pub fn new(attempts: u32, base_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base: Duration::from_millis(base_ms),
        }
    }

    /// Run `body` until it succeeds, interrupts, or attempts run out.
    pub async fn rupt_on<T, F, Fut>(&self, mut body: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = (bool, anyhow::Result<T>)>,
    {
        let mut last_err = None;
        for attempt in 0..self.attempts {
            let (interrupt, result) = body().await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if interrupt {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.base * (1 << attempt)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry attempts exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = ExponentialBackoff::new(3, 10)
            .rupt_on(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    (false, Err(anyhow::anyhow!("transient")))
                } else {
                    (false, Ok(n))
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_early() {
        let calls = AtomicU32::new(0);
        let err = ExponentialBackoff::new(3, 10)
            .rupt_on(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                (true, Err::<(), _>(anyhow::anyhow!("fatal")))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error() {
        let err = ExponentialBackoff::new(2, 10)
            .rupt_on(|| async { (false, Err::<(), _>(anyhow::anyhow!("still failing"))) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "still failing");
    }
}
