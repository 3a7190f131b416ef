use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff for remote operations that can fail
/// transiently (SSH disconnects, intermittent exec failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the retry budget
/// is exhausted. Returns the value together with the number of retries it
/// took, so the caller can report a recovery exactly once.
pub async fn with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<(T, u32), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok((value, retries)),
            Err(err) if is_transient(&err) && retries < policy.max_retries => {
                retries += 1;
                tokio::time::sleep(policy.delay(retries)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
