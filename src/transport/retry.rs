//! Exponential, jittered backoff shared by upload/download/poll (spec
//! §4.3.2/§4.3.3). Bespoke to this protocol's specific bounds rather than a
//! generic HTTP retry-middleware crate.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::CancellationToken;
use crate::error::ExperimentError;

/// Run `op` up to `max_attempts` times, sleeping an exponentially increasing,
/// jittered interval between attempts starting at `base`. Stops early (and
/// returns `ExperimentError::Cancelled`) if `token` is cancelled while
/// sleeping. `is_retryable` decides whether a given error is worth retrying
/// at all.
pub async fn with_backoff<T, F, Fut>(
    max_attempts: u32,
    base: Duration,
    token: &CancellationToken,
    is_retryable: impl Fn(&ExperimentError) -> bool,
    mut op: F,
) -> Result<T, ExperimentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExperimentError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if token.is_cancelled() {
            return Err(ExperimentError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let interval = jittered(base * 2u32.pow(attempt - 1));
                warn!(attempt, ?interval, error = %e, "retrying after transient failure");
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => return Err(ExperimentError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Multiply `base` by a uniform random factor in `[1.0, 1.5)`.
fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..1.5);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Cap and backoff schedule for the status-polling loop (§4.3.3): start at
/// `initial`, multiply by this factor on each repeated `InProgress`, never
/// exceed `max`.
pub fn next_poll_interval(current: Duration, max: Duration) -> Duration {
    let doubled = current.mul_f64(1.5);
    doubled.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let (token, _handle) = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, ExperimentError> = with_backoff(
            3,
            Duration::from_millis(1),
            &token,
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ExperimentError::network(crate::error::NetworkErrorKind::Connect, "boom"))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let (token, _handle) = CancellationToken::new();
        let result: Result<u32, ExperimentError> = with_backoff(
            2,
            Duration::from_millis(1),
            &token,
            |_| true,
            || async { Err(ExperimentError::network(crate::error::NetworkErrorKind::Connect, "boom")) },
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn poll_interval_caps_at_max() {
        let mut interval = Duration::from_secs(2);
        for _ in 0..20 {
            interval = next_poll_interval(interval, Duration::from_secs(15));
        }
        assert_eq!(interval, Duration::from_secs(15));
    }
}
