//! Call a fallible async operation until it succeeds, with capped exponential
//! backoff. The cap is jittered: once the doubling delay passes `max`, every
//! subsequent delay is drawn uniformly from `[max/2, max)` so that stalled
//! callers across a fleet drift apart instead of retrying in lockstep.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

use crate::metrics;

/// Retries `op` forever. There is no failure return and no cancellation: the
/// pipeline's liveness guarantee is that data waits out an outage rather than
/// being dropped, so the only way to stop a retry loop is to stop the process.
pub async fn retry<F, Fut, E>(mut op: F, initial: Duration, max: Duration, label: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut wait = initial;
    loop {
        let (elapsed, result) = timed(label, op()).await;
        let err = match result {
            Ok(()) => return,
            Err(err) => err,
        };
        if wait > max {
            metrics::MAX_RETRIES.with_label_values(&[label]).inc();
            let half = max / 2;
            wait = half + rand::thread_rng().gen_range(Duration::ZERO..half);
        }
        warn!(
            "call to {label} failed (error: {err}) after running for {elapsed:?}, will retry after {wait:?}"
        );
        metrics::RETRIES.with_label_values(&[label]).inc();
        tokio::time::sleep(wait).await;
        wait *= 2;
    }
}

async fn timed<Fut, E>(label: &str, attempt: Fut) -> (Duration, Result<(), E>)
where
    Fut: Future<Output = Result<(), E>>,
{
    let start = Instant::now();
    let result = attempt.await;
    let elapsed = start.elapsed();
    let success = if result.is_ok() { "true" } else { "false" };
    metrics::RETRY_RUNTIME
        .with_label_values(&[label, success])
        .observe(elapsed.as_secs_f64());
    (elapsed, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_after_first_success() {
        let calls = AtomicUsize::new(0);
        retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), std::io::Error>(())
            },
            Duration::from_millis(100),
            Duration::from_secs(300),
            "test_immediate",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        retry(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 4 {
                    Err(std::io::Error::other("nope"))
                } else {
                    Ok(())
                }
            },
            Duration::from_millis(100),
            Duration::from_secs(300),
            "test_eventual",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_draws_stay_below_max() {
        // After enough failures the doubled delay exceeds max and every later
        // wait comes from [max/2, max). With paused time this runs instantly
        // even though the simulated waits are minutes long.
        let calls = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();
        retry(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 12 {
                    Err(std::io::Error::other("nope"))
                } else {
                    Ok(())
                }
            },
            Duration::from_millis(100),
            Duration::from_secs(60),
            "test_ceiling",
        )
        .await;
        // 12 failures: doubling passes 60s after ~10 sleeps, the rest are
        // jittered ceiling draws. Total simulated time must stay under the
        // worst case of 12 * 60s.
        assert!(start.elapsed() < Duration::from_secs(12 * 60));
        assert_eq!(calls.load(Ordering::SeqCst), 13);
    }
}
