//! Convergence polling and throttle retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use fleet_core::config::ConvergenceConfig;

use crate::error::{ErrorKind, ProviderError, ProviderResult};

// ── Polling ────────────────────────────────────────────────────────

/// Fast-then-slow polling schedule with a hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub fast_interval: Duration,
    pub fast_window: Duration,
    pub slow_interval: Duration,
    pub deadline: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &ConvergenceConfig) -> Self {
        Self {
            fast_interval: config.fast_interval(),
            fast_window: config.fast_window(),
            slow_interval: config.slow_interval(),
            deadline: config.deadline(),
        }
    }

    /// Interval to sleep after `elapsed` time spent waiting.
    pub fn interval_at(&self, elapsed: Duration) -> Duration {
        if elapsed < self.fast_window {
            self.fast_interval
        } else {
            self.slow_interval
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&ConvergenceConfig::default())
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    /// Still transitioning; carries the observed state for the timeout message.
    Pending(String),
}

/// Probe until ready or the deadline passes.
///
/// Probe errors end the wait immediately. A deadline overrun yields a
/// `Timeout` error naming `resource` and the last observed state.
pub async fn wait_until<T, F, Fut>(
    policy: &PollPolicy,
    resource: &str,
    mut probe: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<Poll<T>>>,
{
    let started = Instant::now();
    loop {
        let state = match probe().await? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending(state) => state,
        };
        let elapsed = started.elapsed();
        if elapsed >= policy.deadline {
            warn!(%resource, %state, ?elapsed, "convergence deadline exceeded");
            return Err(ProviderError::timeout(resource, &state));
        }
        let interval = policy.interval_at(elapsed);
        debug!(%resource, %state, ?interval, "waiting for convergence");
        sleep(interval.min(policy.deadline - elapsed)).await;
    }
}

// ── Throttle retry ─────────────────────────────────────────────────

const MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_FACTOR: f64 = 0.5;

/// Retry schedule for throttled calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// `None` retries until the call stops being throttled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Bounded retries for provisioning paths.
    pub fn provisioning(config: &ConvergenceConfig) -> Self {
        Self {
            base_delay: config.throttle_base_delay(),
            max_attempts: Some(config.throttle_max_attempts.max(1)),
        }
    }

    /// Unbounded retries for cleanup paths.
    pub fn cleanup(config: &ConvergenceConfig) -> Self {
        Self {
            base_delay: config.throttle_base_delay(),
            max_attempts: None,
        }
    }

    /// Exponential delay for the given attempt (1-based) plus random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.base_delay.mul_f64(2f64.powi(exp));
        let jitter = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
        delay.mul_f64(1.0 + jitter).min(MAX_DELAY)
    }
}

/// Run `op`, retrying while the provider reports throttling.
pub async fn retry_throttled<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is(ErrorKind::Throttled) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(%operation, attempt, "giving up on throttled call");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                debug!(%operation, attempt, ?delay, "throttled, backing off");
                sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> PollPolicy {
        PollPolicy {
            fast_interval: Duration::from_secs(1),
            fast_window: Duration::from_secs(30),
            slow_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
        }
    }

    #[test]
    fn interval_switches_after_fast_window() {
        let p = policy();
        assert_eq!(p.interval_at(Duration::from_secs(0)), Duration::from_secs(1));
        assert_eq!(p.interval_at(Duration::from_secs(29)), Duration::from_secs(1));
        assert_eq!(p.interval_at(Duration::from_secs(30)), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_ready() {
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        let value = wait_until(&policy(), "fn-a", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(if n < 3 { Poll::Pending("pending".into()) } else { Poll::Ready(n) })
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_last_state() {
        let started = Instant::now();
        let err = wait_until::<(), _, _>(&policy(), "fn-b", || async {
            Ok(Poll::Pending("Pending/InProgress".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("fn-b"));
        assert!(err.message.contains("Pending/InProgress"));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_end_the_wait() {
        let err = wait_until::<(), _, _>(&policy(), "fn-c", || async {
            Err(ProviderError::not_found("gone"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_calls_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_attempts: Some(5),
        };
        let result = retry_throttled(&policy, "create_queue", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::throttled("slow down"))
                } else {
                    Ok("queue-1")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "queue-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_attempts: Some(3),
        };
        let err = retry_throttled::<(), _, _>(&policy, "publish", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::throttled("slow down")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Throttled);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_attempts: None,
        };
        let err = retry_throttled::<(), _, _>(&policy, "delete", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::conflict("busy")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_attempts: None,
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(500) && first < Duration::from_millis(750));
        assert!(policy.delay_for(3) >= Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), MAX_DELAY);
    }
}
