//! callback-dispatcher: in-process delivery of delayed link callbacks.
//!
//! Purpose
//! - Implement the domain `CallbackScheduler` port on top of tokio timers and
//!   a shared `reqwest` client.
//! - Each scheduled task runs on its own tokio task: it sleeps until its
//!   `fire_at`, then makes up to `max_attempts` HTTP requests with
//!   exponential backoff between them. One slow or unreachable target never
//!   holds up another task.
//!
//! Guarantees
//! - A callback never fires before its `fire_at`. Lateness is bounded by the
//!   tokio timer (millisecond granularity) plus runtime load; treat it as ±1s.
//! - Best effort only: tasks live in memory and are lost on restart. A task
//!   that exhausts its attempts is dropped and reported through `tracing` at
//!   `error` level and the `dropped` counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use domain::{CallbackScheduler, CallbackTask};
use reqwest::Method;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn, Instrument};

/// Retry and timeout settings for callback delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per task, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single HTTP attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (1-based):
    /// `initial_backoff * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exp)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Method used for callbacks. GET and HEAD are sent without a body.
    pub method: Method,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            method: Method::POST,
            retry: RetryPolicy::default(),
            user_agent: format!("callback-dispatcher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("HTTP client could not be constructed: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("callback dispatcher must be created inside a tokio runtime")]
    NoRuntime,
}

/// Failure of a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("callback attempt timed out")]
    Timeout,
    #[error("callback transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("callback target answered {0}")]
    Status(u16),
}

/// Point-in-time counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub scheduled: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    in_flight: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// JSON body sent with callbacks.
#[derive(Debug, Serialize)]
struct CallbackBody<'a> {
    state: Option<&'a str>,
    timestamp: String,
    attempt: u32,
}

struct Inner {
    client: reqwest::Client,
    config: DispatcherConfig,
    runtime: Handle,
    counters: Counters,
}

/// Tokio-backed `CallbackScheduler`. Cheap to clone; clones share the client,
/// runtime handle, and counters.
#[derive(Clone)]
pub struct CallbackDispatcher {
    inner: Arc<Inner>,
}

impl CallbackDispatcher {
    /// Build a dispatcher bound to the current tokio runtime.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatcherError> {
        let runtime = Handle::try_current().map_err(|_| DispatcherError::NoRuntime)?;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(DispatcherError::ClientBuild)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                runtime,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }
}

impl CallbackScheduler for CallbackDispatcher {
    fn schedule(&self, task: CallbackTask) {
        let counters = &self.inner.counters;
        counters.scheduled.fetch_add(1, Ordering::Relaxed);
        counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let span = tracing::info_span!("callback", url = %task.callback_url);
        // Moved into the future so the count drops even if it never completes.
        let guard = InFlight(Arc::clone(&self.inner));
        self.inner
            .runtime
            .spawn(async move { guard.0.run(task).await }.instrument(span));
    }
}

/// Holds one `in_flight` slot for the lifetime of a delivery task, including
/// tasks dropped at runtime shutdown or unwound by a panic.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Inner {
    async fn run(&self, mut task: CallbackTask) {
        // Wall-clock wait; a zero result means the task is already due.
        let wait = task
            .fire_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let policy = &self.config.retry;
        let delivered = loop {
            task.attempt_count += 1;
            match self.attempt(&task).await {
                Ok(status) => {
                    info!(attempt = task.attempt_count, status, "callback delivered");
                    break true;
                }
                Err(e) => {
                    warn!(attempt = task.attempt_count, err = %e, "callback attempt failed");
                    if task.attempt_count >= policy.max_attempts {
                        break false;
                    }
                    tokio::time::sleep(policy.backoff(task.attempt_count)).await;
                }
            }
        };

        if delivered {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            error!(attempts = task.attempt_count, "callback dropped after exhausting retries");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn attempt(&self, task: &CallbackTask) -> Result<u16, DeliveryError> {
        let method = self.config.method.clone();
        let sends_body = method != Method::GET && method != Method::HEAD;

        let mut req = self
            .client
            .request(method, &task.callback_url)
            .timeout(self.config.retry.attempt_timeout);
        if sends_body {
            req = req.json(&callback_body(task, SystemTime::now()));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Transport(e)
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

fn callback_body(task: &CallbackTask, now: SystemTime) -> CallbackBody<'_> {
    CallbackBody {
        state: task.state.as_deref(),
        timestamp: http_common::system_time_to_rfc3339(now),
        attempt: task.attempt_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::Method;
    use std::time::{Instant, UNIX_EPOCH};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
            attempt_timeout: Duration::from_millis(500),
        }
    }

    fn dispatcher(retry: RetryPolicy) -> CallbackDispatcher {
        CallbackDispatcher::new(DispatcherConfig {
            retry,
            ..DispatcherConfig::default()
        })
        .unwrap()
    }

    /// Poll until `done` holds or `limit` passes; returns the final stats.
    async fn wait_for(
        d: &CallbackDispatcher,
        limit: Duration,
        done: impl Fn(&DispatchStats) -> bool,
    ) -> DispatchStats {
        let start = Instant::now();
        loop {
            let s = d.stats();
            if done(&s) || start.elapsed() > limit {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.attempt_timeout, Duration::from_secs(5));
        assert_eq!(DispatcherConfig::default().method, Method::POST);
    }

    #[test]
    fn new_outside_runtime_fails() {
        let err = CallbackDispatcher::new(DispatcherConfig::default()).err();
        assert!(matches!(err, Some(DispatcherError::NoRuntime)));
    }

    #[test]
    fn body_carries_state_timestamp_and_attempt() {
        let mut task = CallbackTask::new("https://h/cb".into(), UNIX_EPOCH, Some("u-7".into()));
        task.attempt_count = 2;
        let body = callback_body(&task, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"state": "u-7", "timestamp": "2023-11-14T22:13:20Z", "attempt": 2})
        );
    }

    #[test]
    fn runtime_shutdown_releases_in_flight() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let d = rt.block_on(async {
            let d = dispatcher(fast_policy(1));
            d.schedule(CallbackTask::new(
                "http://127.0.0.1:9/later".into(),
                SystemTime::now() + Duration::from_secs(3600),
                None,
            ));
            // Let the task start and park on its timer.
            tokio::task::yield_now().await;
            d
        });
        assert_eq!(d.stats().in_flight, 1);

        drop(rt);
        let stats = d.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.delivered + stats.dropped, 0);
    }

    #[tokio::test]
    async fn delivers_once_after_fire_at() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cb")
                    .header("content-type", "application/json");
                then.status(204);
            })
            .await;

        let d = dispatcher(fast_policy(3));
        let start = Instant::now();
        d.schedule(CallbackTask::new(
            server.url("/cb"),
            SystemTime::now() + Duration::from_secs(1),
            Some("s1".into()),
        ));

        // Nothing may arrive early.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(d.stats().delivered, 0);

        let stats = wait_for(&d, Duration::from_secs(5), |s| s.delivered == 1).await;
        let elapsed = start.elapsed();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.in_flight, 0);
        assert!(elapsed >= Duration::from_millis(950), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "fired late: {elapsed:?}");
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn past_fire_at_is_delivered_immediately() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/now");
                then.status(200);
            })
            .await;

        let d = dispatcher(fast_policy(1));
        d.schedule(CallbackTask::new(server.url("/now"), UNIX_EPOCH, None));
        let stats = wait_for(&d, Duration::from_secs(2), |s| s.delivered == 1).await;
        assert_eq!(stats.delivered, 1);
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn retries_non_2xx_up_to_ceiling_then_drops() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/flaky");
                then.status(503);
            })
            .await;

        let d = dispatcher(fast_policy(3));
        d.schedule(CallbackTask::new(server.url("/flaky"), SystemTime::now(), None));
        let stats = wait_for(&d, Duration::from_secs(3), |s| s.dropped == 1).await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.in_flight, 0);
        mock.assert_calls_async(3).await;
    }

    #[tokio::test]
    async fn unreachable_target_is_dropped() {
        let d = dispatcher(fast_policy(2));
        // Port 9 (discard) is not expected to be listening on loopback.
        d.schedule(CallbackTask::new(
            "http://127.0.0.1:9/cb".into(),
            SystemTime::now(),
            None,
        ));
        let stats = wait_for(&d, Duration::from_secs(5), |s| s.dropped == 1).await;
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn slow_target_does_not_block_others() {
        let server = MockServer::start_async().await;
        let slow = server
            .mock_async(|when, then| {
                when.method(POST).path("/slow");
                then.status(200).delay(Duration::from_secs(2));
            })
            .await;
        let fast = server
            .mock_async(|when, then| {
                when.method(POST).path("/fast");
                then.status(200);
            })
            .await;

        let d = dispatcher(RetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            ..fast_policy(1)
        });
        let now = SystemTime::now();
        d.schedule(CallbackTask::new(server.url("/slow"), now, None));
        d.schedule(CallbackTask::new(server.url("/fast"), now, None));

        let start = Instant::now();
        let stats = wait_for(&d, Duration::from_secs(1), |s| s.delivered == 1).await;
        assert_eq!(stats.delivered, 1, "fast callback waited on slow one");
        assert!(start.elapsed() < Duration::from_secs(1));
        fast.assert_calls_async(1).await;

        let stats = wait_for(&d, Duration::from_secs(5), |s| s.delivered == 2).await;
        assert_eq!(stats.delivered, 2);
        slow.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_failure() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hang");
                then.status(200).delay(Duration::from_secs(2));
            })
            .await;

        let d = dispatcher(RetryPolicy {
            attempt_timeout: Duration::from_millis(100),
            ..fast_policy(1)
        });
        d.schedule(CallbackTask::new(server.url("/hang"), SystemTime::now(), None));
        let stats = wait_for(&d, Duration::from_secs(2), |s| s.dropped == 1).await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn get_method_sends_no_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/ping");
                then.status(200);
            })
            .await;

        let d = CallbackDispatcher::new(DispatcherConfig {
            method: Method::GET,
            retry: fast_policy(1),
            ..DispatcherConfig::default()
        })
        .unwrap();
        d.schedule(CallbackTask::new(server.url("/ping"), SystemTime::now(), None));
        let stats = wait_for(&d, Duration::from_secs(2), |s| s.delivered == 1).await;
        assert_eq!(stats.delivered, 1);
        mock.assert_calls_async(1).await;
    }
}
