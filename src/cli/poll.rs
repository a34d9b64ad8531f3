//! Bounded polling for asynchronous server-side work.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    Ready(T),
    /// Not there yet; carries the latest reason.
    Pending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// Total time allowed, measured from the first probe.
    pub deadline: Duration,
}

impl Default for PollOptions {
    fn default() -> Self { Self { interval: Duration::from_secs(1), deadline: Duration::from_secs(30) } }
}

impl PollOptions {
    /// The same interval with whatever is left of the deadline since `started`, for a
    /// follow-up poll that shares one overall budget.
    pub fn remaining_since(&self, started: Instant) -> PollOptions {
        PollOptions { interval: self.interval, deadline: self.deadline.saturating_sub(started.elapsed()) }
    }
}

/// Probe until `Ready` or until the deadline passes. `NotReady` errors count as pending;
/// any other error ends the poll. Giving up never undoes anything on the server.
pub async fn poll_until<T, F, Fut>(opts: &PollOptions, what: &str, mut probe: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<PollState<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let reason = match probe().await {
            Ok(PollState::Ready(v)) => return Ok(v),
            Ok(PollState::Pending(reason)) => reason,
            Err(e) if e.kind() == ErrorKind::NotReady => e.message().to_string(),
            Err(e) => return Err(e),
        };
        debug!(what, attempts, reason = %reason, "still pending");
        if started.elapsed() + opts.interval > opts.deadline {
            let mut msg = format!("{} not ready after {:?} ({} attempts)", what, opts.deadline, attempts);
            if !reason.is_empty() {
                msg.push_str(": ");
                msg.push_str(&reason);
            }
            return Err(AppError::timeout("poll_timeout".to_string(), msg));
        }
        tokio::time::sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_once_ready() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let opts = PollOptions::default();
        let got = poll_until(&opts, "signin", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Ok(PollState::Pending(format!("attempt {}", n))) } else { Ok(PollState::Ready(n)) }
        })
        .await
        .unwrap();
        assert_eq!(got, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_errors_keep_polling_until_deadline() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let opts = PollOptions { interval: Duration::from_secs(1), deadline: Duration::from_millis(4500) };
        let err = poll_until::<(), _, _>(&opts, "kubeconfig", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::not_ready("signin_pending", "not provisioned yet"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code, "poll_timeout");
        assert!(err.message.contains("not provisioned yet"));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_polls_share_one_deadline() {
        let opts = PollOptions { interval: Duration::from_secs(1), deadline: Duration::from_secs(5) };
        let started = Instant::now();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        poll_until(&opts, "signin", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 4 { Ok(PollState::Pending(String::new())) } else { Ok(PollState::Ready(())) }
        })
        .await
        .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        let rest = opts.remaining_since(started);
        assert_eq!(rest.deadline, Duration::from_secs(2));
        let err = poll_until::<(), _, _>(&rest, "kubeconfig", || async { Ok(PollState::Pending("waiting".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.code, "poll_timeout");
        assert!(started.elapsed() <= opts.deadline);

        // nothing left: one probe, then give up
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opts.remaining_since(started).deadline, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_stop_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = poll_until::<(), _, _>(&PollOptions::default(), "signin", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::forbidden("missing_capability", "no grant"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, "missing_capability");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
