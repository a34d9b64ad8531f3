//! Work queue keyed by principal.
//!
//! A key is queued at most once, is never handed to two workers at the same time,
//! and a key re-added while in flight is queued again once its pass finishes.
//! Adds for a key that is backing off after a failure are dropped until its retry
//! delay elapses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::retry::RetryPolicy;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need a pass: queued, or re-added while processing.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    /// Earliest pending delayed add per key.
    scheduled: HashMap<String, Instant>,
    shutting_down: bool,
}

impl QueueState {
    /// A failed key waiting out its retry delay; the delayed add brings it back.
    fn backing_off(&self, key: &str) -> bool {
        self.failures.get(key).copied().unwrap_or(0) > 0
            && self.scheduled.get(key).is_some_and(|at| *at > Instant::now())
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn add(&self, key: &str) {
        {
            let mut s = self.state.lock();
            if s.shutting_down || s.dirty.contains(key) || s.backing_off(key) {
                return;
            }
            s.dirty.insert(key.to_string());
            if s.processing.contains(key) {
                return;
            }
            s.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed. Keeps only the earliest pending deadline per key.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut s = self.state.lock();
            if s.shutting_down {
                return;
            }
            match s.scheduled.get(key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    s.scheduled.insert(key.to_string(), deadline);
                }
            }
        }
        let this = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut s = this.state.lock();
                if s.scheduled.get(&key) == Some(&deadline) {
                    s.scheduled.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                this.add(&key);
            }
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent add cannot be missed
            notified.as_mut().enable();
            {
                let mut s = self.state.lock();
                if s.shutting_down {
                    return None;
                }
                if let Some(key) = s.queue.pop_front() {
                    s.dirty.remove(&key);
                    s.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish a pass. Re-queues the key if it was added while in flight.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut s = self.state.lock();
            s.processing.remove(key);
            if s.dirty.contains(key) && !s.shutting_down {
                s.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Count a failure and schedule the retry. Returns the failure count.
    pub fn requeue_with_backoff(self: &Arc<Self>, key: &str, policy: &RetryPolicy) -> u32 {
        let failures = {
            let mut s = self.state.lock();
            let n = s.failures.entry(key.to_string()).or_default();
            *n += 1;
            *n
        };
        self.add_after(key, policy.delay_for(failures));
        failures
    }

    pub fn forget(&self, key: &str) { self.state.lock().failures.remove(key); }

    pub fn failures(&self, key: &str) -> u32 { self.state.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn len(&self) -> usize { self.state.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.state.lock().processing.len() }

    /// Stop handing out keys. Passes already in flight are left to finish.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.state.lock().shutting_down }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let q = WorkQueue::new();
        q.add("alice");
        q.add("alice");
        q.add("bob");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("alice"));
        assert_eq!(q.get().await.as_deref(), Some("bob"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let q = WorkQueue::new();
        q.add("alice");
        let k = q.get().await.unwrap();
        q.add("alice");
        // re-added while processing: parked until done
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 1);
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("alice"));
        q.done("alice");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let q = WorkQueue::new();
        let q2 = q.clone();
        let h = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.add("carol");
        let got = tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_rejects_adds() {
        let q = WorkQueue::new();
        let q2 = q.clone();
        let h = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
        assert!(got.is_none());
        q.add("dave");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_keep_earliest_deadline() {
        let q = WorkQueue::new();
        q.add_after("alice", Duration::from_secs(10));
        q.add_after("alice", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("alice"));
        q.done("alice");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adds_wait_out_a_pending_backoff() {
        let q = WorkQueue::new();
        let policy = RetryPolicy::default().with_initial_delay(1000).with_max_delay(1000);
        q.add("alice");
        let k = q.get().await.unwrap();
        assert_eq!(q.requeue_with_backoff(&k, &policy), 1);
        // a change notification while the pass is still in flight
        q.add("alice");
        q.done(&k);
        assert!(q.is_empty());
        q.add("alice");
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("alice"));
        q.forget("alice");
        q.done("alice");
        q.add("alice");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_counts_failures_until_forgotten() {
        let q = WorkQueue::new();
        let policy = RetryPolicy::default();
        assert_eq!(q.requeue_with_backoff("alice", &policy), 1);
        assert_eq!(q.requeue_with_backoff("alice", &policy), 2);
        assert_eq!(q.failures("alice"), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(q.len(), 1);
        q.forget("alice");
        assert_eq!(q.failures("alice"), 0);
    }
}
