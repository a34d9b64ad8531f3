//!
//! Signin controller
//! -----------------
//! Runs the reconcile loop: a store subscription feeds a principal-keyed work
//! queue, a pool of workers runs one `Reconciler` pass per key, and a ticker runs
//! the expiry sweep and a full resync. Failures are retried with backoff; panics
//! inside a pass are caught and counted as failures.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt; // for catch_unwind on async blocks
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, ErrorKind};
use crate::store::SigninStore;

pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod sweeper;

pub use queue::WorkQueue;
pub use reconciler::{Action, Reconciler};
pub use retry::RetryPolicy;
pub use sweeper::ExpirySweeper;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Interval of the expiry sweep and full resync.
    pub resync_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self { Self { workers: 4, resync_interval: Duration::from_secs(60), retry: RetryPolicy::default() } }
}

pub struct Controller {
    store: Arc<dyn SigninStore>,
    reconciler: Arc<Reconciler>,
    sweeper: Arc<ExpirySweeper>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Controller {
    pub fn new(
        store: Arc<dyn SigninStore>,
        reconciler: Arc<Reconciler>,
        sweeper: Arc<ExpirySweeper>,
        config: ControllerConfig,
    ) -> Self {
        Self { store, reconciler, sweeper, queue: WorkQueue::new(), config }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> { &self.queue }

    /// Run until `shutdown` flips to true (or its sender is dropped), then let
    /// in-flight passes finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        // subscribe before the initial list so nothing falls in between
        let mut events = self.store.watch();
        self.resync().await;

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let this = Arc::clone(&self);
            workers.spawn(async move { this.worker(id).await });
        }
        info!(target: "tka::controller", workers = self.config.workers, resync = ?self.config.resync_interval, "controller started");

        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately and the initial resync already ran
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                ev = events.recv() => match ev {
                    Ok(ev) => {
                        debug!(principal = %ev.principal, kind = ?ev.kind, version = ev.resource_version, "signin event");
                        self.queue.add(&ev.principal);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "signin events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("signin event stream closed, stopping controller");
                        break;
                    }
                },
                _ = ticker.tick() => self.resync().await,
            }
        }

        info!(target: "tka::controller", in_flight = self.queue.in_flight(), "controller draining");
        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "controller worker ended abnormally");
            }
        }
        info!(target: "tka::controller", "controller stopped");
        Ok(())
    }

    /// Queue every record plus whatever the sweep turns up.
    pub async fn resync(&self) {
        match self.store.list().await {
            Ok(records) => {
                for r in &records {
                    self.queue.add(r.principal());
                }
            }
            Err(e) => warn!(error = %e, "resync could not list signins"),
        }
        match self.sweeper.sweep().await {
            Ok(due) => {
                for p in &due {
                    self.queue.add(p);
                }
            }
            Err(e) => warn!(error = %e, "expiry sweep failed"),
        }
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "reconcile worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "reconcile worker stopped");
    }

    /// One guarded pass plus the follow-up scheduling for `key`.
    pub async fn process(&self, key: &str) {
        let pass = self.reconciler.reconcile(key);
        let result = match AssertUnwindSafe(pass).catch_unwind().await {
            Ok(r) => r,
            Err(panic) => Err(AppError::internal("reconcile_panic".to_string(), panic_message(panic.as_ref()))),
        };
        match result {
            Ok(Action::Done) => self.queue.forget(key),
            Ok(Action::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key, delay);
            }
            Err(e) if e.kind() == ErrorKind::StaleGeneration => {
                debug!(principal = key, error = %e, "stale pass, requeueing");
                self.queue.add(key);
            }
            Err(e) => {
                let failures = self.queue.requeue_with_backoff(key, &self.config.retry);
                warn!(principal = key, failures, error = %e, "reconcile failed");
                if self.config.retry.exhausted(failures) {
                    if let Err(ce) = self.reconciler.record_failure(key, failures, &e).await {
                        debug!(principal = key, error = %ce, "could not record provisioning failure");
                    }
                }
            }
        }
    }
}
