//! One reconcile pass for one principal.
//!
//! Level-triggered: every pass re-reads the record and drives the backing objects
//! to match it, whatever happened before.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::sweeper::ExpirySweeper;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::provisioner::Provisioner;
use crate::signin::{
    SigninRecord, CONDITION_READY, REASON_PROVISIONED, REASON_PROVISIONING_FAILED, TEARDOWN_FINALIZER,
};
use crate::store::SigninStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the record changes.
    Done,
    /// Look again after the delay (the record's expiry).
    RequeueAfter(Duration),
}

pub struct Reconciler {
    store: Arc<dyn SigninStore>,
    provisioner: Arc<Provisioner>,
    sweeper: Arc<ExpirySweeper>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SigninStore>,
        provisioner: Arc<Provisioner>,
        sweeper: Arc<ExpirySweeper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, provisioner, sweeper, clock }
    }

    pub async fn reconcile(&self, principal: &str) -> AppResult<Action> {
        let Some(record) = self.store.get(principal).await? else {
            // signed out and finalized, or never existed: clear leftovers
            self.provisioner.teardown(principal).await?;
            return Ok(Action::Done);
        };
        let Some(record) = self.sweeper.expire(&record).await? else {
            self.provisioner.teardown(principal).await?;
            return Ok(Action::Done);
        };
        if record.is_deleting() {
            return self.finalize(&record).await;
        }
        self.converge(&record).await
    }

    /// Pending -> Provisioned, or drift repair for an already provisioned record.
    async fn converge(&self, record: &SigninRecord) -> AppResult<Action> {
        let principal = record.principal();
        let spec = &record.spec;
        self.provisioner.ensure_objects(principal, &spec.role, spec.valid_until).await?;

        if !record.status.provisioned {
            // prove a token can be minted before declaring the signin usable
            let profile = self.provisioner.issue_profile(principal, spec.valid_until).await?;
            let now = self.clock.now();
            let mut status = record.status.clone();
            status.provisioned = true;
            status.set_condition(CONDITION_READY, true, REASON_PROVISIONED, String::new(), now);
            self.store
                .replace_status(principal, &record.metadata.uid, record.metadata.resource_version, status)
                .await?;
            info!(principal, role = %spec.role, token_seconds = profile.expiration_seconds, "signin provisioned");
        }

        let remaining = record.remaining(self.clock.now());
        let wait = remaining.to_std().unwrap_or(Duration::ZERO);
        debug!(principal, requeue_in = ?wait, "signin converged");
        Ok(Action::RequeueAfter(wait))
    }

    /// Tear down backing objects, then release the record.
    async fn finalize(&self, record: &SigninRecord) -> AppResult<Action> {
        let principal = record.principal();
        self.provisioner.teardown(principal).await?;
        if record.has_finalizer(TEARDOWN_FINALIZER) {
            self.store
                .remove_finalizer(principal, &record.metadata.uid, record.metadata.resource_version, TEARDOWN_FINALIZER)
                .await?;
            info!(principal, "signin torn down");
        }
        Ok(Action::Done)
    }

    /// Surface a retry-budget overrun on the record. Never touches `provisioned`.
    pub async fn record_failure(&self, principal: &str, failures: u32, err: &AppError) -> AppResult<()> {
        let Some(record) = self.store.get(principal).await? else { return Ok(()) };
        if record.status.provisioned || !record.is_live(self.clock.now()) {
            return Ok(());
        }
        let mut status = record.status.clone();
        // stable while the error is: repeated failures must not rewrite the record
        let message = format!("retry budget exhausted, last error: {}", err);
        status.set_condition(CONDITION_READY, false, REASON_PROVISIONING_FAILED, message, self.clock.now());
        if status == record.status {
            return Ok(());
        }
        self.store
            .replace_status(principal, &record.metadata.uid, record.metadata.resource_version, status)
            .await?;
        warn!(principal, failures, error = %err, "signin provisioning keeps failing");
        Ok(())
    }
}
