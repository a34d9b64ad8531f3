//! Expiry sweeper.
//!
//! Marks expired signins for deletion and finds principals whose state needs a
//! reconcile pass: expired records, records stuck in deletion, and backing
//! objects that outlived or drifted from their signin.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::AppResult;
use crate::provisioner::Provisioner;
use crate::signin::SigninRecord;
use crate::store::{DeleteOutcome, SigninStore};

pub struct ExpirySweeper {
    store: Arc<dyn SigninStore>,
    provisioner: Arc<Provisioner>,
    clock: Arc<dyn Clock>,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn SigninStore>, provisioner: Arc<Provisioner>, clock: Arc<dyn Clock>) -> Self {
        Self { store, provisioner, clock }
    }

    /// Mark an expired record for deletion. Returns the record as it now stands,
    /// or `None` if it is already gone. Live records are returned untouched.
    pub async fn expire(&self, record: &SigninRecord) -> AppResult<Option<SigninRecord>> {
        if record.is_deleting() || !record.is_expired(self.clock.now()) {
            return Ok(Some(record.clone()));
        }
        match self.store.delete(record.principal()).await? {
            DeleteOutcome::Pending(r) => {
                info!(principal = %r.spec.principal, valid_until = %r.spec.valid_until, "signin expired");
                Ok(Some(r))
            }
            DeleteOutcome::Absent | DeleteOutcome::Removed => Ok(None),
        }
    }

    /// Full scan. Returns the principals that need a reconcile pass, sorted.
    pub async fn sweep(&self) -> AppResult<Vec<String>> {
        let now = self.clock.now();
        let records = self.store.list().await?;
        let mut due = BTreeSet::new();
        let mut known = HashMap::new();
        for record in &records {
            known.insert(record.principal().to_string(), record.spec.valid_until);
            if record.is_deleting() {
                due.insert(record.principal().to_string());
            } else if record.is_expired(now) {
                self.expire(record).await?;
                due.insert(record.principal().to_string());
            }
        }

        for obj in self.provisioner.list_managed().await? {
            let Some(principal) = obj.principal else {
                warn!(name = %obj.name, kind = ?obj.kind, "managed object without principal label");
                continue;
            };
            let drifted = match (known.get(&principal), obj.valid_until) {
                // no record at all: orphan
                (None, _) => true,
                (Some(_), None) => true,
                (Some(record_until), Some(stamped)) => stamped < now && stamped != *record_until,
            };
            if drifted && due.insert(principal.clone()) {
                debug!(principal = %principal, name = %obj.name, "backing object needs reconcile");
            }
        }

        if !due.is_empty() {
            info!(count = due.len(), "sweep found signins to reconcile");
        }
        Ok(due.into_iter().collect())
    }
}
