//! In-process signin store with optional JSON snapshot persistence.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{DeleteOutcome, EventKind, SigninEvent, SigninStore, StoreError};
use crate::clock::Clock;
use crate::scheme::{Resource, Scheme};
use crate::signin::{SigninRecord, SigninStatus};

const KIND: &str = SigninRecord::KIND;
const SNAPSHOT_FILE: &str = "signins.json";
const EVENT_BUFFER: usize = 256;

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    last_version: u64,
    records: Vec<SigninRecord>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, SigninRecord>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    /// Look up a record and check it is still the generation and version the caller saw.
    fn check_cas(&self, principal: &str, uid: &str, resource_version: u64) -> Result<&SigninRecord, StoreError> {
        let current = self
            .records
            .get(principal)
            .ok_or_else(|| StoreError::NotFound { kind: KIND, name: principal.to_string() })?;
        if current.metadata.uid != uid || current.metadata.resource_version != resource_version {
            return Err(StoreError::Conflict {
                kind: KIND,
                name: principal.to_string(),
                expected: resource_version,
                found: Some(current.metadata.resource_version),
            });
        }
        Ok(current)
    }
}

pub struct MemorySigninStore {
    inner: RwLock<Inner>,
    scheme: Arc<Scheme>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SigninEvent>,
    snapshot_dir: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl MemorySigninStore {
    pub fn new(scheme: Arc<Scheme>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: RwLock::new(Inner::default()),
            scheme,
            clock,
            events,
            snapshot_dir: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a store persisted under `dir`, loading the previous snapshot if one exists.
    pub fn open(scheme: Arc<Scheme>, clock: Arc<dyn Clock>, dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let mut store = Self::new(scheme, clock);
        store.snapshot_dir = Some(dir.to_path_buf());
        store.load_snapshot()?;
        Ok(store)
    }

    fn snapshot_path(&self) -> Option<PathBuf> { self.snapshot_dir.as_ref().map(|d| d.join(SNAPSHOT_FILE)) }

    fn load_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path() else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        let snap: Snapshot = serde_json::from_slice(&bytes)?;
        let mut w = self.inner.write();
        w.records.clear();
        for rec in snap.records {
            if !self.scheme.recognizes(&rec.type_meta) {
                warn!(principal = %rec.spec.principal, kind = %rec.type_meta.kind, "dropping snapshot record of unknown kind");
                continue;
            }
            w.records.insert(rec.spec.principal.clone(), rec);
        }
        let max_seen = w.records.values().map(|r| r.metadata.resource_version).max().unwrap_or(0);
        w.last_version = snap.last_version.max(max_seen);
        debug!(records = w.records.len(), path = %path.display(), "loaded signin snapshot");
        Ok(())
    }

    fn save_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path() else { return Ok(()) };
        let _guard = self.persist_lock.lock();
        let bytes = {
            let r = self.inner.read();
            let snap = Snapshot { version: 1, last_version: r.last_version, records: r.records.values().cloned().collect() };
            serde_json::to_vec_pretty(&snap)?
        };
        // write beside the target so the final rename stays on one filesystem
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn after_write(&self, kind: EventKind, principal: &str, resource_version: u64) {
        if let Err(e) = self.save_snapshot() {
            warn!(error = %e, "failed to persist signin snapshot");
        }
        // No subscribers is fine
        let _ = self.events.send(SigninEvent { kind, principal: principal.to_string(), resource_version });
    }
}

#[async_trait]
impl SigninStore for MemorySigninStore {
    async fn get(&self, principal: &str) -> Result<Option<SigninRecord>, StoreError> {
        Ok(self.inner.read().records.get(principal).cloned())
    }

    async fn list(&self) -> Result<Vec<SigninRecord>, StoreError> {
        Ok(self.inner.read().records.values().cloned().collect())
    }

    async fn create(&self, mut record: SigninRecord) -> Result<SigninRecord, StoreError> {
        let principal = record.spec.principal.clone();
        if !self.scheme.recognizes(&record.type_meta) {
            return Err(StoreError::Invalid {
                kind: KIND,
                name: principal,
                reason: format!("unregistered type {}/{}", record.type_meta.api_version, record.type_meta.kind),
            });
        }
        if principal.is_empty() {
            return Err(StoreError::Invalid { kind: KIND, name: record.metadata.name, reason: "empty principal".into() });
        }
        let created = {
            let mut w = self.inner.write();
            if w.records.contains_key(&principal) {
                return Err(StoreError::AlreadyExists { kind: KIND, name: principal });
            }
            let version = w.next_version();
            record.metadata.uid = uuid::Uuid::new_v4().to_string();
            record.metadata.generation = version;
            record.metadata.resource_version = version;
            record.metadata.deletion_timestamp = None;
            w.records.insert(principal.clone(), record.clone());
            record
        };
        self.after_write(EventKind::Added, &principal, created.metadata.resource_version);
        Ok(created)
    }

    async fn replace_status(
        &self,
        principal: &str,
        uid: &str,
        resource_version: u64,
        status: SigninStatus,
    ) -> Result<SigninRecord, StoreError> {
        let updated = {
            let mut w = self.inner.write();
            let current = w.check_cas(principal, uid, resource_version)?;
            if current.status.provisioned && !status.provisioned {
                return Err(StoreError::Invalid {
                    kind: KIND,
                    name: principal.to_string(),
                    reason: "status.provisioned cannot revert to false".into(),
                });
            }
            let version = w.next_version();
            let rec = w
                .records
                .get_mut(principal)
                .ok_or_else(|| StoreError::NotFound { kind: KIND, name: principal.to_string() })?;
            rec.status = status;
            rec.metadata.resource_version = version;
            rec.clone()
        };
        self.after_write(EventKind::Modified, principal, updated.metadata.resource_version);
        Ok(updated)
    }

    async fn delete(&self, principal: &str) -> Result<DeleteOutcome, StoreError> {
        let now = self.clock.now();
        let (outcome, event) = {
            let mut w = self.inner.write();
            let Some(current) = w.records.get(principal) else { return Ok(DeleteOutcome::Absent) };
            if current.is_deleting() {
                return Ok(DeleteOutcome::Pending(current.clone()));
            }
            let finalized = current.metadata.finalizers.is_empty();
            let version = w.next_version();
            if finalized {
                w.records.remove(principal);
                (DeleteOutcome::Removed, (EventKind::Deleted, version))
            } else {
                let rec = w
                    .records
                    .get_mut(principal)
                    .ok_or_else(|| StoreError::NotFound { kind: KIND, name: principal.to_string() })?;
                rec.metadata.deletion_timestamp = Some(now);
                rec.metadata.resource_version = version;
                (DeleteOutcome::Pending(rec.clone()), (EventKind::Modified, version))
            }
        };
        self.after_write(event.0, principal, event.1);
        Ok(outcome)
    }

    async fn remove_finalizer(
        &self,
        principal: &str,
        uid: &str,
        resource_version: u64,
        finalizer: &str,
    ) -> Result<Option<SigninRecord>, StoreError> {
        let (result, event) = {
            let mut w = self.inner.write();
            w.check_cas(principal, uid, resource_version)?;
            let version = w.next_version();
            let rec = w
                .records
                .get_mut(principal)
                .ok_or_else(|| StoreError::NotFound { kind: KIND, name: principal.to_string() })?;
            rec.metadata.finalizers.retain(|f| f != finalizer);
            rec.metadata.resource_version = version;
            let released = rec.is_deleting() && rec.metadata.finalizers.is_empty();
            let kept = if released { None } else { Some(rec.clone()) };
            if released {
                w.records.remove(principal);
                (None, (EventKind::Deleted, version))
            } else {
                (kept, (EventKind::Modified, version))
            }
        };
        self.after_write(event.0, principal, event.1);
        Ok(result)
    }

    fn watch(&self) -> broadcast::Receiver<SigninEvent> { self.events.subscribe() }
}
