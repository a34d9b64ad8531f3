//!
//! Declarative signin store
//! ------------------------
//! The store holds one `SigninRecord` per principal and offers the primitives the
//! registrar and the controller build on: atomic single-object create, a
//! compare-and-swap status write keyed on `uid` + `resourceVersion`, two-phase
//! deletion through finalizers, and a change-notification stream.
//!
//! `StoreError` is shared with the backing-object adapters in `cluster`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::signin::{SigninRecord, SigninStatus};

pub mod memory;

pub use memory::MemorySigninStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} was modified concurrently (expected version {expected}, found {found:?})")]
    Conflict { kind: &'static str, name: String, expected: u64, found: Option<u64> },
    #[error("{kind} {name} is invalid: {reason}")]
    Invalid { kind: &'static str, name: String, reason: String },
    #[error("upstream rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store payload could not be encoded or decoded: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::NotFound { .. } => "not_found",
            StoreError::Conflict { .. } => "stale_write",
            StoreError::Invalid { .. } => "invalid_object",
            StoreError::Rejected { .. } => "upstream_rejected",
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Io(_) => "store_io",
            StoreError::Serde(_) => "store_encoding",
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }

    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// Change notification. Carries the key only; consumers re-read current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigninEvent {
    pub kind: EventKind,
    pub principal: String,
    pub resource_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Nothing stored under the principal.
    Absent,
    /// Record had no finalizers and is gone.
    Removed,
    /// Record is marked for deletion and waits for its finalizers.
    Pending(SigninRecord),
}

#[async_trait]
pub trait SigninStore: Send + Sync {
    async fn get(&self, principal: &str) -> Result<Option<SigninRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<SigninRecord>, StoreError>;

    /// Insert a new record. Fails with `AlreadyExists` if the principal has any record,
    /// including one that is pending deletion. Assigns uid, generation and version.
    async fn create(&self, record: SigninRecord) -> Result<SigninRecord, StoreError>;

    /// Compare-and-swap the status of the record identified by `uid` at `resource_version`.
    async fn replace_status(
        &self,
        principal: &str,
        uid: &str,
        resource_version: u64,
        status: SigninStatus,
    ) -> Result<SigninRecord, StoreError>;

    /// Request deletion. Idempotent; an absent record is reported, not an error.
    async fn delete(&self, principal: &str) -> Result<DeleteOutcome, StoreError>;

    /// Drop one finalizer with a compare-and-swap. Returns `None` once the record is gone.
    async fn remove_finalizer(
        &self,
        principal: &str,
        uid: &str,
        resource_version: u64,
        finalizer: &str,
    ) -> Result<Option<SigninRecord>, StoreError>;

    fn watch(&self) -> broadcast::Receiver<SigninEvent>;
}
