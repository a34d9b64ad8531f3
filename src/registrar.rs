//!
//! Signin registrar
//! ----------------
//! Request-facing entry point. Creates, reads and deletes signin records and hands
//! out connection profiles; never provisions inline. The `signin`/`status`/
//! `signout`/`kubeconfig` methods run the identity gate first and are what the
//! HTTP layer calls; the `*_signin` methods take an already-verified principal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::identity::{GateRequest, IdentityGate};
use crate::provisioner::{ConnectionProfile, Provisioner};
use crate::scheme::Scheme;
use crate::signin::SigninRecord;
use crate::store::{DeleteOutcome, SigninStore};

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(SigninRecord),
    /// Replay of a live signin with the same role.
    Existing(SigninRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &SigninRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool { matches!(self, CreateOutcome::Created(_)) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignoutOutcome {
    /// No record existed (or it was removed outright).
    Absent,
    /// Teardown of backing objects is pending.
    Pending,
}

pub struct Registrar {
    store: Arc<dyn SigninStore>,
    provisioner: Arc<Provisioner>,
    gate: IdentityGate,
    clock: Arc<dyn Clock>,
    scheme: Arc<Scheme>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn SigninStore>,
        provisioner: Arc<Provisioner>,
        gate: IdentityGate,
        clock: Arc<dyn Clock>,
        scheme: Arc<Scheme>,
    ) -> Self {
        Self { store, provisioner, gate, clock, scheme }
    }

    pub fn gate(&self) -> &IdentityGate { &self.gate }

    pub async fn signin(&self, req: &GateRequest, requested_role: Option<&str>) -> AppResult<CreateOutcome> {
        let auth = self.gate.authenticate(req)?;
        if let Some(role) = requested_role.map(str::trim).filter(|r| !r.is_empty()) {
            if role != auth.grant.role {
                return Err(AppError::forbidden(
                    "role_not_granted".to_string(),
                    format!("capability grants role {}, not {}", auth.grant.role, role),
                ));
            }
        }
        self.create_signin(&auth.principal.name, &auth.grant.role, auth.grant.ttl).await
    }

    pub async fn status(&self, req: &GateRequest) -> AppResult<SigninRecord> {
        let auth = self.gate.authenticate(req)?;
        self.get_status(&auth.principal.name).await
    }

    pub async fn signout(&self, req: &GateRequest) -> AppResult<SignoutOutcome> {
        let auth = self.gate.authenticate(req)?;
        self.delete_signin(&auth.principal.name).await
    }

    pub async fn kubeconfig(&self, req: &GateRequest) -> AppResult<ConnectionProfile> {
        let auth = self.gate.authenticate(req)?;
        self.connection_profile(&auth.principal.name).await
    }

    /// Create a signin valid for `ttl` from now, or replay the live one.
    pub async fn create_signin(&self, principal: &str, role: &str, ttl: Duration) -> AppResult<CreateOutcome> {
        let ttl = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or_else(|| AppError::user("invalid_ttl".to_string(), format!("ttl {:?} is not a positive duration", ttl)))?;
        let type_meta = self.scheme.type_meta::<SigninRecord>()?;

        // a lost create race re-reads and applies the same rules once
        for attempt in 0..2 {
            let now = self.clock.now();
            if let Some(existing) = self.store.get(principal).await? {
                return self.resolve_existing(existing, role).await;
            }
            let record = SigninRecord::new(type_meta.clone(), principal, role, now, ttl);
            match self.store.create(record).await {
                Ok(created) => {
                    info!(principal, role, valid_until = %created.spec.valid_until, validity = %created.status.validity_period, "signin created");
                    return Ok(CreateOutcome::Created(created));
                }
                Err(e) if e.is_already_exists() && attempt == 0 => {
                    debug!(principal, "lost signin create race, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::conflict("signin_race".to_string(), format!("signin for {} is being created concurrently", principal)))
    }

    async fn resolve_existing(&self, existing: SigninRecord, role: &str) -> AppResult<CreateOutcome> {
        let principal = existing.principal().to_string();
        if existing.is_deleting() {
            return Err(AppError::conflict(
                "signout_pending".to_string(),
                format!("previous signin for {} is still being torn down", principal),
            ));
        }
        if existing.is_expired(self.clock.now()) {
            // expired but not swept yet; start the teardown now
            self.store.delete(&principal).await?;
            return Err(AppError::conflict(
                "signout_pending".to_string(),
                format!("previous signin for {} expired and is being torn down", principal),
            ));
        }
        if existing.spec.role != role {
            return Err(AppError::conflict(
                "role_conflict".to_string(),
                format!("{} already holds a live signin for role {}", principal, existing.spec.role),
            ));
        }
        Ok(CreateOutcome::Existing(existing))
    }

    /// The live record, or `NotFound`.
    pub async fn get_status(&self, principal: &str) -> AppResult<SigninRecord> {
        match self.store.get(principal).await? {
            Some(r) if r.is_live(self.clock.now()) => Ok(r),
            _ => Err(AppError::not_found("signin_not_found".to_string(), format!("no live signin for {}", principal))),
        }
    }

    /// Request deletion. Idempotent.
    pub async fn delete_signin(&self, principal: &str) -> AppResult<SignoutOutcome> {
        let outcome = match self.store.delete(principal).await? {
            DeleteOutcome::Absent | DeleteOutcome::Removed => SignoutOutcome::Absent,
            DeleteOutcome::Pending(_) => SignoutOutcome::Pending,
        };
        info!(principal, ?outcome, "signout requested");
        Ok(outcome)
    }

    /// Mint a fresh profile for a provisioned signin.
    pub async fn connection_profile(&self, principal: &str) -> AppResult<ConnectionProfile> {
        let record = self.get_status(principal).await?;
        if !record.status.provisioned {
            return Err(AppError::not_ready(
                "signin_pending".to_string(),
                format!("signin for {} is not provisioned yet", principal),
            ));
        }
        self.provisioner.issue_profile(principal, record.spec.valid_until).await
    }
}
