//!
//! Credential provisioner
//! ----------------------
//! Converges the backing objects of one principal (ServiceAccount and
//! ClusterRoleBinding) with ensure-semantics, mints tokens bounded by the remaining
//! validity, assembles connection profiles and tears everything down again.
//!
//! Every object is labelled with its principal and stamped with the signin's
//! `validUntil`, so orphans can be found without the signin record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::cluster::{
    ClusterApi, ClusterObjectMeta, ClusterRoleBinding, RoleRef, ServiceAccount, Subject, TokenRequest, TokenRequestSpec,
    RBAC_API_GROUP,
};
use crate::error::{AppError, AppResult};
use crate::scheme::Scheme;
use crate::signin::{
    binding_name, object_name, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PRINCIPAL_LABEL, VALID_UNTIL_ANNOTATION,
};
use crate::store::StoreError;

pub mod kubeconfig;

pub use kubeconfig::Kubeconfig;

/// Attempts at create-then-reread before giving up on a racing writer.
const ENSURE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Namespace holding the service accounts. Never derived from the principal.
    pub namespace: String,
    /// Cluster name written into connection profiles.
    pub cluster_name: String,
    /// Audiences requested for minted tokens; empty means the API server default.
    pub token_audiences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub kubeconfig: Kubeconfig,
    pub token_expires_at: DateTime<Utc>,
    pub expiration_seconds: i64,
}

/// Mutations made by one `ensure_objects` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureReport {
    pub created: u32,
    pub patched: u32,
    pub recreated: u32,
}

impl EnsureReport {
    pub fn is_noop(&self) -> bool { self.created == 0 && self.patched == 0 && self.recreated == 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedKind {
    ServiceAccount,
    ClusterRoleBinding,
}

/// A labelled backing object as found in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedObject {
    pub kind: ManagedKind,
    pub name: String,
    pub principal: Option<String>,
    /// `None` when the annotation is missing or unparsable.
    pub valid_until: Option<DateTime<Utc>>,
}

pub fn valid_until_value(t: DateTime<Utc>) -> String { t.to_rfc3339_opts(SecondsFormat::Secs, true) }

fn parse_valid_until(v: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(v).ok().map(|t| t.with_timezone(&Utc))
}

fn tolerate_absent(res: Result<(), StoreError>) -> AppResult<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    scheme: Arc<Scheme>,
    clock: Arc<dyn Clock>,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, scheme: Arc<Scheme>, clock: Arc<dyn Clock>, config: ProvisionerConfig) -> Self {
        Self { cluster, scheme, clock, config }
    }

    pub fn config(&self) -> &ProvisionerConfig { &self.config }

    /// Ensure every backing object, then mint a profile for the remaining validity.
    pub async fn provision(&self, principal: &str, role: &str, valid_until: DateTime<Utc>) -> AppResult<ConnectionProfile> {
        self.ensure_objects(principal, role, valid_until).await?;
        self.issue_profile(principal, valid_until).await
    }

    /// Create or repair the service account and role binding. Safe to repeat.
    pub async fn ensure_objects(&self, principal: &str, role: &str, valid_until: DateTime<Utc>) -> AppResult<EnsureReport> {
        let mut report = EnsureReport::default();
        let stamp = valid_until_value(valid_until);
        self.ensure_service_account(principal, &stamp, &mut report).await?;
        self.ensure_binding(principal, role, &stamp, &mut report).await?;
        if !report.is_noop() {
            info!(principal, role, valid_until = %stamp, created = report.created, patched = report.patched, recreated = report.recreated, "backing objects converged");
        }
        Ok(report)
    }

    fn labels(&self, principal: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(PRINCIPAL_LABEL.to_string(), principal.to_string());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    }

    fn stamp_annotations(stamp: &str) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(VALID_UNTIL_ANNOTATION.to_string(), stamp.to_string());
        annotations
    }

    async fn ensure_service_account(&self, principal: &str, stamp: &str, report: &mut EnsureReport) -> AppResult<()> {
        let ns = self.config.namespace.as_str();
        let name = object_name(principal);
        for _ in 0..ENSURE_ATTEMPTS {
            if let Some(existing) = self.cluster.get_service_account(ns, &name).await? {
                if existing.metadata.annotation(VALID_UNTIL_ANNOTATION) != Some(stamp) {
                    self.cluster.annotate_service_account(ns, &name, &Self::stamp_annotations(stamp)).await?;
                    report.patched += 1;
                }
                return Ok(());
            }
            let sa = ServiceAccount {
                type_meta: self.scheme.type_meta::<ServiceAccount>()?,
                metadata: ClusterObjectMeta {
                    name: name.clone(),
                    namespace: Some(ns.to_string()),
                    labels: self.labels(principal),
                    annotations: Self::stamp_annotations(stamp),
                    ..Default::default()
                },
            };
            match self.cluster.create_service_account(&sa).await {
                Ok(_) => {
                    report.created += 1;
                    return Ok(());
                }
                // someone else created it between our read and write
                Err(e) if e.is_already_exists() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::provision("ensure_race".to_string(), format!("service account {} keeps changing under us", name)))
    }

    async fn ensure_binding(&self, principal: &str, role: &str, stamp: &str, report: &mut EnsureReport) -> AppResult<()> {
        let ns = self.config.namespace.as_str();
        let sa_name = object_name(principal);
        let name = binding_name(principal);
        for _ in 0..ENSURE_ATTEMPTS {
            if let Some(existing) = self.cluster.get_binding(&name).await? {
                if !existing.binds(role, ns, &sa_name) {
                    // roleRef is immutable, so a changed role means a new binding
                    debug!(principal, binding = %name, from = %existing.role_ref.name, to = role, "replacing role binding");
                    tolerate_absent(self.cluster.delete_binding(&name).await)?;
                    report.recreated += 1;
                    continue;
                }
                if existing.metadata.annotation(VALID_UNTIL_ANNOTATION) != Some(stamp) {
                    self.cluster.annotate_binding(&name, &Self::stamp_annotations(stamp)).await?;
                    report.patched += 1;
                }
                return Ok(());
            }
            let binding = ClusterRoleBinding {
                type_meta: self.scheme.type_meta::<ClusterRoleBinding>()?,
                metadata: ClusterObjectMeta {
                    name: name.clone(),
                    labels: self.labels(principal),
                    annotations: Self::stamp_annotations(stamp),
                    ..Default::default()
                },
                role_ref: RoleRef { api_group: RBAC_API_GROUP.to_string(), kind: "ClusterRole".to_string(), name: role.to_string() },
                subjects: vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: sa_name.clone(),
                    namespace: Some(ns.to_string()),
                }],
            };
            match self.cluster.create_binding(&binding).await {
                Ok(_) => {
                    if report.recreated == 0 {
                        report.created += 1;
                    }
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::provision("ensure_race".to_string(), format!("role binding {} keeps changing under us", name)))
    }

    /// Mint a token that expires exactly at `valid_until` (to the second) and wrap it
    /// in a kubeconfig. The service account must already exist.
    pub async fn issue_profile(&self, principal: &str, valid_until: DateTime<Utc>) -> AppResult<ConnectionProfile> {
        let now = self.clock.now();
        let remaining = (valid_until - now).num_seconds();
        if remaining <= 0 {
            return Err(AppError::not_found("signin_expired".to_string(), format!("signin for {} has no validity left", principal)));
        }
        let sa_name = object_name(principal);
        let request = TokenRequest {
            type_meta: self.scheme.type_meta::<TokenRequest>()?,
            metadata: ClusterObjectMeta::default(),
            spec: TokenRequestSpec { audiences: self.config.token_audiences.clone(), expiration_seconds: remaining },
            status: None,
        };
        let minted = match self.cluster.create_token(&self.config.namespace, &sa_name, &request).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                return Err(AppError::not_ready("identity_missing".to_string(), format!("service account {} does not exist yet", sa_name))
                    .with_cause(e))
            }
            Err(e) => return Err(e.into()),
        };
        let status = minted
            .status
            .ok_or_else(|| AppError::provision("token_missing", "token request returned no token"))?;
        debug!(principal, expiration_seconds = remaining, expires_at = %status.expiration_timestamp, "minted token");
        let kubeconfig = Kubeconfig::build(
            self.cluster.cluster_info(),
            &self.config.cluster_name,
            &self.config.namespace,
            principal,
            status.token,
        );
        Ok(ConnectionProfile { kubeconfig, token_expires_at: status.expiration_timestamp, expiration_seconds: remaining })
    }

    /// Delete the role binding, then the service account. Absence counts as success.
    /// Returns how many objects were actually removed.
    pub async fn teardown(&self, principal: &str) -> AppResult<u32> {
        let mut removed = 0;
        if tolerate_absent(self.cluster.delete_binding(&binding_name(principal)).await)? {
            removed += 1;
        }
        if tolerate_absent(self.cluster.delete_service_account(&self.config.namespace, &object_name(principal)).await)? {
            removed += 1;
        }
        if removed > 0 {
            info!(principal, removed, "backing objects removed");
        }
        Ok(removed)
    }

    /// Every object carrying the managed-by label, with its principal and expiry stamp.
    pub async fn list_managed(&self) -> AppResult<Vec<ManagedObject>> {
        let mut selector = BTreeMap::new();
        selector.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        let mut out = Vec::new();
        for sa in self.cluster.list_service_accounts(&self.config.namespace, &selector).await? {
            out.push(ManagedObject {
                kind: ManagedKind::ServiceAccount,
                principal: sa.metadata.label(PRINCIPAL_LABEL).map(str::to_string),
                valid_until: sa.metadata.annotation(VALID_UNTIL_ANNOTATION).and_then(parse_valid_until),
                name: sa.metadata.name,
            });
        }
        for b in self.cluster.list_bindings(&selector).await? {
            out.push(ManagedObject {
                kind: ManagedKind::ClusterRoleBinding,
                principal: b.metadata.label(PRINCIPAL_LABEL).map(str::to_string),
                valid_until: b.metadata.annotation(VALID_UNTIL_ANNOTATION).and_then(parse_valid_until),
                name: b.metadata.name,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "provisioner_tests.rs"]
mod provisioner_tests;
