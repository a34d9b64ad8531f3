//!
//! Backing-object store
//! --------------------
//! Wire types for the three Kubernetes objects a signin materializes
//! (ServiceAccount, ClusterRoleBinding, TokenRequest) and the `ClusterApi` trait
//! the provisioner drives. Two implementations exist:
//! - `memory::MemoryCluster` keeps objects in process and mints HS256 tokens;
//! - `kube::KubeCluster` talks to a real API server over REST.
//!
//! All adapter failures are `StoreError`s; the provisioner decides which of them
//! are benign (absence on delete, existence on create).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheme::{Resource, TypeMeta};
use crate::store::StoreError;

pub mod kube;
pub mod memory;

pub use kube::KubeCluster;
pub use memory::{ClusterOp, MemoryCluster};

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ClusterObjectMeta {
    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(String::as_str) }

    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: ClusterObjectMeta,
}

impl Resource for ServiceAccount {
    const KIND: &'static str = "ServiceAccount";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBinding {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: ClusterObjectMeta,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl Resource for ClusterRoleBinding {
    const KIND: &'static str = "ClusterRoleBinding";
}

impl ClusterRoleBinding {
    /// Whether this binding grants `role` to exactly the given service account.
    pub fn binds(&self, role: &str, namespace: &str, service_account: &str) -> bool {
        self.role_ref.kind == "ClusterRole"
            && self.role_ref.name == role
            && self.subjects.len() == 1
            && self.subjects[0].kind == "ServiceAccount"
            && self.subjects[0].name == service_account
            && self.subjects[0].namespace.as_deref() == Some(namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequestSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    pub expiration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequestStatus {
    pub token: String,
    pub expiration_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ClusterObjectMeta,
    pub spec: TokenRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TokenRequestStatus>,
}

impl Resource for TokenRequest {
    const KIND: &'static str = "TokenRequest";
}

/// How clients reach the API server; copied into every connection profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub server: String,
    /// Base64 encoded PEM bundle.
    pub certificate_authority_data: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>, StoreError>;

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, StoreError>;

    /// Merge the given annotations into the object.
    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ServiceAccount, StoreError>;

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list_service_accounts(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ServiceAccount>, StoreError>;

    async fn get_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>, StoreError>;

    async fn create_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding, StoreError>;

    async fn annotate_binding(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ClusterRoleBinding, StoreError>;

    async fn delete_binding(&self, name: &str) -> Result<(), StoreError>;

    async fn list_bindings(&self, selector: &BTreeMap<String, String>) -> Result<Vec<ClusterRoleBinding>, StoreError>;

    /// Mint a token for the service account. Fails `NotFound` if it does not exist.
    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<TokenRequest, StoreError>;

    fn cluster_info(&self) -> &ClusterInfo;
}

/// Render a label selector the way the API server expects it (`k=v,k2=v2`).
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(role: &str, sa: &str, ns: Option<&str>) -> ClusterRoleBinding {
        ClusterRoleBinding {
            type_meta: TypeMeta::default(),
            metadata: ClusterObjectMeta { name: "b".into(), ..Default::default() },
            role_ref: RoleRef { api_group: RBAC_API_GROUP.into(), kind: "ClusterRole".into(), name: role.into() },
            subjects: vec![Subject { kind: "ServiceAccount".into(), name: sa.into(), namespace: ns.map(Into::into) }],
        }
    }

    #[test]
    fn binding_identity_checks_role_and_subject() {
        let b = binding("viewer", "tka-user-alice", Some("tka"));
        assert!(b.binds("viewer", "tka", "tka-user-alice"));
        assert!(!b.binds("editor", "tka", "tka-user-alice"));
        assert!(!b.binds("viewer", "other", "tka-user-alice"));
        assert!(!binding("viewer", "tka-user-alice", None).binds("viewer", "tka", "tka-user-alice"));
    }

    #[test]
    fn wire_names_follow_api_conventions() {
        let v = serde_json::to_value(binding("viewer", "sa", Some("tka"))).unwrap();
        assert_eq!(v["roleRef"]["apiGroup"], RBAC_API_GROUP);
        assert!(v["metadata"].get("labels").is_none());

        let mut sel = BTreeMap::new();
        sel.insert("b".to_string(), "2".to_string());
        sel.insert("a".to_string(), "1".to_string());
        assert_eq!(selector_string(&sel), "a=1,b=2");
    }
}
