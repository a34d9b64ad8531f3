//! In-process cluster used for local runs and tests.
//!
//! Tokens are real HS256 JWTs whose `exp` claim is `now + expirationSeconds`, so the
//! lifetime bound can be checked by decoding what a client received.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ClusterApi, ClusterInfo, ClusterRoleBinding, ServiceAccount, TokenRequest, TokenRequestStatus};
use crate::clock::Clock;
use crate::scheme::{Resource, Scheme, TypeMeta};
use crate::store::StoreError;

const ISSUER: &str = "tka-memory-cluster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    GetServiceAccount,
    CreateServiceAccount,
    AnnotateServiceAccount,
    DeleteServiceAccount,
    ListServiceAccounts,
    GetBinding,
    CreateBinding,
    AnnotateBinding,
    DeleteBinding,
    ListBindings,
    CreateToken,
}

/// Claims carried by tokens this cluster mints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub aud: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Default)]
struct State {
    service_accounts: BTreeMap<(String, String), ServiceAccount>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
    faults: HashMap<ClusterOp, u32>,
    calls: HashMap<ClusterOp, u64>,
    next_uid: u64,
}

impl State {
    /// Count the call and consume one injected failure if any are queued.
    fn enter(&mut self, op: ClusterOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(left) = self.faults.get_mut(&op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Rejected { status: 500, message: format!("injected failure for {:?}", op) });
            }
        }
        Ok(())
    }

    fn stamp(&mut self, meta: &mut super::ClusterObjectMeta, now: chrono::DateTime<chrono::Utc>) {
        self.next_uid += 1;
        meta.uid = Some(format!("mem-{}", self.next_uid));
        meta.resource_version = Some(self.next_uid.to_string());
        meta.creation_timestamp = Some(now);
    }

    fn bump(&mut self, meta: &mut super::ClusterObjectMeta) {
        self.next_uid += 1;
        meta.resource_version = Some(self.next_uid.to_string());
    }
}

pub struct MemoryCluster {
    state: Mutex<State>,
    scheme: Arc<Scheme>,
    clock: Arc<dyn Clock>,
    info: ClusterInfo,
    secret: [u8; 32],
}

impl MemoryCluster {
    pub fn new(scheme: Arc<Scheme>, clock: Arc<dyn Clock>, info: ClusterInfo) -> Self {
        let mut secret = [0u8; 32];
        if getrandom::getrandom(&mut secret).is_err() {
            secret[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        }
        Self { state: Mutex::new(State::default()), scheme, clock, info, secret }
    }

    /// Make the next `count` calls of `op` fail with an upstream rejection.
    pub fn inject_failures(&self, op: ClusterOp, count: u32) { self.state.lock().faults.insert(op, count); }

    pub fn calls(&self, op: ClusterOp) -> u64 { self.state.lock().calls.get(&op).copied().unwrap_or(0) }

    pub fn service_account_count(&self) -> usize { self.state.lock().service_accounts.len() }

    pub fn binding_count(&self) -> usize { self.state.lock().bindings.len() }

    /// Verify a token minted here and return its claims. Expiry is not enforced.
    pub fn decode_token(&self, token: &str) -> Result<TokenClaims, StoreError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_issuer(&[ISSUER]);
        decode::<TokenClaims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| StoreError::Invalid { kind: TokenRequest::KIND, name: "token".into(), reason: e.to_string() })
    }

    fn check_kind<R: Resource>(&self, tm: &TypeMeta, name: &str) -> Result<(), StoreError> {
        if tm.kind != R::KIND || !self.scheme.recognizes(tm) {
            return Err(StoreError::Invalid {
                kind: R::KIND,
                name: name.to_string(),
                reason: format!("unexpected type {}/{}", tm.api_version, tm.kind),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::GetServiceAccount)?;
        Ok(st.service_accounts.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, StoreError> {
        self.check_kind::<ServiceAccount>(&sa.type_meta, &sa.metadata.name)?;
        let namespace = sa.metadata.namespace.clone().unwrap_or_default();
        if namespace.is_empty() {
            return Err(StoreError::Invalid {
                kind: ServiceAccount::KIND,
                name: sa.metadata.name.clone(),
                reason: "namespace is required".into(),
            });
        }
        let now = self.clock.now();
        let mut st = self.state.lock();
        st.enter(ClusterOp::CreateServiceAccount)?;
        let key = (namespace, sa.metadata.name.clone());
        if st.service_accounts.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: ServiceAccount::KIND, name: key.1 });
        }
        let mut created = sa.clone();
        st.stamp(&mut created.metadata, now);
        st.service_accounts.insert(key, created.clone());
        Ok(created)
    }

    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ServiceAccount, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::AnnotateServiceAccount)?;
        let key = (namespace.to_string(), name.to_string());
        let mut sa = st
            .service_accounts
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: ServiceAccount::KIND, name: name.to_string() })?;
        sa.metadata.annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        st.bump(&mut sa.metadata);
        st.service_accounts.insert(key, sa.clone());
        Ok(sa)
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::DeleteServiceAccount)?;
        st.service_accounts
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { kind: ServiceAccount::KIND, name: name.to_string() })
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ServiceAccount>, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::ListServiceAccounts)?;
        Ok(st
            .service_accounts
            .iter()
            .filter(|((ns, _), sa)| ns == namespace && sa.metadata.matches_labels(selector))
            .map(|(_, sa)| sa.clone())
            .collect())
    }

    async fn get_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::GetBinding)?;
        Ok(st.bindings.get(name).cloned())
    }

    async fn create_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding, StoreError> {
        self.check_kind::<ClusterRoleBinding>(&binding.type_meta, &binding.metadata.name)?;
        let now = self.clock.now();
        let mut st = self.state.lock();
        st.enter(ClusterOp::CreateBinding)?;
        if st.bindings.contains_key(&binding.metadata.name) {
            return Err(StoreError::AlreadyExists { kind: ClusterRoleBinding::KIND, name: binding.metadata.name.clone() });
        }
        let mut created = binding.clone();
        st.stamp(&mut created.metadata, now);
        st.bindings.insert(created.metadata.name.clone(), created.clone());
        Ok(created)
    }

    async fn annotate_binding(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ClusterRoleBinding, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::AnnotateBinding)?;
        let mut b = st
            .bindings
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: ClusterRoleBinding::KIND, name: name.to_string() })?;
        b.metadata.annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        st.bump(&mut b.metadata);
        st.bindings.insert(name.to_string(), b.clone());
        Ok(b)
    }

    async fn delete_binding(&self, name: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::DeleteBinding)?;
        st.bindings
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { kind: ClusterRoleBinding::KIND, name: name.to_string() })
    }

    async fn list_bindings(&self, selector: &BTreeMap<String, String>) -> Result<Vec<ClusterRoleBinding>, StoreError> {
        let mut st = self.state.lock();
        st.enter(ClusterOp::ListBindings)?;
        Ok(st.bindings.values().filter(|b| b.metadata.matches_labels(selector)).cloned().collect())
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<TokenRequest, StoreError> {
        self.check_kind::<TokenRequest>(&request.type_meta, service_account)?;
        if request.spec.expiration_seconds <= 0 {
            return Err(StoreError::Invalid {
                kind: TokenRequest::KIND,
                name: service_account.to_string(),
                reason: format!("expirationSeconds must be positive, got {}", request.spec.expiration_seconds),
            });
        }
        let now = self.clock.now();
        {
            let mut st = self.state.lock();
            st.enter(ClusterOp::CreateToken)?;
            if !st.service_accounts.contains_key(&(namespace.to_string(), service_account.to_string())) {
                return Err(StoreError::NotFound { kind: ServiceAccount::KIND, name: service_account.to_string() });
            }
        }
        let expires = now + chrono::Duration::seconds(request.spec.expiration_seconds);
        let claims = TokenClaims {
            iss: ISSUER.to_string(),
            sub: format!("system:serviceaccount:{}:{}", namespace, service_account),
            aud: request.spec.audiences.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|e| StoreError::Unavailable(format!("token signing failed: {}", e)))?;
        let mut out = request.clone();
        out.status = Some(TokenRequestStatus { token, expiration_timestamp: expires });
        Ok(out)
    }

    fn cluster_info(&self) -> &ClusterInfo { &self.info }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::{ClusterObjectMeta, TokenRequestSpec};

    fn cluster() -> (MemoryCluster, Arc<ManualClock>, Arc<Scheme>) {
        let clock = Arc::new(ManualClock::starting_now());
        let scheme = Arc::new(Scheme::with_defaults());
        let info = ClusterInfo { server: "https://k8s.test:6443".into(), certificate_authority_data: None, insecure_skip_tls_verify: false };
        (MemoryCluster::new(scheme.clone(), clock.clone(), info), clock, scheme)
    }

    fn sa(scheme: &Scheme, name: &str, label: Option<(&str, &str)>) -> ServiceAccount {
        let mut labels = BTreeMap::new();
        if let Some((k, v)) = label {
            labels.insert(k.to_string(), v.to_string());
        }
        ServiceAccount {
            type_meta: scheme.type_meta::<ServiceAccount>().unwrap(),
            metadata: ClusterObjectMeta { name: name.into(), namespace: Some("tka".into()), labels, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn service_account_crud_and_selectors() {
        let (c, _clock, scheme) = cluster();
        let created = c.create_service_account(&sa(&scheme, "a", Some(("team", "x")))).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(c.create_service_account(&sa(&scheme, "a", None)).await.unwrap_err().is_already_exists());
        c.create_service_account(&sa(&scheme, "b", None)).await.unwrap();

        let mut sel = BTreeMap::new();
        sel.insert("team".to_string(), "x".to_string());
        let listed = c.list_service_accounts("tka", &sel).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name, "a");
        assert!(c.list_service_accounts("other", &BTreeMap::new()).await.unwrap().is_empty());

        let mut ann = BTreeMap::new();
        ann.insert("k".to_string(), "v".to_string());
        let patched = c.annotate_service_account("tka", "a", &ann).await.unwrap();
        assert_eq!(patched.metadata.annotation("k"), Some("v"));
        assert_ne!(patched.metadata.resource_version, created.metadata.resource_version);

        c.delete_service_account("tka", "a").await.unwrap();
        assert!(c.delete_service_account("tka", "a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn tokens_expire_relative_to_mint_time() {
        let (c, clock, scheme) = cluster();
        c.create_service_account(&sa(&scheme, "a", None)).await.unwrap();
        clock.advance(chrono::Duration::minutes(2));
        let req = TokenRequest {
            type_meta: scheme.type_meta::<TokenRequest>().unwrap(),
            metadata: ClusterObjectMeta::default(),
            spec: TokenRequestSpec { audiences: vec!["https://kubernetes.default.svc".into()], expiration_seconds: 180 },
            status: None,
        };
        let out = c.create_token("tka", "a", &req).await.unwrap();
        let status = out.status.unwrap();
        let claims = c.decode_token(&status.token).unwrap();
        assert_eq!(claims.exp - claims.iat, 180);
        assert_eq!(claims.exp, status.expiration_timestamp.timestamp());
        assert_eq!(claims.iat, clock.now().timestamp());
        assert_eq!(claims.sub, "system:serviceaccount:tka:a");

        assert!(c.create_token("tka", "missing", &req).await.unwrap_err().is_not_found());
        let mut zero = req.clone();
        zero.spec.expiration_seconds = 0;
        assert!(matches!(c.create_token("tka", "a", &zero).await.unwrap_err(), StoreError::Invalid { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let (c, _clock, scheme) = cluster();
        c.inject_failures(ClusterOp::CreateServiceAccount, 2);
        assert!(matches!(c.create_service_account(&sa(&scheme, "a", None)).await, Err(StoreError::Rejected { .. })));
        assert!(matches!(c.create_service_account(&sa(&scheme, "a", None)).await, Err(StoreError::Rejected { .. })));
        c.create_service_account(&sa(&scheme, "a", None)).await.unwrap();
        assert_eq!(c.calls(ClusterOp::CreateServiceAccount), 3);
    }

    #[tokio::test]
    async fn wrong_kinds_are_rejected() {
        let (c, _clock, scheme) = cluster();
        let mut bad = sa(&scheme, "a", None);
        bad.type_meta.kind = "ConfigMap".into();
        assert!(matches!(c.create_service_account(&bad).await, Err(StoreError::Invalid { .. })));
    }
}
