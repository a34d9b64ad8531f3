//! Kubernetes REST adapter.
//!
//! Speaks plain JSON to the API server with `reqwest`. Inside a pod it picks up the
//! mounted service-account token and CA bundle; the token file is re-read on every
//! request so projected-token rotation is honoured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{selector_string, ClusterApi, ClusterInfo, ClusterRoleBinding, ServiceAccount, TokenRequest};
use crate::scheme::{Resource, Scheme, TypeMeta};
use crate::store::StoreError;

pub const IN_CLUSTER_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub enum Credentials {
    /// Re-read before every request.
    TokenFile(PathBuf),
    Static(String),
    None,
}

#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct AnnotationPatch<'a> {
    metadata: AnnotationPatchMeta<'a>,
}

#[derive(Serialize)]
struct AnnotationPatchMeta<'a> {
    annotations: &'a BTreeMap<String, String>,
}

pub struct KubeCluster {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    info: ClusterInfo,
    scheme: Arc<Scheme>,
}

impl KubeCluster {
    /// Build an adapter against an explicit endpoint.
    pub fn with_endpoint(
        scheme: Arc<Scheme>,
        base_url: &str,
        credentials: Credentials,
        info: ClusterInfo,
        client: reqwest::Client,
    ) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string(), credentials, info, scheme }
    }

    /// Configure from the pod environment (`KUBERNETES_SERVICE_HOST`/`_PORT` and the
    /// mounted service-account directory). `public_server` overrides the endpoint
    /// written into connection profiles.
    pub fn in_cluster(scheme: Arc<Scheme>, request_timeout: Duration, public_server: Option<String>) -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST is not set; not running in a cluster?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        let base_url = format!("https://{}:{}", host, port);

        let dir = Path::new(IN_CLUSTER_DIR);
        let ca_path = dir.join("ca.crt");
        let ca = std::fs::read(&ca_path).with_context(|| format!("reading cluster CA bundle {}", ca_path.display()))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .add_root_certificate(reqwest::Certificate::from_pem(&ca).context("parsing cluster CA bundle")?)
            .build()
            .context("building API server client")?;

        let info = ClusterInfo {
            server: public_server.unwrap_or_else(|| base_url.clone()),
            certificate_authority_data: Some(base64::engine::general_purpose::STANDARD.encode(&ca)),
            insecure_skip_tls_verify: false,
        };
        debug!(target: "tka::kube", base_url = %base_url, "configured in-cluster API client");
        Ok(Self::with_endpoint(scheme, &base_url, Credentials::TokenFile(dir.join("token")), info, client))
    }

    async fn bearer(&self) -> Result<Option<String>, StoreError> {
        match &self.credentials {
            Credentials::TokenFile(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                Ok(Some(raw.trim().to_string()))
            }
            Credentials::Static(t) => Ok(Some(t.clone())),
            Credentials::None => Ok(None),
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, StoreError> {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = self.bearer().await? {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    /// Send and decode, mapping API statuses onto `StoreError`.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, kind: &'static str, name: &str) -> Result<T, StoreError> {
        let bytes = self.send_raw(req, kind, name).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_raw(&self, req: RequestBuilder, kind: &'static str, name: &str) -> Result<Vec<u8>, StoreError> {
        let resp = req.send().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }
        let message = serde_json::from_slice::<ApiStatus>(&bytes)
            .map(|s| s.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound { kind, name: name.to_string() },
            StatusCode::CONFLICT => StoreError::AlreadyExists { kind, name: name.to_string() },
            StatusCode::UNPROCESSABLE_ENTITY => StoreError::Invalid { kind, name: name.to_string(), reason: message },
            s => StoreError::Rejected { status: s.as_u16(), message },
        })
    }

    async fn get_opt<T: DeserializeOwned>(&self, path: &str, kind: &'static str, name: &str) -> Result<Option<T>, StoreError> {
        let req = self.request(Method::GET, path).await?;
        match self.send::<T>(req, kind, name).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
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

    /// List responses omit per-item type information.
    fn stamp<R: Resource>(&self, tm: &mut TypeMeta) {
        if let Ok(meta) = self.scheme.type_meta::<R>() {
            *tm = meta;
        }
    }

    fn sa_path(namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(n) => format!("/api/v1/namespaces/{}/serviceaccounts/{}", namespace, n),
            None => format!("/api/v1/namespaces/{}/serviceaccounts", namespace),
        }
    }

    fn binding_path(name: Option<&str>) -> String {
        match name {
            Some(n) => format!("/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/{}", n),
            None => "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings".to_string(),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>, StoreError> {
        let mut sa: Option<ServiceAccount> = self.get_opt(&Self::sa_path(namespace, Some(name)), ServiceAccount::KIND, name).await?;
        if let Some(sa) = sa.as_mut() {
            self.stamp::<ServiceAccount>(&mut sa.type_meta);
        }
        Ok(sa)
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, StoreError> {
        self.check_kind::<ServiceAccount>(&sa.type_meta, &sa.metadata.name)?;
        let namespace = sa.metadata.namespace.as_deref().unwrap_or_default();
        let req = self.request(Method::POST, &Self::sa_path(namespace, None)).await?.json(sa);
        self.send(req, ServiceAccount::KIND, &sa.metadata.name).await
    }

    async fn annotate_service_account(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ServiceAccount, StoreError> {
        let body = serde_json::to_vec(&AnnotationPatch { metadata: AnnotationPatchMeta { annotations } })?;
        let req = self
            .request(Method::PATCH, &Self::sa_path(namespace, Some(name)))
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body);
        self.send(req, ServiceAccount::KIND, name).await
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let req = self.request(Method::DELETE, &Self::sa_path(namespace, Some(name))).await?;
        self.send_raw(req, ServiceAccount::KIND, name).await.map(|_| ())
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ServiceAccount>, StoreError> {
        let req = self
            .request(Method::GET, &Self::sa_path(namespace, None))
            .await?
            .query(&[("labelSelector", selector_string(selector))]);
        let list: ObjectList<ServiceAccount> = self.send(req, ServiceAccount::KIND, namespace).await?;
        let mut items = list.items;
        for sa in items.iter_mut() {
            self.stamp::<ServiceAccount>(&mut sa.type_meta);
        }
        Ok(items)
    }

    async fn get_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>, StoreError> {
        let mut b: Option<ClusterRoleBinding> = self.get_opt(&Self::binding_path(Some(name)), ClusterRoleBinding::KIND, name).await?;
        if let Some(b) = b.as_mut() {
            self.stamp::<ClusterRoleBinding>(&mut b.type_meta);
        }
        Ok(b)
    }

    async fn create_binding(&self, binding: &ClusterRoleBinding) -> Result<ClusterRoleBinding, StoreError> {
        self.check_kind::<ClusterRoleBinding>(&binding.type_meta, &binding.metadata.name)?;
        let req = self.request(Method::POST, &Self::binding_path(None)).await?.json(binding);
        self.send(req, ClusterRoleBinding::KIND, &binding.metadata.name).await
    }

    async fn annotate_binding(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<ClusterRoleBinding, StoreError> {
        let body = serde_json::to_vec(&AnnotationPatch { metadata: AnnotationPatchMeta { annotations } })?;
        let req = self
            .request(Method::PATCH, &Self::binding_path(Some(name)))
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body);
        self.send(req, ClusterRoleBinding::KIND, name).await
    }

    async fn delete_binding(&self, name: &str) -> Result<(), StoreError> {
        let req = self.request(Method::DELETE, &Self::binding_path(Some(name))).await?;
        self.send_raw(req, ClusterRoleBinding::KIND, name).await.map(|_| ())
    }

    async fn list_bindings(&self, selector: &BTreeMap<String, String>) -> Result<Vec<ClusterRoleBinding>, StoreError> {
        let req = self
            .request(Method::GET, &Self::binding_path(None))
            .await?
            .query(&[("labelSelector", selector_string(selector))]);
        let list: ObjectList<ClusterRoleBinding> = self.send(req, ClusterRoleBinding::KIND, "clusterrolebindings").await?;
        let mut items = list.items;
        for b in items.iter_mut() {
            self.stamp::<ClusterRoleBinding>(&mut b.type_meta);
        }
        Ok(items)
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<TokenRequest, StoreError> {
        self.check_kind::<TokenRequest>(&request.type_meta, service_account)?;
        let path = format!("{}/token", Self::sa_path(namespace, Some(service_account)));
        let req = self.request(Method::POST, &path).await?.json(request);
        match self.send(req, TokenRequest::KIND, service_account).await {
            // the token subresource reports the parent as missing
            Err(StoreError::NotFound { .. }) => {
                Err(StoreError::NotFound { kind: ServiceAccount::KIND, name: service_account.to_string() })
            }
            other => other,
        }
    }

    fn cluster_info(&self) -> &ClusterInfo { &self.info }
}
