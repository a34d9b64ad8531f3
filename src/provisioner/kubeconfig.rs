//! Client configuration handed to a signed-in user.
//!
//! Serialized as JSON, which kubectl reads as YAML.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterInfo;
use crate::signin::object_name;

fn is_false(v: &bool) -> bool { !*v }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub server: String,
    #[serde(rename = "certificate-authority-data", default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default, skip_serializing_if = "is_false")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

impl Kubeconfig {
    pub fn build(info: &ClusterInfo, cluster_name: &str, namespace: &str, principal: &str, token: String) -> Self {
        let user = object_name(principal);
        let context = format!("{}-{}", cluster_name, principal);
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: ClusterEntry {
                    server: info.server.clone(),
                    certificate_authority_data: info.certificate_authority_data.clone(),
                    insecure_skip_tls_verify: info.insecure_skip_tls_verify,
                },
            }],
            users: vec![NamedUser { name: user.clone(), user: UserEntry { token } }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextEntry { cluster: cluster_name.to_string(), user, namespace: Some(namespace.to_string()) },
            }],
            current_context: context,
        }
    }

    /// Bearer token of the current context's user.
    pub fn token(&self) -> Option<&str> {
        let ctx = self.contexts.iter().find(|c| c.name == self.current_context)?;
        self.users.iter().find(|u| u.name == ctx.context.user).map(|u| u.user.token.as_str())
    }

    pub fn server(&self) -> Option<&str> { self.clusters.first().map(|c| c.cluster.server.as_str()) }

    /// Write to a fresh `kubeconfig-*.yaml` under `dir` (the system temp dir when `None`).
    /// The file is kept after return and is only readable by the owner.
    pub fn write_temp(&self, dir: Option<&Path>) -> std::io::Result<PathBuf> {
        let body = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        let mut builder = tempfile::Builder::new();
        builder.prefix("kubeconfig-").suffix(".yaml");
        let mut file = match dir {
            Some(d) => builder.tempfile_in(d)?,
            None => builder.tempfile()?,
        };
        file.write_all(&body)?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ClusterInfo {
        ClusterInfo {
            server: "https://k8s.example:6443".into(),
            certificate_authority_data: Some("Q0EK".into()),
            insecure_skip_tls_verify: false,
        }
    }

    #[test]
    fn names_follow_cluster_and_principal() {
        let k = Kubeconfig::build(&info(), "prod", "tka", "alice", "tok".into());
        assert_eq!(k.current_context, "prod-alice");
        assert_eq!(k.users[0].name, "tka-user-alice");
        assert_eq!(k.contexts[0].context.namespace.as_deref(), Some("tka"));
        assert_eq!(k.token(), Some("tok"));
        assert_eq!(k.server(), Some("https://k8s.example:6443"));

        let v = serde_json::to_value(&k).unwrap();
        assert_eq!(v["apiVersion"], "v1");
        assert_eq!(v["kind"], "Config");
        assert_eq!(v["current-context"], "prod-alice");
        assert_eq!(v["clusters"][0]["cluster"]["certificate-authority-data"], "Q0EK");
        assert!(v["clusters"][0]["cluster"].get("insecure-skip-tls-verify").is_none());
    }

    #[test]
    fn temp_file_is_named_for_kubectl_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let k = Kubeconfig::build(&info(), "prod", "tka", "alice", "tok".into());
        let path = k.write_temp(Some(dir.path())).unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("kubeconfig-") && file_name.ends_with(".yaml"), "{}", file_name);
        let back: Kubeconfig = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, k);
    }
}
