//! Registry of the object kinds this process knows how to store and send.
//!
//! One `Scheme` is built at startup and handed to every component that stamps or
//! validates `apiVersion`/`kind`; there is no process-wide instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

/// Implemented by every object type that goes through a store.
pub trait Resource {
    const KIND: &'static str;
}

#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: BTreeMap<String, String>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    /// The kinds used by signins and their backing objects.
    pub fn with_defaults() -> Self {
        let mut s = Self::new();
        // Registration into an empty scheme cannot collide
        let defaults = [
            ("TkaSignin", "tka.dev/v1alpha1"),
            ("ServiceAccount", "v1"),
            ("ClusterRoleBinding", "rbac.authorization.k8s.io/v1"),
            ("TokenRequest", "authentication.k8s.io/v1"),
        ];
        for (kind, api_version) in defaults {
            s.kinds.insert(kind.to_string(), api_version.to_string());
        }
        s
    }

    /// Register a kind. Re-registering with the same version is a no-op.
    pub fn register(&mut self, kind: &str, api_version: &str) -> AppResult<()> {
        match self.kinds.get(kind) {
            Some(existing) if existing == api_version => Ok(()),
            Some(existing) => Err(AppError::internal(
                "scheme_conflict".to_string(),
                format!("kind {} already registered as {}, refusing {}", kind, existing, api_version),
            )),
            None => {
                self.kinds.insert(kind.to_string(), api_version.to_string());
                Ok(())
            }
        }
    }

    pub fn type_meta_for(&self, kind: &str) -> AppResult<TypeMeta> {
        self.kinds
            .get(kind)
            .map(|v| TypeMeta { api_version: v.clone(), kind: kind.to_string() })
            .ok_or_else(|| AppError::internal("unknown_kind".to_string(), format!("kind {} is not registered", kind)))
    }

    pub fn type_meta<R: Resource>(&self) -> AppResult<TypeMeta> { self.type_meta_for(R::KIND) }

    pub fn recognizes(&self, tm: &TypeMeta) -> bool {
        self.kinds.get(&tm.kind).map(|v| v == &tm.api_version).unwrap_or(false)
    }

    pub fn kinds(&self) -> impl Iterator<Item = (&str, &str)> {
        self.kinds.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_signin_and_backing_kinds() {
        let s = Scheme::with_defaults();
        let tm = s.type_meta_for("ClusterRoleBinding").unwrap();
        assert_eq!(tm.api_version, "rbac.authorization.k8s.io/v1");
        assert!(s.recognizes(&TypeMeta { api_version: "v1".into(), kind: "ServiceAccount".into() }));
        assert!(!s.recognizes(&TypeMeta { api_version: "v2".into(), kind: "ServiceAccount".into() }));
        assert!(s.type_meta_for("Pod").is_err());
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let mut s = Scheme::new();
        s.register("Widget", "example.dev/v1").unwrap();
        s.register("Widget", "example.dev/v1").unwrap();
        let err = s.register("Widget", "example.dev/v2").unwrap_err();
        assert_eq!(err.code_str(), "scheme_conflict");
    }
}
