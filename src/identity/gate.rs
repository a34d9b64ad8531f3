use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::principal::{CapabilityRule, Grant, Principal};
use super::request_context::{
    GateRequest, HEADER_APP_CAPABILITIES, HEADER_FUNNEL_REQUEST, HEADER_USER_LOGIN, HEADER_USER_NAME,
};
use crate::error::{AppError, AppResult};
use crate::signin::{parse_period, principal_from_login};

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Capability name looked up in the app-capabilities header.
    pub capability: String,
    /// Empty means any non-empty role is accepted.
    pub allowed_roles: Vec<String>,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    /// Only accept connections from the local serve proxy.
    pub require_loopback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub principal: Principal,
    pub grant: Grant,
}

/// Validates that a request came through the tailnet and carries a usable grant.
/// Pure: no I/O, no state.
#[derive(Debug, Clone)]
pub struct IdentityGate {
    config: GateConfig,
}

impl IdentityGate {
    pub fn new(config: GateConfig) -> Self { Self { config } }

    pub fn config(&self) -> &GateConfig { &self.config }

    pub fn authenticate(&self, req: &GateRequest) -> AppResult<Authenticated> {
        let principal = self.identify(req)?;
        let grant = self.grant(req).map_err(|e| {
            debug!(principal = %principal.name, code = %e.code, "capability rejected");
            e
        })?;
        Ok(Authenticated { principal, grant })
    }

    /// Transport and identity checks only; failures are `Auth` (401).
    pub fn identify(&self, req: &GateRequest) -> AppResult<Principal> {
        if req.headers.contains_key(HEADER_FUNNEL_REQUEST) {
            return Err(AppError::auth("funnel_rejected", "requests through a public funnel are not accepted"));
        }
        if self.config.require_loopback {
            let trusted = req.remote_addr.map(|a| a.ip().is_loopback()).unwrap_or(false);
            if !trusted {
                return Err(AppError::auth(
                    "untrusted_transport".to_string(),
                    format!("peer {:?} is not the local tailnet proxy", req.remote_addr),
                ));
            }
        }
        let login = req
            .header(HEADER_USER_LOGIN)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::auth("missing_identity", "no tailnet user identity on request"))?;
        let name = principal_from_login(login).ok_or_else(|| {
            AppError::auth("invalid_identity".to_string(), format!("login {:?} does not yield a usable principal", login))
        })?;
        Ok(Principal {
            name,
            login_name: login.to_string(),
            display_name: req.header(HEADER_USER_NAME).map(str::to_string).filter(|s| !s.is_empty()),
        })
    }

    /// Capability checks; failures are `Forbidden` (403).
    pub fn grant(&self, req: &GateRequest) -> AppResult<Grant> {
        let raw = req
            .header(HEADER_APP_CAPABILITIES)
            .ok_or_else(|| AppError::forbidden("missing_capability", "request carries no application capabilities"))?;
        let caps: serde_json::Map<String, Value> = serde_json::from_str(raw)
            .map_err(|e| AppError::forbidden("malformed_capability", "capability header is not a JSON object").with_cause(e))?;
        let rules = caps.get(&self.config.capability).ok_or_else(|| {
            AppError::forbidden("missing_capability".to_string(), format!("capability {} not granted", self.config.capability))
        })?;
        let rules: Vec<CapabilityRule> = serde_json::from_value(rules.clone())
            .map_err(|e| AppError::forbidden("malformed_capability", "capability rules are malformed").with_cause(e))?;
        let rule = match rules.as_slice() {
            [one] => one,
            [] => return Err(AppError::forbidden("missing_capability", "capability grants no rules")),
            _ => {
                return Err(AppError::forbidden(
                    "ambiguous_capability".to_string(),
                    format!("capability carries {} rules, expected exactly one", rules.len()),
                ))
            }
        };

        let role = rule.role.trim();
        if role.is_empty() {
            return Err(AppError::forbidden("invalid_role", "capability rule has an empty role"));
        }
        if !self.config.allowed_roles.is_empty() && !self.config.allowed_roles.iter().any(|r| r == role) {
            return Err(AppError::forbidden("role_not_allowed".to_string(), format!("role {} is not allowed", role)));
        }

        let ttl = match rule.period.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            None => self.config.default_ttl,
            Some(p) => parse_period(p)
                .ok_or_else(|| AppError::forbidden("invalid_period".to_string(), format!("period {:?} is not a duration", p)))?,
        };
        if ttl.is_zero() {
            return Err(AppError::forbidden("invalid_period", "period must be positive"));
        }
        Ok(Grant { role: role.to_string(), ttl: ttl.min(self.config.max_ttl) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use std::net::SocketAddr;

    const CAP: &str = "tka.dev/cap/cluster-access";

    fn gate(allowed: &[&str]) -> IdentityGate {
        IdentityGate::new(GateConfig {
            capability: CAP.into(),
            allowed_roles: allowed.iter().map(|s| s.to_string()).collect(),
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(4 * 3600),
            require_loopback: true,
        })
    }

    fn req(login: Option<&str>, caps: Option<&str>) -> GateRequest {
        let mut h = HeaderMap::new();
        if let Some(l) = login {
            h.insert(HEADER_USER_LOGIN, HeaderValue::from_str(l).unwrap());
        }
        if let Some(c) = caps {
            h.insert(HEADER_APP_CAPABILITIES, HeaderValue::from_str(c).unwrap());
        }
        GateRequest::new(Some("127.0.0.1:40000".parse::<SocketAddr>().unwrap()), h)
    }

    fn caps(rules: &str) -> String { format!(r#"{{"{}":{}}}"#, CAP, rules) }

    #[test]
    fn accepts_single_rule_and_defaults_period() {
        let ok = gate(&[]).authenticate(&req(Some("alice"), Some(&caps(r#"[{"role":"viewer"}]"#)))).unwrap();
        assert_eq!(ok.principal.name, "alice");
        assert_eq!(ok.grant.role, "viewer");
        assert_eq!(ok.grant.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn period_is_parsed_and_clamped() {
        let g = gate(&[]);
        let ok = g.authenticate(&req(Some("alice"), Some(&caps(r#"[{"role":"viewer","period":"5m"}]"#)))).unwrap();
        assert_eq!(ok.grant.ttl, Duration::from_secs(300));
        let ok = g.authenticate(&req(Some("alice"), Some(&caps(r#"[{"role":"viewer","period":"48h"}]"#)))).unwrap();
        assert_eq!(ok.grant.ttl, Duration::from_secs(4 * 3600));
        let err = g.authenticate(&req(Some("alice"), Some(&caps(r#"[{"role":"viewer","period":"0s"}]"#)))).unwrap_err();
        assert_eq!(err.code_str(), "invalid_period");
        let err = g.authenticate(&req(Some("alice"), Some(&caps(r#"[{"role":"viewer","period":"soon"}]"#)))).unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn identity_failures_are_unauthorized() {
        let g = gate(&[]);
        let c = caps(r#"[{"role":"viewer"}]"#);
        assert_eq!(g.authenticate(&req(None, Some(&c))).unwrap_err().http_status(), 401);
        assert_eq!(g.authenticate(&req(Some("  "), Some(&c))).unwrap_err().code_str(), "missing_identity");
        assert_eq!(g.authenticate(&req(Some("@@"), Some(&c))).unwrap_err().code_str(), "invalid_identity");

        let mut funnel = req(Some("alice"), Some(&c));
        funnel.headers.insert(HEADER_FUNNEL_REQUEST, HeaderValue::from_static("?1"));
        assert_eq!(g.authenticate(&funnel).unwrap_err().code_str(), "funnel_rejected");

        let mut remote = req(Some("alice"), Some(&c));
        remote.remote_addr = Some("100.64.0.7:5555".parse().unwrap());
        assert_eq!(g.authenticate(&remote).unwrap_err().code_str(), "untrusted_transport");
        remote.remote_addr = None;
        assert!(g.authenticate(&remote).unwrap_err().is_auth());
    }

    #[test]
    fn loopback_requirement_can_be_relaxed() {
        let mut cfg = gate(&[]).config().clone();
        cfg.require_loopback = false;
        let mut r = req(Some("alice"), Some(&caps(r#"[{"role":"viewer"}]"#)));
        r.remote_addr = Some("100.64.0.7:5555".parse().unwrap());
        assert!(IdentityGate::new(cfg).authenticate(&r).is_ok());
    }

    #[test]
    fn capability_failures_are_forbidden() {
        let g = gate(&["viewer"]);
        let cases = [
            (None, "missing_capability"),
            (Some("not json".to_string()), "malformed_capability"),
            (Some(r#"{"other/cap":[{"role":"viewer"}]}"#.to_string()), "missing_capability"),
            (Some(caps("[]")), "missing_capability"),
            (Some(caps(r#"[{"role":"viewer"},{"role":"viewer"}]"#)), "ambiguous_capability"),
            (Some(caps(r#"[{"role":""}]"#)), "invalid_role"),
            (Some(caps(r#"[{"role":"cluster-admin"}]"#)), "role_not_allowed"),
            (Some(caps(r#"{"role":"viewer"}"#)), "malformed_capability"),
        ];
        for (header, code) in cases {
            let err = g.authenticate(&req(Some("alice"), header.as_deref())).unwrap_err();
            assert_eq!(err.code_str(), code, "header {:?}", header);
            assert_eq!(err.http_status(), 403);
        }
    }

    #[test]
    fn display_name_is_optional_metadata() {
        let mut r = req(Some("Alice@Example.com"), Some(&caps(r#"[{"role":"viewer"}]"#)));
        r.headers.insert(HEADER_USER_NAME, HeaderValue::from_static("Alice Example"));
        let ok = gate(&[]).authenticate(&r).unwrap();
        assert_eq!(ok.principal.login_name, "Alice@Example.com");
        assert_eq!(ok.principal.display_name.as_deref(), Some("Alice Example"));
        assert!(ok.principal.name.starts_with("alice-example.com-"));
    }
}
