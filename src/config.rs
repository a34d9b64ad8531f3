//!
//! Server configuration
//! --------------------
//! `ServerConfig` collects every tunable of the signin server. Values come from
//! `TKA_*` environment variables and are overridden by command-line flags; unset
//! values fall back to the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::controller::{ControllerConfig, RetryPolicy};
use crate::error::{AppError, AppResult};
use crate::identity::GateConfig;
use crate::provisioner::ProvisionerConfig;
use crate::signin::parse_period;

pub const DEFAULT_PORT: u16 = 8123;
pub const DEFAULT_CAPABILITY: &str = "tka.dev/cap/cluster-access";

/// Where backing objects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process store and cluster; state only survives via `state_dir`.
    Memory,
    /// Kubernetes API server reached from inside a pod.
    Kube,
}

impl FromStr for Backend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "kube" | "kubernetes" => Ok(Backend::Kube),
            other => Err(AppError::user("invalid_backend".to_string(), format!("unknown backend {:?} (memory|kube)", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: IpAddr,
    pub port: u16,
    pub capability: String,
    pub allowed_roles: Vec<String>,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub require_loopback: bool,
    /// Namespace for service accounts. Required.
    pub namespace: String,
    pub cluster_name: String,
    /// Overrides the API server URL written into connection profiles.
    pub api_server: Option<String>,
    pub token_audiences: Vec<String>,
    pub backend: Backend,
    /// Snapshot directory for the memory signin store.
    pub state_dir: Option<PathBuf>,
    pub workers: usize,
    pub resync_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            capability: DEFAULT_CAPABILITY.to_string(),
            allowed_roles: Vec::new(),
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(24 * 3600),
            require_loopback: true,
            namespace: String::new(),
            cluster_name: "tka".to_string(),
            api_server: None,
            token_audiences: Vec::new(),
            backend: Backend::Memory,
            state_dir: None,
            workers: 4,
            resync_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

pub const USAGE: &str = "tka-server\n\nUSAGE:\n  tka-server --namespace NS [OPTIONS]\n\nOPTIONS:\n  --listen ADDR             Listen address (env: TKA_LISTEN_ADDR, default 127.0.0.1)\n  --port N                  HTTP port (env: TKA_PORT, default 8123)\n  --capability NAME         Capability key in the app-capabilities header (env: TKA_CAPABILITY)\n  --allowed-roles A,B       Roles that may be granted; empty allows any (env: TKA_ALLOWED_ROLES)\n  --default-ttl DUR         Validity when the capability names no period (env: TKA_DEFAULT_TTL, default 1h)\n  --max-ttl DUR             Upper bound on validity (env: TKA_MAX_TTL, default 24h)\n  --require-loopback [bool] Only accept requests from the local proxy (env: TKA_REQUIRE_LOOPBACK, default true)\n  --no-require-loopback     Accept requests from any peer\n  --namespace NS            Namespace for service accounts (env: TKA_NAMESPACE, required)\n  --cluster-name NAME       Cluster name in kubeconfigs (env: TKA_CLUSTER_NAME, default tka)\n  --api-server URL          API server URL written into kubeconfigs (env: TKA_API_SERVER)\n  --token-audiences A,B     Audiences for minted tokens (env: TKA_TOKEN_AUDIENCES)\n  --backend memory|kube     Backing object store (env: TKA_BACKEND, default memory)\n  --state-dir PATH          Snapshot directory for signin records (env: TKA_STATE_DIR)\n  --workers N               Reconcile workers (env: TKA_WORKERS, default 4)\n  --resync-interval DUR     Sweep and resync interval (env: TKA_RESYNC_INTERVAL, default 60s)\n  --request-timeout DUR     Bound on API calls (env: TKA_REQUEST_TIMEOUT, default 10s)\n  --retry-budget N          Failures before a signin is flagged (env: TKA_RETRY_BUDGET, default 5)\n  --retry-initial-ms N      First retry delay (env: TKA_RETRY_INITIAL_MS, default 500)\n  --retry-max-ms N          Retry delay cap (env: TKA_RETRY_MAX_MS, default 30000)\n\nDurations take units: 90s, 5m, 1h30m, 1d.\n";

pub fn has_flag(args: &[String], name: &str) -> bool { args.iter().any(|a| a == name) }

/// Value following `name`, if present.
pub fn arg_value(args: &[String], name: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == name {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

pub fn parse_bool(name: &str, v: &str) -> AppResult<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::user("invalid_config".to_string(), format!("{}: {:?} is not a boolean", name, v))),
    }
}

pub fn parse_port(name: &str, v: &str) -> AppResult<u16> {
    v.trim()
        .parse::<u16>()
        .map_err(|_| AppError::user("invalid_config".to_string(), format!("{}: {:?} is not a port", name, v)))
}

fn parse_num<T: FromStr>(name: &str, v: &str) -> AppResult<T> {
    v.trim()
        .parse::<T>()
        .map_err(|_| AppError::user("invalid_config".to_string(), format!("{}: {:?} is not a number", name, v)))
}

fn parse_duration(name: &str, v: &str) -> AppResult<Duration> {
    parse_period(v.trim())
        .ok_or_else(|| AppError::user("invalid_config".to_string(), format!("{}: {:?} is not a duration", name, v)))
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

impl ServerConfig {
    /// Build from the process environment and `args` (flags win).
    pub fn from_env_and_args(args: &[String]) -> AppResult<Self> {
        Self::from_sources(|k| std::env::var(k).ok(), args)
    }

    /// Build from an arbitrary variable lookup and `args`. Does not validate.
    pub fn from_sources<F>(env: F, args: &[String]) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        // flag first, then env var
        let pick = |flag: &str, var: &str| arg_value(args, flag).or_else(|| env(var));

        if let Some(v) = pick("--listen", "TKA_LISTEN_ADDR") {
            cfg.listen_addr = v
                .trim()
                .parse()
                .map_err(|_| AppError::user("invalid_config".to_string(), format!("listen address {:?} is not an IP", v)))?;
        }
        if let Some(v) = pick("--port", "TKA_PORT") {
            cfg.port = parse_port("port", &v)?;
        }
        if let Some(v) = pick("--capability", "TKA_CAPABILITY") {
            cfg.capability = v.trim().to_string();
        }
        if let Some(v) = pick("--allowed-roles", "TKA_ALLOWED_ROLES") {
            cfg.allowed_roles = parse_list(&v);
        }
        if let Some(v) = pick("--default-ttl", "TKA_DEFAULT_TTL") {
            cfg.default_ttl = parse_duration("default ttl", &v)?;
        }
        if let Some(v) = pick("--max-ttl", "TKA_MAX_TTL") {
            cfg.max_ttl = parse_duration("max ttl", &v)?;
        }
        if let Some(v) = env("TKA_REQUIRE_LOOPBACK") {
            cfg.require_loopback = parse_bool("TKA_REQUIRE_LOOPBACK", &v)?;
        }
        if has_flag(args, "--require-loopback") {
            // bare flag enables; an explicit bool may follow
            cfg.require_loopback = match arg_value(args, "--require-loopback") {
                Some(v) if !v.starts_with("--") => parse_bool("--require-loopback", &v)?,
                _ => true,
            };
        }
        if has_flag(args, "--no-require-loopback") {
            cfg.require_loopback = false;
        }
        if let Some(v) = pick("--namespace", "TKA_NAMESPACE") {
            cfg.namespace = v.trim().to_string();
        }
        if let Some(v) = pick("--cluster-name", "TKA_CLUSTER_NAME") {
            cfg.cluster_name = v.trim().to_string();
        }
        if let Some(v) = pick("--api-server", "TKA_API_SERVER") {
            let v = v.trim();
            cfg.api_server = if v.is_empty() { None } else { Some(v.to_string()) };
        }
        if let Some(v) = pick("--token-audiences", "TKA_TOKEN_AUDIENCES") {
            cfg.token_audiences = parse_list(&v);
        }
        if let Some(v) = pick("--backend", "TKA_BACKEND") {
            cfg.backend = v.parse()?;
        }
        if let Some(v) = pick("--state-dir", "TKA_STATE_DIR") {
            let v = v.trim();
            cfg.state_dir = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = pick("--workers", "TKA_WORKERS") {
            cfg.workers = parse_num("workers", &v)?;
        }
        if let Some(v) = pick("--resync-interval", "TKA_RESYNC_INTERVAL") {
            cfg.resync_interval = parse_duration("resync interval", &v)?;
        }
        if let Some(v) = pick("--request-timeout", "TKA_REQUEST_TIMEOUT") {
            cfg.request_timeout = parse_duration("request timeout", &v)?;
        }
        if let Some(v) = pick("--retry-budget", "TKA_RETRY_BUDGET") {
            cfg.retry.budget = parse_num("retry budget", &v)?;
        }
        if let Some(v) = pick("--retry-initial-ms", "TKA_RETRY_INITIAL_MS") {
            cfg.retry.initial_delay_ms = parse_num("retry initial delay", &v)?;
        }
        if let Some(v) = pick("--retry-max-ms", "TKA_RETRY_MAX_MS") {
            cfg.retry.max_delay_ms = parse_num("retry max delay", &v)?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.namespace.is_empty() {
            return Err(AppError::user("missing_namespace", "a target namespace is required (--namespace or TKA_NAMESPACE)"));
        }
        if self.capability.is_empty() {
            return Err(AppError::user("invalid_config", "capability name must not be empty"));
        }
        if self.workers == 0 {
            return Err(AppError::user("invalid_config", "workers must be greater than 0"));
        }
        if self.default_ttl.is_zero() || self.max_ttl.is_zero() {
            return Err(AppError::user("invalid_config", "ttls must be positive"));
        }
        if self.default_ttl > self.max_ttl {
            return Err(AppError::user(
                "invalid_config".to_string(),
                format!("default ttl {:?} exceeds max ttl {:?}", self.default_ttl, self.max_ttl),
            ));
        }
        if self.resync_interval.is_zero() || self.request_timeout.is_zero() {
            return Err(AppError::user("invalid_config", "resync interval and request timeout must be positive"));
        }
        self.retry.validate()
    }

    pub fn socket_addr(&self) -> SocketAddr { SocketAddr::new(self.listen_addr, self.port) }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            capability: self.capability.clone(),
            allowed_roles: self.allowed_roles.clone(),
            default_ttl: self.default_ttl,
            max_ttl: self.max_ttl,
            require_loopback: self.require_loopback,
        }
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            namespace: self.namespace.clone(),
            cluster_name: self.cluster_name.clone(),
            token_audiences: self.token_audiences.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig { workers: self.workers, resync_interval: self.resync_interval, retry: self.retry.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

    fn build(env: &[(&str, &str)], argv: &[&str]) -> AppResult<ServerConfig> {
        let env: HashMap<String, String> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_sources(|k| env.get(k).cloned(), &args(argv))
    }

    #[test]
    fn defaults_need_a_namespace() {
        let cfg = build(&[], &[]).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.listen_addr.is_loopback());
        assert!(cfg.require_loopback);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.validate().unwrap_err().code, "missing_namespace");
    }

    #[test]
    fn flags_override_environment() {
        let cfg = build(
            &[("TKA_PORT", "9000"), ("TKA_NAMESPACE", "from-env"), ("TKA_ALLOWED_ROLES", "view, edit")],
            &["--port", "9100", "--namespace", "tka-users"],
        )
        .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.namespace, "tka-users");
        assert_eq!(cfg.allowed_roles, vec!["view".to_string(), "edit".to_string()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn durations_and_booleans() {
        let cfg = build(
            &[("TKA_REQUIRE_LOOPBACK", "false"), ("TKA_NAMESPACE", "ns")],
            &["--default-ttl", "30m", "--max-ttl", "8h", "--resync-interval", "15s"],
        )
        .unwrap();
        assert!(!cfg.require_loopback);
        assert_eq!(cfg.default_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.max_ttl, Duration::from_secs(8 * 3600));
        assert_eq!(cfg.resync_interval, Duration::from_secs(15));

        let cfg = build(&[("TKA_REQUIRE_LOOPBACK", "false")], &["--require-loopback"]).unwrap();
        assert!(cfg.require_loopback);
        let cfg = build(&[], &["--no-require-loopback"]).unwrap();
        assert!(!cfg.require_loopback);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(build(&[("TKA_PORT", "http")], &[]).unwrap_err().code, "invalid_config");
        assert_eq!(build(&[], &["--default-ttl", "60"]).unwrap_err().code, "invalid_config");
        assert_eq!(build(&[], &["--backend", "etcd"]).unwrap_err().code, "invalid_backend");

        let cfg = build(&[("TKA_NAMESPACE", "ns")], &["--workers", "0"]).unwrap();
        assert!(cfg.validate().is_err());
        let cfg = build(&[("TKA_NAMESPACE", "ns")], &["--default-ttl", "2d"]).unwrap();
        assert!(cfg.validate().is_err());
        let cfg = build(&[("TKA_NAMESPACE", "ns")], &["--retry-budget", "0"]).unwrap();
        assert_eq!(cfg.validate().unwrap_err().code, "invalid_retry");
    }

    #[test]
    fn derived_component_configs() {
        let cfg = build(&[("TKA_NAMESPACE", "ns"), ("TKA_TOKEN_AUDIENCES", "https://kubernetes.default.svc")], &["--workers", "2"])
            .unwrap();
        assert_eq!(cfg.provisioner_config().namespace, "ns");
        assert_eq!(cfg.provisioner_config().token_audiences.len(), 1);
        assert_eq!(cfg.controller_config().workers, 2);
        assert_eq!(cfg.gate_config().capability, DEFAULT_CAPABILITY);
        assert_eq!(cfg.socket_addr().port(), DEFAULT_PORT);
    }
}
