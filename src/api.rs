//! Wire types and routes shared by the HTTP server and the CLI client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signin::{SigninPhase, SigninRecord, SigninStatus};

pub const API_PREFIX: &str = "/api/v1alpha1";
pub const SIGNIN_PATH: &str = "/api/v1alpha1/signin";
pub const STATUS_PATH: &str = "/api/v1alpha1/signin/status";
pub const KUBECONFIG_PATH: &str = "/api/v1alpha1/kubeconfig";
pub const LOGOUT_PATH: &str = "/api/v1alpha1/logout";
pub const HEALTHZ_PATH: &str = "/healthz";

/// Seconds a client should wait before asking again for a pending profile.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigninPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// What callers see of a signin record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninView {
    pub principal: String,
    pub role: String,
    pub valid_until: DateTime<Utc>,
    pub phase: SigninPhase,
    pub status: SigninStatus,
}

impl SigninView {
    pub fn from_record(record: &SigninRecord, now: DateTime<Utc>) -> Self {
        Self {
            principal: record.spec.principal.clone(),
            role: record.spec.role.clone(),
            valid_until: record.spec.valid_until,
            phase: record.phase(now),
            status: record.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: &str) -> Self {
        Self { status: "error".to_string(), code: code.to_string(), message: message.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutState {
    /// Teardown of backing objects is in progress.
    Pending,
    /// Nothing was signed in.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutView {
    pub status: String,
    pub outcome: LogoutState,
}
