use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A verified tailnet caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    /// Stable, DNS-label safe name; keys every signin and backing object.
    pub name: String,
    pub login_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// One entry of the capability grant as sent by the tailnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityRule {
    pub role: String,
    #[serde(default)]
    pub period: Option<String>,
}

/// What the capability allows once validated: a role and a bounded lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub role: String,
    pub ttl: Duration,
}
