//! Signin record: declared intent (spec), observed state (status) and store metadata.
//!
//! Also holds the naming scheme shared by the registrar, the provisioner and the
//! sweeper, so every component derives object names and annotations the same way.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::scheme::{Resource, TypeMeta};

/// Annotation stamped on every backing object; identical to the record's `validUntil`.
pub const VALID_UNTIL_ANNOTATION: &str = "tka.dev/valid-until";
pub const PRINCIPAL_LABEL: &str = "tka.dev/principal";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "tka";
/// Keeps a record in the store until its backing objects are gone.
pub const TEARDOWN_FINALIZER: &str = "tka.dev/teardown";

pub const CONDITION_READY: &str = "Ready";
pub const REASON_PROVISIONED: &str = "Provisioned";
pub const REASON_PROVISIONING_FAILED: &str = "ProvisioningFailed";

const MAX_PRINCIPAL_LEN: usize = 63;

pub fn object_name(principal: &str) -> String { format!("tka-user-{}", principal) }

pub fn binding_name(principal: &str) -> String { format!("{}-binding", object_name(principal)) }

/// Derive the principal from a tailnet login name.
///
/// Lossy mappings get a short hash suffix so distinct logins never collide.
pub fn principal_from_login(login: &str) -> Option<String> {
    let lowered = login.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut lossy = login.trim() != lowered;
    for ch in lowered.chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '-' {
            ch
        } else {
            lossy = true;
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.len() != out.len() {
        lossy = true;
    }
    if trimmed.is_empty() {
        return None;
    }
    if lossy || trimmed.len() > MAX_PRINCIPAL_LEN {
        return Some(with_hash_suffix(trimmed, login.trim()));
    }
    Some(trimmed.to_string())
}

/// `<name>-<8 hex of sha256(login)>`, with `name` cut so the result fits a label value.
fn with_hash_suffix(name: &str, login: &str) -> String {
    let digest = Sha256::digest(login.as_bytes());
    let suffix: String = format!("{:x}", digest).chars().take(8).collect();
    let keep = name.len().min(MAX_PRINCIPAL_LEN - suffix.len() - 1);
    let head = name[..keep].trim_end_matches(|c| c == '-' || c == '.');
    format!("{}-{}", head, suffix)
}

/// Render a duration the way Go's `time.Duration` prints (`5m0s`, `1h30m0s`, `1.5s`).
pub fn format_validity(d: Duration) -> String {
    let negative = d < Duration::zero();
    let d = if negative { -d } else { d };
    let total_ms = d.num_milliseconds();
    let sign = if negative { "-" } else { "" };
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1000 {
        return format!("{}{}ms", sign, total_ms);
    }
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    let secs_str = if millis == 0 {
        format!("{}s", secs)
    } else {
        let frac = format!("{:03}", millis);
        format!("{}.{}s", secs, frac.trim_end_matches('0'))
    };
    if hours > 0 {
        format!("{}{}h{}m{}", sign, hours, minutes, secs_str)
    } else if minutes > 0 {
        format!("{}{}m{}", sign, minutes, secs_str)
    } else {
        format!("{}{}", sign, secs_str)
    }
}

/// Parse a period such as `90s`, `30m`, `1h30m`, `2d` or `1h0m0s`.
pub fn parse_period(input: &str) -> Option<std::time::Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let mut total_ms: u64 = 0;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    let mut saw_unit = false;
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num.push(ch);
            continue;
        }
        if num.is_empty() {
            return None;
        }
        let value: u64 = num.parse().ok()?;
        num.clear();
        let unit_ms: u64 = match ch {
            'd' => 86_400_000,
            'h' => 3_600_000,
            's' => 1000,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    1
                } else {
                    60_000
                }
            }
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(unit_ms)?)?;
        saw_unit = true;
    }
    // trailing digits without a unit are ambiguous
    if !num.is_empty() || !saw_unit {
        return None;
    }
    Some(std::time::Duration::from_millis(total_ms))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninSpec {
    pub principal: String,
    pub role: String,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninStatus {
    pub provisioned: bool,
    pub signed_in_at: DateTime<Utc>,
    pub validity_period: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SigninStatus {
    pub fn new(signed_in_at: DateTime<Utc>, valid_until: DateTime<Utc>) -> Self {
        Self {
            provisioned: false,
            signed_in_at,
            validity_period: format_validity(valid_until - signed_in_at),
            conditions: Vec::new(),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition; the transition time only moves when status or reason changes.
    pub fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: String, now: DateTime<Utc>) {
        if let Some(c) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if c.status != status || c.reason != reason {
                c.last_transition_time = now;
            }
            c.status = status;
            c.reason = reason.to_string();
            c.message = message;
            return;
        }
        self.conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub resource_version: u64,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigninPhase {
    Pending,
    Provisioned,
    Expired,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninRecord {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: RecordMeta,
    pub spec: SigninSpec,
    pub status: SigninStatus,
}

impl Resource for SigninRecord {
    const KIND: &'static str = "TkaSignin";
}

impl SigninRecord {
    /// A fresh, not yet stored record. The store assigns uid, generation and version.
    pub fn new(type_meta: TypeMeta, principal: &str, role: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        let valid_until = now + ttl;
        Self {
            type_meta,
            metadata: RecordMeta {
                name: object_name(principal),
                uid: String::new(),
                generation: 0,
                resource_version: 0,
                creation_timestamp: now,
                deletion_timestamp: None,
                finalizers: vec![TEARDOWN_FINALIZER.to_string()],
            },
            spec: SigninSpec { principal: principal.to_string(), role: role.to_string(), valid_until },
            status: SigninStatus::new(now, valid_until),
        }
    }

    pub fn principal(&self) -> &str { &self.spec.principal }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now >= self.spec.valid_until }

    /// Neither being deleted nor past its validity window.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool { !self.is_deleting() && !self.is_expired(now) }

    pub fn has_finalizer(&self, f: &str) -> bool { self.metadata.finalizers.iter().any(|x| x == f) }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let r = self.spec.valid_until - now;
        if r < Duration::zero() { Duration::zero() } else { r }
    }

    pub fn phase(&self, now: DateTime<Utc>) -> SigninPhase {
        if self.is_deleting() {
            SigninPhase::Deleted
        } else if self.is_expired(now) {
            SigninPhase::Expired
        } else if self.status.provisioned {
            SigninPhase::Provisioned
        } else {
            SigninPhase::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> { DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc) }

    #[test]
    fn go_style_validity_rendering() {
        assert_eq!(format_validity(Duration::minutes(5)), "5m0s");
        assert_eq!(format_validity(Duration::hours(1) + Duration::minutes(30)), "1h30m0s");
        assert_eq!(format_validity(Duration::seconds(1)), "1s");
        assert_eq!(format_validity(Duration::milliseconds(1500)), "1.5s");
        assert_eq!(format_validity(Duration::milliseconds(250)), "250ms");
        assert_eq!(format_validity(Duration::zero()), "0s");
        assert_eq!(format_validity(Duration::hours(26)), "26h0m0s");
    }

    #[test]
    fn period_parsing() {
        assert_eq!(parse_period("90s"), Some(std::time::Duration::from_secs(90)));
        assert_eq!(parse_period("1h30m"), Some(std::time::Duration::from_secs(5400)));
        assert_eq!(parse_period("1h0m0s"), Some(std::time::Duration::from_secs(3600)));
        assert_eq!(parse_period("2d"), Some(std::time::Duration::from_secs(172_800)));
        assert_eq!(parse_period("500ms"), Some(std::time::Duration::from_millis(500)));
        assert_eq!(parse_period("15"), None);
        assert_eq!(parse_period("h"), None);
        assert_eq!(parse_period("3w"), None);
        assert_eq!(parse_period(""), None);
    }

    #[test]
    fn principal_derivation() {
        assert_eq!(principal_from_login("alice").as_deref(), Some("alice"));
        assert_eq!(principal_from_login("node-1.example").as_deref(), Some("node-1.example"));

        let p = principal_from_login("Alice@Example.com").unwrap();
        assert!(p.starts_with("alice-example.com-"), "{}", p);
        assert_eq!(p.len(), "alice-example.com-".len() + 8);

        // distinct logins that sanitize alike stay distinct
        let a = principal_from_login("bob@corp").unwrap();
        let b = principal_from_login("bob_corp").unwrap();
        assert_ne!(a, b);

        assert!(principal_from_login("@@@").is_none());
        assert!(principal_from_login("   ").is_none());

        let long = "x".repeat(100);
        let p = principal_from_login(&long).unwrap();
        assert!(p.len() <= 63);
    }

    #[test]
    fn long_and_lossy_logins_share_the_suffix_rule() {
        let long = "a".repeat(100);
        let p = principal_from_login(&long).unwrap();
        assert_eq!(p.len(), 63);
        let (head, suffix) = p.rsplit_once('-').unwrap();
        assert_eq!(head, "a".repeat(54));
        let expected: String = format!("{:x}", Sha256::digest(long.as_bytes())).chars().take(8).collect();
        assert_eq!(suffix, expected);

        // lossy and long: same shape, hash of the original login
        let login = format!("{}@corp", "B".repeat(80));
        let p = principal_from_login(&login).unwrap();
        assert_eq!(p.len(), 63);
        let expected: String = format!("{:x}", Sha256::digest(login.as_bytes())).chars().take(8).collect();
        assert!(p.ends_with(&format!("-{}", expected)));
        assert!(p.starts_with("bbbb"));

        // a cut landing on a separator never leaves `--`
        let p = principal_from_login(&format!("{}-{}", "c".repeat(53), "d".repeat(20))).unwrap();
        assert!(!p.contains("--"), "{}", p);
    }

    #[test]
    fn record_lifecycle_predicates() {
        let now = ts("2026-01-01T10:00:00Z");
        let tm = TypeMeta { api_version: "tka.dev/v1alpha1".into(), kind: "TkaSignin".into() };
        let mut r = SigninRecord::new(tm, "alice", "viewer", now, Duration::minutes(5));
        assert_eq!(r.metadata.name, "tka-user-alice");
        assert_eq!(r.status.validity_period, "5m0s");
        assert_eq!(r.spec.valid_until, ts("2026-01-01T10:05:00Z"));
        assert!(r.has_finalizer(TEARDOWN_FINALIZER));
        assert_eq!(r.phase(now), SigninPhase::Pending);

        r.status.provisioned = true;
        assert_eq!(r.phase(now), SigninPhase::Provisioned);
        assert_eq!(r.remaining(now + Duration::minutes(2)), Duration::minutes(3));

        let later = ts("2026-01-01T10:05:00Z");
        assert!(r.is_expired(later));
        assert!(!r.is_live(later));
        assert_eq!(r.phase(later), SigninPhase::Expired);
        assert_eq!(r.remaining(later + Duration::minutes(1)), Duration::zero());

        r.metadata.deletion_timestamp = Some(now);
        assert_eq!(r.phase(now), SigninPhase::Deleted);
    }

    #[test]
    fn condition_transition_time_only_moves_on_change() {
        let t0 = ts("2026-01-01T10:00:00Z");
        let t1 = ts("2026-01-01T10:01:00Z");
        let mut st = SigninStatus::new(t0, t0 + Duration::minutes(5));
        st.set_condition(CONDITION_READY, false, REASON_PROVISIONING_FAILED, "attempt 5".into(), t0);
        st.set_condition(CONDITION_READY, false, REASON_PROVISIONING_FAILED, "attempt 6".into(), t1);
        let c = st.condition(CONDITION_READY).unwrap();
        assert_eq!(c.last_transition_time, t0);
        assert_eq!(c.message, "attempt 6");
        st.set_condition(CONDITION_READY, true, REASON_PROVISIONED, String::new(), t1);
        assert_eq!(st.condition(CONDITION_READY).unwrap().last_transition_time, t1);
        assert_eq!(st.conditions.len(), 1);
    }

    #[test]
    fn wire_shape_uses_camel_case_and_rfc3339() {
        let now = ts("2026-01-01T10:00:00Z");
        let tm = TypeMeta { api_version: "tka.dev/v1alpha1".into(), kind: "TkaSignin".into() };
        let r = SigninRecord::new(tm, "alice", "viewer", now, Duration::minutes(5));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["kind"], "TkaSignin");
        assert_eq!(v["apiVersion"], "tka.dev/v1alpha1");
        assert_eq!(v["spec"]["validUntil"], "2026-01-01T10:05:00Z");
        assert_eq!(v["status"]["signedInAt"], "2026-01-01T10:00:00Z");
        assert_eq!(v["status"]["validityPeriod"], "5m0s");
        assert_eq!(v["status"]["provisioned"], false);
    }
}
