use std::path::Path;

use chrono::{DateTime, Utc};

use crate::api::SigninView;
use crate::provisioner::ConnectionProfile;
use crate::signin::CONDITION_READY;

fn build_separator(widths: &[usize]) -> String {
    let mut s = String::from("+");
    for w in widths {
        s.push_str(&"-".repeat(w + 2));
        s.push('+');
    }
    s
}

fn build_row(cells: &[&str], widths: &[usize]) -> String {
    let mut s = String::from("|");
    for (cell, w) in cells.iter().zip(widths) {
        s.push(' ');
        s.push_str(cell);
        s.push_str(&" ".repeat(w.saturating_sub(cell.chars().count()) + 1));
        s.push('|');
    }
    s
}

/// Two-column ASCII table.
pub fn render_pairs(rows: &[(&str, String)]) -> String {
    let kw = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    let vw = rows.iter().map(|(_, v)| v.chars().count()).max().unwrap_or(0);
    let widths = [kw, vw];
    let sep = build_separator(&widths);
    let mut out = sep.clone();
    out.push('\n');
    for (k, v) in rows {
        out.push_str(&build_row(&[*k, v.as_str()], &widths));
        out.push('\n');
    }
    out.push_str(&sep);
    out
}

fn remaining(valid_until: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (valid_until - now).num_seconds().max(0);
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub fn render_status(view: &SigninView, now: DateTime<Utc>) -> String {
    let mut rows = vec![
        ("principal", view.principal.clone()),
        ("role", view.role.clone()),
        ("phase", format!("{:?}", view.phase).to_lowercase()),
        ("provisioned", view.status.provisioned.to_string()),
        ("signed in", view.status.signed_in_at.to_rfc3339()),
        ("valid until", view.valid_until.to_rfc3339()),
        ("validity", view.status.validity_period.clone()),
        ("remaining", remaining(view.valid_until, now)),
    ];
    if let Some(c) = view.status.condition(CONDITION_READY) {
        let mut ready = format!("{} ({})", c.status, c.reason);
        if !c.message.is_empty() {
            ready.push_str(": ");
            ready.push_str(&c.message);
        }
        rows.push(("ready", ready));
    }
    render_pairs(&rows)
}

pub fn render_profile(profile: &ConnectionProfile) -> String {
    let k = &profile.kubeconfig;
    render_pairs(&[
        ("context", k.current_context.clone()),
        ("server", k.server().unwrap_or("").to_string()),
        ("token expires", profile.token_expires_at.to_rfc3339()),
    ])
}

/// Shell line that points kubectl at the written file.
pub fn export_line(path: &Path) -> String { format!("export KUBECONFIG={}", path.display()) }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signin::{SigninPhase, SigninStatus};
    use chrono::TimeZone;

    #[test]
    fn status_table_lists_fields() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let until = now + chrono::Duration::minutes(5);
        let mut status = SigninStatus::new(now, until);
        status.set_condition(CONDITION_READY, false, "ProvisioningFailed", "5 failed attempts".into(), now);
        let view = SigninView {
            principal: "alice".into(),
            role: "viewer".into(),
            valid_until: until,
            phase: SigninPhase::Pending,
            status,
        };
        let out = render_status(&view, now);
        assert!(out.starts_with('+'));
        assert!(out.contains("| principal "));
        assert!(out.contains("pending"));
        assert!(out.contains("0h05m00s"));
        assert!(out.contains("false (ProvisioningFailed): 5 failed attempts"));
        let widths: Vec<usize> = out.lines().map(|l| l.chars().count()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn export_points_at_path() {
        assert_eq!(export_line(Path::new("/tmp/kubeconfig-x.yaml")), "export KUBECONFIG=/tmp/kubeconfig-x.yaml");
    }
}
