//! Client side of the signin flow: submit, poll until provisioned, fetch the
//! profile and hand it to kubectl.

pub mod client;
pub mod output;
pub mod poll;

use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tracing::{debug, info};

pub use client::{ApiClient, DEFAULT_SERVER};
pub use poll::{poll_until, PollOptions, PollState};

use crate::error::{AppError, AppResult};
use crate::provisioner::ConnectionProfile;
use crate::signin::CONDITION_READY;

/// Wait for the signin to be provisioned, then fetch its profile.
/// Both polls draw on the one `opts.deadline`.
pub async fn wait_for_profile(client: &ApiClient, opts: &PollOptions) -> AppResult<ConnectionProfile> {
    let started = Instant::now();
    let view = poll_until(opts, "signin", move || async move {
        let view = client.status().await?;
        if view.status.provisioned {
            return Ok(PollState::Ready(view));
        }
        let reason = match view.status.condition(CONDITION_READY) {
            Some(c) if !c.message.is_empty() => format!("{}: {}", c.reason, c.message),
            _ => "waiting for provisioning".to_string(),
        };
        Ok(PollState::Pending(reason))
    })
    .await?;
    debug!(principal = %view.principal, "signin provisioned");
    poll_until(&opts.remaining_since(started), "kubeconfig", move || client.kubeconfig()).await
}

/// Submit a signin and, unless the server already answered with a provisioned record,
/// wait for it. Abandoning the wait leaves the record in place.
pub async fn signin_and_fetch(client: &ApiClient, role: Option<&str>, opts: &PollOptions) -> AppResult<ConnectionProfile> {
    let (view, created) = client.signin(role).await?;
    info!(principal = %view.principal, role = %view.role, created, valid_until = %view.valid_until, "signin submitted");
    if view.status.provisioned {
        return poll_until(opts, "kubeconfig", move || client.kubeconfig()).await;
    }
    wait_for_profile(client, opts).await
}

/// Write the profile's kubeconfig to a fresh temporary file.
pub fn write_kubeconfig(profile: &ConnectionProfile, dir: Option<&Path>) -> AppResult<PathBuf> {
    profile
        .kubeconfig
        .write_temp(dir)
        .map_err(|e| AppError::internal("kubeconfig_write", "could not write kubeconfig file").with_cause(e))
}
