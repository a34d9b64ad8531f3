//! Tailnet identity for inbound requests.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod request_context;
mod gate;

pub use principal::{CapabilityRule, Grant, Principal};
pub use request_context::{
    GateRequest, HEADER_APP_CAPABILITIES, HEADER_FUNNEL_REQUEST, HEADER_USER_LOGIN, HEADER_USER_NAME,
};
pub use gate::{Authenticated, GateConfig, IdentityGate};
