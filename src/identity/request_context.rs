use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Set by `tailscale serve` when the request arrived through a public funnel.
pub const HEADER_FUNNEL_REQUEST: &str = "tailscale-funnel-request";
pub const HEADER_USER_LOGIN: &str = "tailscale-user-login";
pub const HEADER_USER_NAME: &str = "tailscale-user-name";
pub const HEADER_APP_CAPABILITIES: &str = "tailscale-app-capabilities";

/// Everything the identity gate looks at: the TCP peer and the request headers.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    pub remote_addr: Option<SocketAddr>,
    pub headers: HeaderMap,
}

impl GateRequest {
    pub fn new(remote_addr: Option<SocketAddr>, headers: HeaderMap) -> Self { Self { remote_addr, headers } }

    /// Header value as text. Non-UTF-8 values are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> { self.headers.get(name).and_then(|v| v.to_str().ok()) }
}
