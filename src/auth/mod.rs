//! Auth gate: a single predicate applied to HTTP requests and socket
//! handshakes.
//!
//! Local requests are always allowed; remote requests must present the
//! process-wide token generated at startup. Static assets bypass the gate
//! so the SPA shell can load before the client knows the token.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::utils::generate_auth_token;

/// File extensions served without authentication
const STATIC_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".css", ".html", ".ico", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp",
    ".woff", ".woff2", ".ttf", ".eot", ".map", ".txt",
];

/// The process-wide authentication gate.
#[derive(Debug)]
pub struct AuthGate {
    enabled: bool,
    token: String,
}

impl AuthGate {
    /// Create the gate; the token is generated once per process.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            token: generate_auth_token(),
        }
    }

    /// The token remote clients must present
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the gate is enforcing at all
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The predicate: is this request allowed?
    #[must_use]
    pub fn allows(&self, path: &str, headers: &HeaderMap, presented_token: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        if is_static_asset(path) {
            return true;
        }
        if is_local_request(headers) {
            return true;
        }
        presented_token == Some(self.token.as_str())
    }
}

/// Does the path name a static asset?
fn is_static_asset(path: &str) -> bool {
    let lower = path.to_lowercase();
    STATIC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// A request is local iff no `X-Forwarded-Host` is present, and either the
/// first `X-Forwarded-For` hop is a loopback or private address, or (with
/// no forwarding headers at all) the `Host` hostname is a loopback name.
fn is_local_request(headers: &HeaderMap) -> bool {
    if headers.contains_key("x-forwarded-host") {
        return false;
    }

    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first_hop = forwarded_for.split(',').next().unwrap_or("").trim();
        return IpAddr::from_str(first_hop).is_ok_and(|ip| is_loopback_or_private(ip));
    }

    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let hostname = strip_port(host);
    matches!(hostname, "localhost" | "127.0.0.1" | "::1")
}

fn is_loopback_or_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Strip a port suffix from a Host header value, handling `[::1]:port`.
fn strip_port(host: &str) -> &str {
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    host.split(':').next().unwrap_or(host)
}

/// Extract a presented token from the query string or `X-Auth-Token`.
#[must_use]
pub fn presented_token<'a>(query: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                return Some(value);
            }
        }
    }
    headers.get("x-auth-token").and_then(|v| v.to_str().ok())
}

/// Axum middleware applying the gate to every non-static HTTP request.
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let token = presented_token(request.uri().query(), request.headers()).map(ToString::to_string);

    if gate.allows(&path, request.headers(), token.as_deref()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}
