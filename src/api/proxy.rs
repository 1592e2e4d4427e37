//! Reverse proxy for per-session web terminals.
//!
//! Routes `/t/<sid>/<rest…>` — plain HTTP and WebSocket upgrades — to the
//! session's gateway on `127.0.0.1:<port>`. The proxy rewrites the path
//! prefix and the Host header and never inspects payloads.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use super::http_server::AppState;

/// Pooled client used for non-upgrade requests
pub type ProxyClient = Client<HttpConnector, Body>;

/// Build the shared proxy client
#[must_use]
pub fn proxy_client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Headers that terminate at each hop and must not be forwarded verbatim
fn hop_by_hop() -> [HeaderName; 8] {
    [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
}

/// Handler for `/t/{sid}` (no trailing path)
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    request: Request,
) -> Response {
    proxy(state, sid, String::new(), request).await
}

/// Handler for `/t/{sid}/{*rest}`
pub async fn proxy_rest(
    State(state): State<AppState>,
    Path((sid, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy(state, sid, rest, request).await
}

/// Route one request to the session's gateway.
async fn proxy(state: AppState, sid: String, rest: String, request: Request) -> Response {
    let Some(port) = gateway_port(&state, &sid).await else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };

    // Strip the /t/<sid> prefix; an empty remainder rewrites to "/"
    let path = format!("/{rest}");
    let path_and_query = match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    if is_upgrade(request.headers()) {
        proxy_upgrade(&sid, port, &path_and_query, request).await
    } else {
        proxy_plain(&state, port, &path_and_query, request).await
    }
}

async fn gateway_port(state: &AppState, sid: &str) -> Option<u16> {
    let session = state.orchestrator.get(sid).await.ok().flatten()?;
    session.gateway_port
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some()
}

/// Forward a regular request through the pooled client.
async fn proxy_plain(state: &AppState, port: u16, path_and_query: &str, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    let uri = format!("http://127.0.0.1:{port}{path_and_query}");
    parts.uri = match uri.parse() {
        Ok(uri) => uri,
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad path").into_response(),
    };

    for name in &hop_by_hop() {
        parts.headers.remove(name);
    }
    set_host(&mut parts.headers, port);

    match state.proxy_client.request(Request::from_parts(parts, body)).await {
        Ok(response) => response.map(Body::new).into_response(),
        Err(e) => {
            tracing::warn!(port, error = %e, "Gateway unreachable");
            (StatusCode::BAD_GATEWAY, "Gateway unreachable").into_response()
        }
    }
}

/// Forward a WebSocket (or other upgrade) handshake, then splice bytes.
///
/// The handshake travels on a dedicated upstream connection; once both
/// sides have switched protocols the two streams are copied until either
/// closes.
async fn proxy_upgrade(sid: &str, port: u16, path_and_query: &str, mut request: Request) -> Response {
    // Grab the downstream upgrade handle before consuming the request
    let downstream = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();
    let Some(downstream) = downstream else {
        return (StatusCode::BAD_REQUEST, "Upgrade not available").into_response();
    };

    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(sid, port, error = %e, "Gateway connect failed during handshake");
            return (StatusCode::BAD_GATEWAY, "Gateway unreachable").into_response();
        }
    };

    let (mut sender, connection) =
        match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(sid, port, error = %e, "HTTP handshake with gateway failed");
                return (StatusCode::BAD_GATEWAY, "Gateway unreachable").into_response();
            }
        };
    // The connection task must keep running to drive the upgrade
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!(error = %e, "Proxy upstream connection ended");
        }
    });

    // Rebuild the handshake request for the upstream, keeping the
    // Connection/Upgrade and Sec-WebSocket-* headers intact
    let (parts, _) = request.into_parts();
    let built = Request::builder()
        .method(parts.method)
        .uri(path_and_query)
        .body(Body::empty());
    let Ok(mut upstream_request) = built else {
        return (StatusCode::BAD_REQUEST, "Bad upgrade request").into_response();
    };
    *upstream_request.headers_mut() = parts.headers;
    set_host(upstream_request.headers_mut(), port);

    let mut upstream_response = match sender.send_request(upstream_request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(sid, port, error = %e, "Gateway rejected upgrade handshake");
            return (StatusCode::BAD_GATEWAY, "Gateway unreachable").into_response();
        }
    };

    if upstream_response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upstream = hyper::upgrade::on(&mut upstream_response);
        let sid = sid.to_string();
        tokio::spawn(async move {
            let (upstream, downstream) = match tokio::join!(upstream, downstream) {
                (Ok(up), Ok(down)) => (up, down),
                (up, down) => {
                    tracing::debug!(
                        sid,
                        upstream_ok = up.is_ok(),
                        downstream_ok = down.is_ok(),
                        "Upgrade completion failed"
                    );
                    return;
                }
            };
            let mut upstream = TokioIo::new(upstream);
            let mut downstream = TokioIo::new(downstream);
            // Splice bytes both ways until either side closes
            match tokio::io::copy_bidirectional(&mut upstream, &mut downstream).await {
                Ok((to_client, to_gateway)) => {
                    tracing::debug!(sid, to_client, to_gateway, "WebSocket proxy closed");
                }
                Err(e) => {
                    tracing::debug!(sid, error = %e, "WebSocket proxy ended with error");
                }
            }
        });
    }

    // Relay the upstream's handshake response (101 or a refusal) verbatim
    upstream_response.map(Body::new).into_response()
}

fn set_host(headers: &mut HeaderMap, port: u16) {
    if let Ok(value) = format!("127.0.0.1:{port}").parse() {
        headers.insert(header::HOST, value);
    }
}
