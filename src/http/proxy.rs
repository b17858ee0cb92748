//! TLS listener: reverse proxy to the backend.
//!
//! Requests are forwarded over plain HTTP through one pooled client shared by all
//! requests. Bodies are streamed in both directions. Any failure to get a response
//! head from the backend becomes a 502 with a generic body.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;
use axum::Router;

use crate::config::{BackendTarget, ProxySettings};
use crate::error::ProxyError;
use crate::middleware::request_id_layer;

/// Listener name used in request spans
pub const LISTENER: &str = "tls";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "trailers",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
];

/// Shared state for the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    backend: BackendTarget,
    response_timeout: Duration,
}

impl ProxyState {
    pub fn new(backend: BackendTarget, settings: &ProxySettings) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_client(settings)?,
            backend,
            response_timeout: Duration::from_secs(settings.response_timeout_seconds),
        })
    }

    pub fn backend(&self) -> &BackendTarget {
        &self.backend
    }
}

/// Pooled backend client. Redirects are relayed to the client rather than followed
/// and environment proxy settings are ignored.
pub fn build_client(settings: &ProxySettings) -> Result<reqwest::Client, ProxyError> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_seconds))
        .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_seconds))
        .build()?;
    Ok(client)
}

/// Build the router served on the TLS listener.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(LISTENER, request_id_layer))
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.backend.base_url(), path_and_query);
    let url = reqwest::Url::parse(&url).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let outbound = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send();

    let backend_response = match tokio::time::timeout(state.response_timeout, outbound).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!(backend = %state.backend, method = %parts.method, error = %e, "Backend request failed");
            return Err(e.into());
        }
        Err(_) => {
            tracing::warn!(backend = %state.backend, method = %parts.method, "Backend response timed out");
            return Err(ProxyError::Timeout(state.response_timeout));
        }
    };

    let status = backend_response.status();
    let mut response_headers = backend_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    tracing::debug!(backend = %state.backend, status = status.as_u16(), "Relaying backend response");

    let mut response = Response::new(Body::from_stream(backend_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
