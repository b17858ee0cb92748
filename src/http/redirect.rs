//! Plaintext listener: HTTP to HTTPS redirect.
//!
//! Every request is answered with a permanent redirect to the same host, path and
//! query over HTTPS, except HTTP-01 challenge requests, which are answered from the
//! certificate manager's challenge registry.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::Router;

use crate::config::ACME_CHALLENGE_ROUTE;
use crate::middleware::request_id_layer;
use crate::tls::{CertManager, ChallengeResponse};

/// Listener name used in request spans
pub const LISTENER: &str = "redirect";

#[derive(Clone)]
pub struct RedirectState {
    certs: CertManager,
    /// Port clients reach the HTTPS listener on
    https_port: u16,
}

impl RedirectState {
    pub fn new(certs: CertManager, https_port: u16) -> Self {
        Self { certs, https_port }
    }
}

/// Authority the client addressed: the `Host` header, else the request target.
///
/// Forwarding headers are ignored; nothing trusted sits in front of this
/// listener. Rejects with 400 when neither source names a host.
pub struct RequestHost(pub String);

impl<S> FromRequestParts<S> for RequestHost
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .filter(|host| !host.is_empty());
        if let Some(host) = from_header {
            return Ok(Self(host.to_string()));
        }
        match parts.uri.authority() {
            Some(authority) => Ok(Self(authority.as_str().to_string())),
            None => Err(StatusCode::BAD_REQUEST),
        }
    }
}

/// Build the router served on the plaintext listener.
pub fn router(state: RedirectState) -> Router {
    Router::new()
        .route(ACME_CHALLENGE_ROUTE, any(challenge))
        .fallback(redirect)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(LISTENER, request_id_layer))
}

async fn challenge(
    State(state): State<RedirectState>,
    RequestHost(host): RequestHost,
    Path(token): Path<String>,
) -> Response {
    match state
        .certs
        .challenge_response(Some(strip_port(&host)), &token)
        .await
    {
        ChallengeResponse::Found(key_authorization) => {
            tracing::info!(%token, "Answered HTTP-01 challenge");
            (
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response()
        }
        ChallengeResponse::Forbidden => StatusCode::FORBIDDEN.into_response(),
        ChallengeResponse::NotFound => {
            tracing::debug!(%token, "Unknown challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn redirect(
    State(state): State<RedirectState>,
    RequestHost(host): RequestHost,
    uri: Uri,
) -> Redirect {
    redirect_to_https(&host, &uri, state.https_port)
}

/// Permanent redirect to `https://<host><path and query>`.
fn redirect_to_https(host: &str, uri: &Uri, https_port: u16) -> Redirect {
    let host = strip_port(host);
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let https_url = if https_port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    };

    tracing::debug!(from = %uri, to = %https_url, "Redirecting HTTP to HTTPS");
    Redirect::permanent(&https_url)
}

/// Host without its port; bracketed IPv6 literals keep their brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
