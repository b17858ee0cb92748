//! Shared fixtures for integration tests.
//!
//! Provides a fake certificate authority backed by an in-process CA, an in-memory
//! certificate store, a small axum backend and a running gateway on ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use tlsgate::config::{BackendTarget, ProxySettings};
use tlsgate::http::{Gateway, Lifecycle, Listeners, Phase, ProxyState, ServerError};
use tlsgate::tls::{
    Authority, CertManager, CertStore, CertificateRecord, ChallengeStore, DomainPolicy,
    IssuanceError, StoreError,
};

pub const DOMAIN: &str = "example.test";

/// Size of the body served by `/large`
pub const LARGE_BODY_LEN: usize = 8 * 1024 * 1024;

/// Certificate authority that signs leaf certificates with a local CA.
pub struct FakeAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "tlsgate test CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            ca_cert,
            ca_key,
            calls: AtomicUsize::new(0),
            delay,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// PEM of the CA, for clients to trust
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Leaf certificate for `domain` expiring at `not_after`.
    pub fn sign(&self, domain: &str, not_after: DateTime<Utc>) -> CertificateRecord {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, domain);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after =
            time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        let leaf = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        CertificateRecord {
            domain: domain.to_string(),
            cert_chain_pem: leaf.pem(),
            private_key_pem: key.serialize_pem(),
            not_after: DateTime::from_timestamp(not_after.timestamp(), 0).unwrap(),
        }
    }
}

#[async_trait]
impl Authority for FakeAuthority {
    async fn obtain(
        &self,
        domain: &str,
        _challenges: &ChallengeStore,
    ) -> Result<CertificateRecord, IssuanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(IssuanceError("challenge failed".to_string()));
        }
        Ok(self.sign(domain, Utc::now() + chrono::Duration::days(90)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, CertificateRecord>>,
}

#[async_trait]
impl CertStore for MemoryStore {
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.records.lock().await.get(domain).cloned())
    }

    async fn save(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.domain.clone(), record.clone());
        Ok(())
    }
}

/// Start the test backend on an ephemeral port.
pub async fn spawn_backend() -> SocketAddr {
    let app = Router::new()
        .route("/ping", get(|| async { "hello" }))
        .route("/teapot", get(teapot))
        .route("/moved", get(moved))
        .route("/echo", post(|body: Body| async move { Response::new(body) }))
        .route("/large", get(large))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "done"
            }),
        )
        .route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "too late"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn teapot() -> Response {
    let mut response = (
        StatusCode::IM_A_TEAPOT,
        [(header::CONTENT_TYPE, "text/plain"), (header::CACHE_CONTROL, "no-store")],
        "short and stout",
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert("x-backend", "backend-1".parse().unwrap());
    headers.append(header::SET_COOKIE, "a=1".parse().unwrap());
    headers.append(header::SET_COOKIE, "b=2".parse().unwrap());
    response
}

async fn moved() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/ping")]).into_response()
}

async fn large() -> Response {
    let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
    let chunks = LARGE_BODY_LEN / chunk.len();
    let stream = futures::stream::iter(
        (0..chunks).map(move |_| Ok::<_, std::convert::Infallible>(chunk.clone())),
    );
    Body::from_stream(stream).into_response()
}

/// An address nothing listens on
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn proxy_state(backend: SocketAddr) -> ProxyState {
    ProxyState::new(
        BackendTarget::new(backend.ip().to_string(), backend.port()),
        &ProxySettings {
            connect_timeout_seconds: 2,
            response_timeout_seconds: 5,
            ..ProxySettings::default()
        },
    )
    .unwrap()
}

pub fn cert_manager(authority: Arc<FakeAuthority>, store: Arc<dyn CertStore>) -> CertManager {
    CertManager::new(
        DomainPolicy::new(DOMAIN),
        authority,
        store,
        chrono::Duration::days(30),
    )
}

/// A gateway running on ephemeral loopback ports.
pub struct TestGateway {
    pub redirect_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub lifecycle: Lifecycle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestGateway {
    pub async fn start(certs: CertManager, backend: SocketAddr, grace: Duration) -> Self {
        let listeners = Listeners::bind("127.0.0.1", 0, 0).unwrap();
        let redirect_addr = listeners.redirect_addr().unwrap();
        let tls_addr = listeners.tls_addr().unwrap();

        let gateway = Gateway::new(certs, proxy_state(backend))
            .shutdown_grace(grace)
            .handshake_timeout(Duration::from_secs(5));
        let lifecycle = gateway.lifecycle();

        let (tx, rx) = oneshot::channel::<()>();
        let mut phases = lifecycle.subscribe();
        let task = tokio::spawn(gateway.run(listeners, async move {
            let _ = rx.await;
        }));
        phases
            .wait_for(|phase| *phase != Phase::Starting)
            .await
            .unwrap();

        Self {
            redirect_addr,
            tls_addr,
            lifecycle,
            shutdown: Some(tx),
            task,
        }
    }

    /// Trigger the shutdown future without waiting for the drain.
    pub fn trigger_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Trigger shutdown and wait for the coordinator to finish.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        self.trigger_shutdown();
        self.finish().await
    }

    pub async fn finish(self) -> Result<(), ServerError> {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("coordinator did not return")
            .unwrap()
    }

    pub fn https_url(&self, path: &str) -> String {
        format!("https://{DOMAIN}:{}{path}", self.tls_addr.port())
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{DOMAIN}:{}{path}", self.redirect_addr.port())
    }
}

/// HTTPS client trusting the fake CA with `name` resolved to the gateway.
pub fn https_client(authority: &FakeAuthority, name: &str, addr: SocketAddr) -> reqwest::Client {
    let root = reqwest::Certificate::from_pem(authority.ca_pem().as_bytes()).unwrap();
    reqwest::Client::builder()
        .add_root_certificate(root)
        .resolve(name, addr)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Plain HTTP client with `DOMAIN` resolved to the redirect listener.
pub fn http_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(DOMAIN, addr)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
