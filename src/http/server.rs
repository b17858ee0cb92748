//! Listener lifecycle.
//!
//! Binds both listeners, serves them concurrently and runs the shutdown protocol:
//! the first of {redirect listener exit, TLS listener exit, shutdown signal} starts
//! a drain of both listeners under one shared deadline.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{
    AppConfig, ValidatedConfig, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_RENEWAL_CHECK_HOURS,
    DEFAULT_SHUTDOWN_GRACE_SECS,
};
use crate::error::ProxyError;
use crate::tls::{AcmeAuthority, CertAcceptor, CertManager, DirStore, DomainPolicy};

use super::proxy::{self, ProxyState};
use super::redirect::{self, RedirectState};
use super::shutdown;

/// Server startup and shutdown errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("The {listener} listener stopped: {reason}")]
    Listener {
        listener: &'static str,
        reason: String,
    },

    #[error("Listeners did not finish draining within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Failed to set up the backend client: {0}")]
    Proxy(#[from] ProxyError),
}

/// Coordinator phase, observable through [`Lifecycle::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Current phase of the coordinator.
#[derive(Clone)]
pub struct Lifecycle {
    phase: Arc<watch::Sender<Phase>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: Arc::new(watch::Sender::new(Phase::Starting)),
        }
    }
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        tracing::info!(?phase, "Lifecycle phase changed");
        self.phase.send_replace(phase);
    }
}

/// Both listening sockets, bound before anything is served.
pub struct Listeners {
    redirect: std::net::TcpListener,
    tls: std::net::TcpListener,
}

impl Listeners {
    /// Bind the plaintext and TLS listeners on `host`.
    pub fn bind(host: &str, redirect_port: u16, https_port: u16) -> Result<Self, ServerError> {
        Ok(Self {
            redirect: bind_one(redirect::LISTENER, host, redirect_port)?,
            tls: bind_one(proxy::LISTENER, host, https_port)?,
        })
    }

    pub fn redirect_addr(&self) -> io::Result<SocketAddr> {
        self.redirect.local_addr()
    }

    pub fn tls_addr(&self) -> io::Result<SocketAddr> {
        self.tls.local_addr()
    }
}

fn bind_one(
    listener: &'static str,
    host: &str,
    port: u16,
) -> Result<std::net::TcpListener, ServerError> {
    let bind_error = |source| ServerError::Bind {
        listener,
        addr: format!("{host}:{port}"),
        source,
    };
    let socket = std::net::TcpListener::bind((host, port)).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket)
}

/// What ended the serving phase
enum Trigger {
    Signal,
    ListenerExited {
        listener: &'static str,
        reason: String,
    },
}

/// The two listeners plus everything they share.
pub struct Gateway {
    certs: CertManager,
    proxy: ProxyState,
    shutdown_grace: Duration,
    handshake_timeout: Duration,
    renewal_interval: Duration,
    lifecycle: Lifecycle,
}

impl Gateway {
    pub fn new(certs: CertManager, proxy: ProxyState) -> Self {
        Self {
            certs,
            proxy,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            renewal_interval: Duration::from_secs(DEFAULT_RENEWAL_CHECK_HOURS * 3600),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Shared deadline for draining both listeners.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Serve until `shutdown` resolves or a listener stops, then drain both listeners.
    ///
    /// Returns `Ok` after a signal-triggered drain that finished within the grace
    /// period. A listener that stops on its own is reported as an error after the
    /// other one has drained.
    pub async fn run<F>(self, listeners: Listeners, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let redirect_addr = listeners.redirect_addr().map_err(|e| ServerError::Listener {
            listener: redirect::LISTENER,
            reason: e.to_string(),
        })?;
        let tls_addr = listeners.tls_addr().map_err(|e| ServerError::Listener {
            listener: proxy::LISTENER,
            reason: e.to_string(),
        })?;

        let redirect_app = redirect::router(RedirectState::new(self.certs.clone(), tls_addr.port()));
        let tls_app = proxy::router(self.proxy.clone());
        let acceptor = CertAcceptor::new(self.certs.clone(), self.handshake_timeout);

        let redirect_handle = Handle::new();
        let tls_handle = Handle::new();

        let redirect = RunningListener {
            listener: redirect::LISTENER,
            handle: redirect_handle.clone(),
            task: tokio::spawn(
                axum_server::from_tcp(listeners.redirect)
                    .handle(redirect_handle)
                    .serve(redirect_app.into_make_service()),
            ),
        };
        let tls = RunningListener {
            listener: proxy::LISTENER,
            handle: tls_handle.clone(),
            task: tokio::spawn(
                axum_server::from_tcp(listeners.tls)
                    .handle(tls_handle)
                    .acceptor(acceptor)
                    .serve(tls_app.into_make_service()),
            ),
        };

        tracing::info!(
            redirect = %redirect_addr,
            tls = %tls_addr,
            domain = %self.certs.policy().domain(),
            backend = %self.proxy.backend(),
            "Listeners started"
        );
        self.lifecycle.enter(Phase::Serving);

        let renewal = self.certs.spawn_renewal(self.renewal_interval);
        let result = coordinate(&self.lifecycle, self.shutdown_grace, [redirect, tls], shutdown).await;
        renewal.abort();
        result
    }
}

/// A running listener and the handle that stops it.
struct RunningListener {
    listener: &'static str,
    handle: Handle,
    task: JoinHandle<io::Result<()>>,
}

/// Wait for the first of {either listener exiting, `shutdown`}, then drain every
/// listener still running under one deadline.
async fn coordinate<F>(
    lifecycle: &Lifecycle,
    grace: Duration,
    listeners: [RunningListener; 2],
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    let [mut first, mut second] = listeners;

    let shutdown = std::pin::pin!(shutdown);
    let trigger = tokio::select! {
        result = &mut first.task => listener_exit(first.listener, result),
        result = &mut second.task => listener_exit(second.listener, result),
        _ = shutdown => {
            tracing::info!("Shutdown requested");
            Trigger::Signal
        }
    };

    lifecycle.enter(Phase::Draining);

    first.handle.graceful_shutdown(None);
    second.handle.graceful_shutdown(None);
    tracing::info!(?grace, "Draining listeners");

    // A listener that already exited has nothing left to drain
    let finished = match &trigger {
        Trigger::ListenerExited { listener, .. } => Some(*listener),
        Trigger::Signal => None,
    };
    let mut remaining: Vec<RunningListener> = [first, second]
        .into_iter()
        .filter(|serving| Some(serving.listener) != finished)
        .collect();

    let drain = futures::future::join_all(remaining.iter_mut().map(|serving| &mut serving.task));
    match tokio::time::timeout(grace, drain).await {
        Ok(results) => {
            for (serving, result) in remaining.iter().zip(results) {
                let listener = serving.listener;
                match result {
                    Ok(Ok(())) => tracing::info!(%listener, "Listener stopped"),
                    Ok(Err(e)) => {
                        tracing::warn!(%listener, error = %e, "Listener failed while draining")
                    }
                    Err(e) => tracing::warn!(%listener, error = %e, "Listener task failed"),
                }
            }
        }
        Err(_) => {
            tracing::error!(?grace, "Drain deadline exceeded, closing remaining connections");
            for serving in &remaining {
                serving.handle.shutdown();
                serving.task.abort();
            }
            lifecycle.enter(Phase::Stopped);
            return Err(ServerError::ShutdownTimeout(grace));
        }
    }

    lifecycle.enter(Phase::Stopped);
    match trigger {
        Trigger::Signal => Ok(()),
        Trigger::ListenerExited { listener, reason } => {
            Err(ServerError::Listener { listener, reason })
        }
    }
}

fn listener_exit(
    listener: &'static str,
    result: Result<io::Result<()>, tokio::task::JoinError>,
) -> Trigger {
    let reason = match result {
        Ok(Ok(())) => "stopped unexpectedly".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("task failed: {e}"),
    };
    tracing::error!(%listener, %reason, "Listener exited");
    Trigger::ListenerExited { listener, reason }
}

/// Build every component from configuration, bind both listeners and serve until
/// a termination signal arrives.
pub async fn start_server(config: &AppConfig, validated: ValidatedConfig) -> Result<(), ServerError> {
    let ValidatedConfig { domain, backend } = validated;

    tracing::info!(
        %domain,
        %backend,
        directory = %config.acme.directory_url,
        cache = %config.acme.cache_dir.display(),
        "Starting tlsgate"
    );

    let certs = CertManager::new(
        DomainPolicy::new(&domain),
        Arc::new(AcmeAuthority::new(&config.acme)),
        Arc::new(DirStore::new(&config.acme.cache_dir)),
        config.acme.renew_before(),
    );
    match certs.reload_from_store().await {
        Ok(Some(not_after)) => tracing::info!(%domain, %not_after, "Using cached certificate"),
        Ok(None) => tracing::info!(%domain, "No cached certificate, one will be issued on first handshake"),
        Err(e) => tracing::warn!(%domain, error = %e, "Cached certificate unusable"),
    }

    let proxy = ProxyState::new(backend, &config.proxy)?;

    // Fatal before anything is served
    let listeners = Listeners::bind(
        &config.http.host,
        config.http.redirect_port,
        config.http.https_port,
    )?;

    shutdown::spawn_reload_handler(certs.clone());

    Gateway::new(certs, proxy)
        .shutdown_grace(config.http.shutdown_grace())
        .handshake_timeout(config.http.handshake_timeout())
        .renewal_interval(config.acme.renewal_check_interval())
        .run(listeners, shutdown::termination_signal())
        .await
}
