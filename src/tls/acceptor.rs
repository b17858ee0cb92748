//! TLS accept path for the HTTPS listener.
//!
//! Reads the ClientHello, asks the [`CertManager`] for the certificate matching the
//! requested server name and finishes the handshake with it. Connections for names
//! outside the domain policy are dropped before any certificate work happens.

use std::io;
use std::time::Duration;

use axum_server::accept::Accept;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use super::manager::CertManager;

/// axum-server acceptor that resolves certificates per handshake.
#[derive(Clone)]
pub struct CertAcceptor {
    certs: CertManager,
    handshake_timeout: Duration,
}

impl CertAcceptor {
    pub fn new(certs: CertManager, handshake_timeout: Duration) -> Self {
        Self {
            certs,
            handshake_timeout,
        }
    }

    /// Run the server side of a TLS handshake on `stream`.
    ///
    /// The timeout covers reading the ClientHello and completing the handshake;
    /// waiting for a certificate to be issued is not bounded by it.
    pub async fn handshake<I>(&self, stream: I) -> io::Result<TlsStream<I>>
    where
        I: AsyncRead + AsyncWrite + Unpin,
    {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream),
        )
        .await
        .map_err(|_| timed_out("waiting for ClientHello"))??;

        let server_name = start.client_hello().server_name().map(str::to_string);
        tracing::debug!(server_name = ?server_name, "Received ClientHello");

        let cert = self
            .certs
            .get_certificate(server_name.as_deref())
            .await
            .map_err(io::Error::other)?;

        let tls = tokio::time::timeout(
            self.handshake_timeout,
            start.into_stream(cert.server_config()),
        )
        .await
        .map_err(|_| timed_out("completing handshake"))??;

        Ok(tls)
    }
}

fn timed_out(stage: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("TLS handshake timed out {stage}"))
}

impl<I, S> Accept<I, S> for CertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = S;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.clone();
        Box::pin(async move {
            match acceptor.handshake(stream).await {
                Ok(tls) => Ok((tls, service)),
                Err(e) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    Err(e)
                }
            }
        })
    }
}
