//! tlsgate - single-domain TLS terminating reverse proxy
//!
//! Terminates HTTPS for one domain with a certificate obtained and renewed over
//! ACME, redirects plaintext HTTP to HTTPS and forwards requests to a private
//! plain-HTTP backend.

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod tls;

pub use error::ProxyError;
