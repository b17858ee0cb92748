//! Certificate management and TLS termination.
//!
//! - [`store`]: persistent certificate records
//! - [`authority`]: certificate issuance (ACME HTTP-01)
//! - [`challenge`]: HTTP-01 token registry served by the plaintext listener
//! - [`manager`]: on-demand, single-flight certificate supply and renewal
//! - [`acceptor`]: per-handshake certificate selection for the HTTPS listener

pub mod acceptor;
pub mod authority;
pub mod challenge;
pub mod manager;
pub mod store;

pub use acceptor::CertAcceptor;
pub use authority::{AcmeAuthority, Authority, IssuanceError};
pub use challenge::ChallengeStore;
pub use manager::{CertError, CertManager, ChallengeResponse, DomainPolicy, LoadedCert};
pub use store::{CertStore, CertificateRecord, DirStore, StoreError};
