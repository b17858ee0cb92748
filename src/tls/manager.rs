//! Certificate manager.
//!
//! Supplies the certificate for the single allowed domain on every TLS handshake.
//! Certificates come from memory, then from the [`CertStore`], and only then from the
//! [`Authority`]. Loading and issuance for a domain are coalesced: concurrent callers
//! subscribe to the one in-flight attempt instead of starting their own, which keeps
//! us clear of certificate authority rate limits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::instrument;

use super::authority::Authority;
use super::challenge::ChallengeStore;
use super::store::{CertStore, CertificateRecord};

/// ALPN protocols offered to clients on the TLS listener
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// How long a failed renewal is not retried while the old certificate is still served
const RENEWAL_RETRY_BACKOFF_SECS: i64 = 300;

/// Errors surfaced to a single handshake (or challenge request).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CertError {
    #[error("server name {requested:?} is not allowed, only {allowed} is served")]
    PolicyViolation {
        requested: Option<String>,
        allowed: String,
    },

    #[error("certificate issuance for {domain} failed: {reason}")]
    Issuance { domain: String, reason: String },

    #[error("unusable certificate material for {domain}: {reason}")]
    InvalidRecord { domain: String, reason: String },
}

/// The one host name certificates may be requested for. Fails closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPolicy {
    domain: String,
}

impl DomainPolicy {
    pub fn new(domain: impl AsRef<str>) -> Self {
        Self {
            domain: normalize(domain.as_ref()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Accept `requested` only if it names the allowed domain.
    pub fn authorize(&self, requested: Option<&str>) -> Result<&str, CertError> {
        match requested {
            Some(name) if normalize(name) == self.domain => Ok(&self.domain),
            _ => Err(CertError::PolicyViolation {
                requested: requested.map(str::to_string),
                allowed: self.domain.clone(),
            }),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// A certificate record together with the TLS configuration built from it.
#[derive(Debug)]
pub struct LoadedCert {
    record: CertificateRecord,
    server_config: Arc<ServerConfig>,
}

impl LoadedCert {
    /// Parse the PEM material and build the server configuration presented to clients.
    pub fn from_record(record: CertificateRecord) -> Result<Self, CertError> {
        let invalid = |reason: String| CertError::InvalidRecord {
            domain: record.domain.clone(),
            reason,
        };

        let chain = CertificateDer::pem_slice_iter(record.cert_chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("certificate chain: {e}")))?;
        if chain.is_empty() {
            return Err(invalid("certificate chain is empty".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(record.private_key_pem.as_bytes())
            .map_err(|e| invalid(format!("private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| invalid(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| invalid(e.to_string()))?;
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(Self {
            record,
            server_config: Arc::new(config),
        })
    }

    pub fn record(&self) -> &CertificateRecord {
        &self.record
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.record.not_after
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

type FlightResult = Result<Arc<LoadedCert>, CertError>;

struct Inner {
    policy: DomainPolicy,
    authority: Arc<dyn Authority>,
    store: Arc<dyn CertStore>,
    challenges: ChallengeStore,
    renew_before: chrono::Duration,
    /// Certificates currently served, by domain
    loaded: RwLock<HashMap<String, Arc<LoadedCert>>>,
    /// In-flight load/issue attempts, by domain
    pending: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    /// Renewal is not retried on handshakes before this instant
    retry_after: RwLock<Option<DateTime<Utc>>>,
}

/// Obtains, caches and renews the certificate for the allowed domain.
///
/// Cheap to clone; all clones share the same cache and in-flight registry.
#[derive(Clone)]
pub struct CertManager {
    inner: Arc<Inner>,
}

/// Outcome of a challenge lookup on the plaintext listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
    /// Key authorization to return to the certificate authority
    Found(String),
    /// Request for a host other than the allowed domain
    Forbidden,
    /// Unknown or expired token
    NotFound,
}

impl CertManager {
    pub fn new(
        policy: DomainPolicy,
        authority: Arc<dyn Authority>,
        store: Arc<dyn CertStore>,
        renew_before: chrono::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                authority,
                store,
                challenges: ChallengeStore::default(),
                renew_before,
                loaded: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                retry_after: RwLock::new(None),
            }),
        }
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.inner.policy
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.inner.challenges
    }

    /// Certificate for `server_name`, loading or issuing it when needed.
    ///
    /// Names other than the allowed domain (or a missing name) are rejected before
    /// any cache or authority is touched.
    #[instrument(
        name = "tls.manager.get_certificate",
        skip(self),
        fields(coalesced = false)
    )]
    pub async fn get_certificate(&self, server_name: Option<&str>) -> FlightResult {
        let domain = match self.inner.policy.authorize(server_name) {
            Ok(domain) => domain.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected certificate request");
                return Err(e);
            }
        };

        if let Some(cert) = self.fresh_loaded(&domain).await {
            return Ok(cert);
        }
        if let Some(cert) = self.backing_off(&domain).await {
            return Ok(cert);
        }

        self.refresh(&domain).await
    }

    /// Certificate currently held in memory, if any, regardless of freshness.
    pub async fn current(&self) -> Option<Arc<LoadedCert>> {
        self.inner
            .loaded
            .read()
            .await
            .get(self.inner.policy.domain())
            .cloned()
    }

    /// Answer an HTTP-01 request arriving on the plaintext listener.
    pub async fn challenge_response(&self, host: Option<&str>, token: &str) -> ChallengeResponse {
        if self.inner.policy.authorize(host).is_err() {
            tracing::warn!(host = ?host, "Challenge request for a host that is not served");
            return ChallengeResponse::Forbidden;
        }
        match self.inner.challenges.key_authorization(token).await {
            Some(key_authorization) => ChallengeResponse::Found(key_authorization),
            None => ChallengeResponse::NotFound,
        }
    }

    /// Renew the cached certificate if it has entered its renewal window.
    ///
    /// Does nothing when no certificate has been obtained yet; first issuance
    /// happens on demand during a handshake.
    pub async fn renew_if_due(&self) -> Option<FlightResult> {
        let domain = self.inner.policy.domain().to_string();

        if self.current().await.is_none() {
            match self.inner.load_from_store(&domain).await {
                Ok(Some(cert)) => self.inner.install(&domain, cert).await,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
        }

        if self.fresh_loaded(&domain).await.is_some() {
            return None;
        }

        tracing::info!(%domain, "Certificate entered its renewal window, renewing");
        Some(self.refresh(&domain).await)
    }

    /// Drop the in-memory certificate and read it back from the store.
    pub async fn reload_from_store(&self) -> Result<Option<DateTime<Utc>>, CertError> {
        let domain = self.inner.policy.domain().to_string();
        match self.inner.load_from_store(&domain).await? {
            Some(cert) => {
                let not_after = cert.not_after();
                self.inner.install(&domain, cert).await;
                Ok(Some(not_after))
            }
            None => {
                self.inner.loaded.write().await.remove(&domain);
                Ok(None)
            }
        }
    }

    /// Spawn the periodic renewal check.
    pub fn spawn_renewal(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match manager.renew_if_due().await {
                    Some(Ok(cert)) => {
                        tracing::debug!(not_after = %cert.not_after(), "Renewal check complete")
                    }
                    Some(Err(e)) => tracing::error!(error = %e, "Certificate renewal failed"),
                    None => {}
                }
            }
        })
    }

    async fn fresh_loaded(&self, domain: &str) -> Option<Arc<LoadedCert>> {
        let loaded = self.inner.loaded.read().await;
        loaded
            .get(domain)
            .filter(|cert| cert.record.is_fresh(Utc::now(), self.inner.renew_before))
            .cloned()
    }

    /// Unexpired certificate to keep serving while a failed renewal cools down.
    async fn backing_off(&self, domain: &str) -> Option<Arc<LoadedCert>> {
        let now = Utc::now();
        let retry_after = (*self.inner.retry_after.read().await)?;
        if retry_after <= now {
            return None;
        }
        let loaded = self.inner.loaded.read().await;
        loaded
            .get(domain)
            .filter(|cert| !cert.record.is_expired(now))
            .cloned()
    }

    /// Join the in-flight attempt for `domain` or start one.
    async fn refresh(&self, domain: &str) -> FlightResult {
        let mut rx = {
            let mut pending = self.inner.pending.lock().await;

            // A flight may have completed between the caller's cache check and here
            if let Some(cert) = self.fresh_loaded(domain).await {
                return Ok(cert);
            }

            match pending.get(domain) {
                Some(tx) => {
                    tracing::Span::current().record("coalesced", true);
                    tracing::debug!(%domain, "Waiting on in-flight certificate request");
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    pending.insert(domain.to_string(), tx);

                    // Detached so a dropped handshake cannot strand the other waiters
                    let inner = self.inner.clone();
                    let domain = domain.to_string();
                    tokio::spawn(async move {
                        let result = inner.load_or_issue(&domain).await;
                        if let Some(tx) = inner.pending.lock().await.remove(&domain) {
                            let _ = tx.send(result);
                        }
                    });
                    rx
                }
            }
        };

        rx.recv().await.unwrap_or_else(|_| {
            Err(CertError::Issuance {
                domain: domain.to_string(),
                reason: "certificate request ended without a result".to_string(),
            })
        })
    }
}

impl Inner {
    async fn install(&self, domain: &str, cert: Arc<LoadedCert>) {
        self.loaded.write().await.insert(domain.to_string(), cert);
    }

    /// Load the stored record; unreadable or unusable records count as absent.
    async fn load_from_store(&self, domain: &str) -> Result<Option<Arc<LoadedCert>>, CertError> {
        let record = match self.store.load(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(%domain, error = %e, "Ignoring cached certificate");
                return Ok(None);
            }
        };

        if record.domain != domain {
            tracing::warn!(%domain, stored = %record.domain, "Cached certificate is for another domain");
            return Ok(None);
        }

        match LoadedCert::from_record(record) {
            Ok(cert) => {
                tracing::info!(%domain, not_after = %cert.not_after(), "Loaded certificate from cache");
                Ok(Some(Arc::new(cert)))
            }
            Err(e) => {
                tracing::warn!(%domain, error = %e, "Ignoring cached certificate");
                Ok(None)
            }
        }
    }

    /// Body of a flight: use memory or the store when fresh, otherwise issue.
    async fn load_or_issue(&self, domain: &str) -> FlightResult {
        let now = Utc::now();

        let mut existing = self.loaded.read().await.get(domain).cloned();
        if existing.is_none() {
            existing = self.load_from_store(domain).await?;
        }

        if let Some(cert) = &existing {
            if cert.record.is_fresh(now, self.renew_before) {
                self.install(domain, cert.clone()).await;
                return Ok(cert.clone());
            }
        }

        match self.issue(domain).await {
            Ok(cert) => {
                *self.retry_after.write().await = None;
                Ok(cert)
            }
            Err(e) => match existing {
                Some(cert) if !cert.record.is_expired(Utc::now()) => {
                    *self.retry_after.write().await =
                        Some(Utc::now() + chrono::Duration::seconds(RENEWAL_RETRY_BACKOFF_SECS));
                    tracing::warn!(
                        %domain,
                        error = %e,
                        not_after = %cert.not_after(),
                        "Renewal failed, serving the current certificate until it expires"
                    );
                    self.install(domain, cert.clone()).await;
                    Ok(cert)
                }
                _ => Err(e),
            },
        }
    }

    async fn issue(&self, domain: &str) -> FlightResult {
        let issuance_error = |reason: String| CertError::Issuance {
            domain: domain.to_string(),
            reason,
        };

        let record = self
            .authority
            .obtain(domain, &self.challenges)
            .await
            .map_err(|e| issuance_error(e.to_string()))?;

        if record.domain != domain {
            return Err(issuance_error(format!(
                "authority returned a certificate for {}",
                record.domain
            )));
        }
        if record.is_expired(Utc::now()) {
            return Err(issuance_error("authority returned an expired certificate".to_string()));
        }

        let cert = Arc::new(LoadedCert::from_record(record)?);

        // Persist before serving so a crash right after issuance keeps the certificate
        if let Err(e) = self.store.save(cert.record()).await {
            tracing::error!(%domain, error = %e, "Failed to persist issued certificate");
        }

        self.install(domain, cert.clone()).await;
        tracing::info!(%domain, not_after = %cert.not_after(), "Certificate installed");
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rcgen::{CertificateParams, KeyPair};

    use super::*;
    use crate::tls::authority::IssuanceError;
    use crate::tls::store::StoreError;

    /// Issues self-signed certificates valid for `validity` and counts calls.
    struct CountingAuthority {
        calls: AtomicUsize,
        delay: Duration,
        validity: chrono::Duration,
        fail: bool,
    }

    impl CountingAuthority {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                validity: chrono::Duration::days(90),
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn self_signed(domain: &str, not_after: DateTime<Utc>) -> CertificateRecord {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.not_after =
            time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        let cert = params.self_signed(&key).unwrap();
        CertificateRecord {
            domain: domain.to_string(),
            cert_chain_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
            not_after: DateTime::from_timestamp(not_after.timestamp(), 0).unwrap(),
        }
    }

    #[async_trait]
    impl Authority for CountingAuthority {
        async fn obtain(
            &self,
            domain: &str,
            _challenges: &ChallengeStore,
        ) -> Result<CertificateRecord, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(IssuanceError("urn:ietf:params:acme:error:rateLimited".to_string()));
            }
            Ok(self_signed(domain, Utc::now() + self.validity))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<String, CertificateRecord>>,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl CertStore for MemoryStore {
        async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
            Ok(self.records.lock().await.get(domain).cloned())
        }

        async fn save(&self, record: &CertificateRecord) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .await
                .insert(record.domain.clone(), record.clone());
            Ok(())
        }
    }

    fn manager(authority: Arc<CountingAuthority>, store: Arc<MemoryStore>) -> CertManager {
        CertManager::new(
            DomainPolicy::new("example.test"),
            authority,
            store,
            chrono::Duration::days(30),
        )
    }

    #[test]
    fn test_policy_is_exact_and_case_insensitive() {
        let policy = DomainPolicy::new("example.test");
        assert_eq!(policy.authorize(Some("example.test")).unwrap(), "example.test");
        assert!(policy.authorize(Some("EXAMPLE.test.")).is_ok());
        assert!(policy.authorize(Some("www.example.test")).is_err());
        assert!(policy.authorize(Some("example.test.evil")).is_err());
        assert!(matches!(
            policy.authorize(None),
            Err(CertError::PolicyViolation { requested: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_name_never_reaches_authority() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let store = Arc::new(MemoryStore::default());
        let certs = manager(authority.clone(), store.clone());

        let err = certs.get_certificate(Some("other.test")).await.unwrap_err();
        assert!(matches!(err, CertError::PolicyViolation { .. }));
        assert!(certs.get_certificate(None).await.is_err());
        assert_eq!(authority.calls(), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_issues_once_then_serves_from_memory() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let store = Arc::new(MemoryStore::default());
        let certs = manager(authority.clone(), store.clone());

        let first = certs.get_certificate(Some("example.test")).await.unwrap();
        let second = certs.get_certificate(Some("example.test")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.not_after() > Utc::now());
        assert_eq!(authority.calls(), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert!(store.records.lock().await.contains_key("example.test"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_issuance() {
        let authority = Arc::new(CountingAuthority::new(Duration::from_millis(200)));
        let store = Arc::new(MemoryStore::default());
        let certs = manager(authority.clone(), store);

        let handshakes: Vec<_> = (0..16)
            .map(|_| {
                let certs = certs.clone();
                tokio::spawn(async move { certs.get_certificate(Some("example.test")).await })
            })
            .collect();

        let results = futures::future::join_all(handshakes).await;
        let certs: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();

        assert_eq!(authority.calls(), 1);
        assert!(certs.iter().all(|c| Arc::ptr_eq(c, &certs[0])));
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_strand_waiters() {
        let authority = Arc::new(CountingAuthority::new(Duration::from_millis(200)));
        let certs = manager(authority.clone(), Arc::new(MemoryStore::default()));

        let first = {
            let certs = certs.clone();
            tokio::spawn(async move { certs.get_certificate(Some("example.test")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let cert = certs.get_certificate(Some("example.test")).await.unwrap();
        assert!(cert.not_after() > Utc::now());
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_stored_certificate_is_reused_across_restarts() {
        let store = Arc::new(MemoryStore::default());
        let record = self_signed("example.test", Utc::now() + chrono::Duration::days(80));
        store.save(&record).await.unwrap();

        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let certs = manager(authority.clone(), store);

        let cert = certs.get_certificate(Some("example.test")).await.unwrap();
        assert_eq!(cert.record(), &record);
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_certificate_in_renewal_window_is_replaced() {
        let store = Arc::new(MemoryStore::default());
        let old = self_signed("example.test", Utc::now() + chrono::Duration::days(5));
        store.save(&old).await.unwrap();

        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let certs = manager(authority.clone(), store.clone());

        let cert = certs.get_certificate(Some("example.test")).await.unwrap();
        assert_eq!(authority.calls(), 1);
        assert!(cert.not_after() > old.not_after);
        assert_eq!(
            store.records.lock().await.get("example.test").map(|r| r.not_after),
            Some(cert.not_after())
        );
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_serving_unexpired_certificate() {
        let store = Arc::new(MemoryStore::default());
        let old = self_signed("example.test", Utc::now() + chrono::Duration::days(5));
        store.save(&old).await.unwrap();

        let mut failing = CountingAuthority::new(Duration::ZERO);
        failing.fail = true;
        let authority = Arc::new(failing);
        let certs = manager(authority.clone(), store);

        let cert = certs.get_certificate(Some("example.test")).await.unwrap();
        assert_eq!(cert.record(), &old);
        assert_eq!(authority.calls(), 1);

        // Handshakes during the backoff do not retry issuance
        let again = certs.get_certificate(Some("example.test")).await.unwrap();
        assert!(Arc::ptr_eq(&cert, &again));
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_issuance_failure_without_certificate_fails_handshake() {
        let mut failing = CountingAuthority::new(Duration::ZERO);
        failing.fail = true;
        let authority = Arc::new(failing);
        let certs = manager(authority.clone(), Arc::new(MemoryStore::default()));

        let err = certs.get_certificate(Some("example.test")).await.unwrap_err();
        assert!(matches!(err, CertError::Issuance { .. }));

        // Next handshake retries rather than caching the failure
        assert!(certs.get_certificate(Some("example.test")).await.is_err());
        assert_eq!(authority.calls(), 2);
    }

    #[tokio::test]
    async fn test_renew_if_due_ignores_missing_certificate() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let certs = manager(authority.clone(), Arc::new(MemoryStore::default()));

        assert!(certs.renew_if_due().await.is_none());
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_renew_if_due_renews_stale_certificate() {
        let store = Arc::new(MemoryStore::default());
        store
            .save(&self_signed("example.test", Utc::now() + chrono::Duration::days(3)))
            .await
            .unwrap();
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let certs = manager(authority.clone(), store);

        let renewed = certs.renew_if_due().await.unwrap().unwrap();
        assert!(renewed.not_after() > Utc::now() + chrono::Duration::days(30));
        assert!(certs.renew_if_due().await.is_none());
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_reload_from_store_picks_up_replaced_record() {
        let store = Arc::new(MemoryStore::default());
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let certs = manager(authority, store.clone());

        certs.get_certificate(Some("example.test")).await.unwrap();

        let replacement = self_signed("example.test", Utc::now() + chrono::Duration::days(200));
        store.save(&replacement).await.unwrap();

        let not_after = certs.reload_from_store().await.unwrap();
        assert_eq!(not_after, Some(replacement.not_after));
        assert_eq!(certs.current().await.unwrap().record(), &replacement);
    }

    #[tokio::test]
    async fn test_challenge_response_checks_host() {
        let certs = manager(
            Arc::new(CountingAuthority::new(Duration::ZERO)),
            Arc::new(MemoryStore::default()),
        );
        certs.challenges().publish("tok", "tok.thumb").await;

        assert_eq!(
            certs.challenge_response(Some("example.test"), "tok").await,
            ChallengeResponse::Found("tok.thumb".to_string())
        );
        assert_eq!(
            certs.challenge_response(Some("other.test"), "tok").await,
            ChallengeResponse::Forbidden
        );
        assert_eq!(
            certs.challenge_response(Some("example.test"), "missing").await,
            ChallengeResponse::NotFound
        );
    }

    #[test]
    fn test_invalid_record_is_rejected() {
        let record = CertificateRecord {
            domain: "example.test".to_string(),
            cert_chain_pem: String::new(),
            private_key_pem: String::new(),
            not_after: Utc::now(),
        };
        assert!(matches!(
            LoadedCert::from_record(record),
            Err(CertError::InvalidRecord { .. })
        ));
    }
}
