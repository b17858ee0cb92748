//! Certificate issuance.
//!
//! [`Authority`] is the capability the certificate manager depends on: obtain a
//! certificate for one domain or fail. [`AcmeAuthority`] implements it against an
//! ACME directory (RFC 8555) using HTTP-01 validation, publishing challenge tokens
//! into the shared [`ChallengeStore`] for the plaintext listener to serve.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{AcmeSettings, ACME_ACCOUNT_FILE, ACME_MAX_POLLS, ACME_POLL_INTERVAL_SECS};

use super::challenge::ChallengeStore;
use super::store::CertificateRecord;

/// The certificate authority rejected a request or a challenge failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct IssuanceError(pub String);

impl From<instant_acme::Error> for IssuanceError {
    fn from(e: instant_acme::Error) -> Self {
        IssuanceError(format!("ACME error: {e}"))
    }
}

impl From<rcgen::Error> for IssuanceError {
    fn from(e: rcgen::Error) -> Self {
        IssuanceError(format!("key generation failed: {e}"))
    }
}

/// Something that can issue a certificate for a domain.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Obtain a fresh certificate for `domain`.
    ///
    /// HTTP-01 tokens needed during validation are published in `challenges` and
    /// withdrawn again before returning.
    async fn obtain(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<CertificateRecord, IssuanceError>;
}

/// Read the expiry of the leaf (first) certificate of a PEM chain.
pub fn leaf_not_after(cert_chain_pem: &str) -> Result<DateTime<Utc>, IssuanceError> {
    let leaf = CertificateDer::pem_slice_iter(cert_chain_pem.as_bytes())
        .next()
        .ok_or_else(|| IssuanceError("certificate chain is empty".to_string()))?
        .map_err(|e| IssuanceError(format!("invalid certificate PEM: {e}")))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| IssuanceError(format!("invalid certificate: {e}")))?;

    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| IssuanceError("certificate expiry out of range".to_string()))
}

/// Account file contents, tagged with the directory it belongs to
#[derive(Serialize, Deserialize)]
struct StoredAccount {
    directory_url: String,
    created: DateTime<Utc>,
    credentials: serde_json::Value,
}

/// ACME client for a single directory with a persisted account.
pub struct AcmeAuthority {
    directory_url: String,
    contact: Option<String>,
    account_path: PathBuf,
    account: Mutex<Option<Account>>,
}

impl AcmeAuthority {
    pub fn new(settings: &AcmeSettings) -> Self {
        Self {
            directory_url: settings.directory_url.clone(),
            contact: settings
                .contact_email
                .as_ref()
                .map(|email| format!("mailto:{email}")),
            account_path: settings.cache_dir.join(ACME_ACCOUNT_FILE),
            account: Mutex::new(None),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Reuse the in-process account, then the persisted one, then register.
    async fn account(&self) -> Result<Account, IssuanceError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.load_account().await {
            Some(account) => account,
            None => self.create_account().await?,
        };
        *cached = Some(account.clone());
        Ok(account)
    }

    async fn load_account(&self) -> Option<Account> {
        let contents = tokio::fs::read(&self.account_path).await.ok()?;
        let stored: StoredAccount = match serde_json::from_slice(&contents) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(path = %self.account_path.display(), error = %e, "Ignoring unreadable ACME account file");
                return None;
            }
        };

        if stored.directory_url != self.directory_url {
            tracing::warn!(
                stored = %stored.directory_url,
                configured = %self.directory_url,
                "ACME account belongs to a different directory, registering a new one"
            );
            return None;
        }

        let credentials: AccountCredentials = serde_json::from_value(stored.credentials).ok()?;
        match Account::from_credentials(credentials).await {
            Ok(account) => {
                tracing::info!(
                    path = %self.account_path.display(),
                    created = %stored.created,
                    "Loaded ACME account"
                );
                Some(account)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stored ACME account rejected, registering a new one");
                None
            }
        }
    }

    async fn create_account(&self) -> Result<Account, IssuanceError> {
        tracing::info!(directory = %self.directory_url, "Registering ACME account");

        let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let stored = StoredAccount {
            directory_url: self.directory_url.clone(),
            created: Utc::now(),
            credentials: serde_json::to_value(&credentials)
                .map_err(|e| IssuanceError(format!("failed to encode account: {e}")))?,
        };
        if let Err(e) = self.persist_account(&stored).await {
            tracing::error!(path = %self.account_path.display(), error = %e, "Failed to persist ACME account");
        }

        Ok(account)
    }

    /// Write the account through a private temp file renamed into place.
    async fn persist_account(&self, stored: &StoredAccount) -> std::io::Result<()> {
        let dir = self
            .account_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&dir).await?;

        let encoded = serde_json::to_vec_pretty(stored)?;
        let tmp_path = dir.join(format!(".{ACME_ACCOUNT_FILE}.{}.tmp", uuid::Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        // The credentials hold the account private key
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            let mut file = options.open(&tmp_path).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.account_path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Run one order to completion. Published tokens are recorded in `published`.
    async fn run_order(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
        published: &mut Vec<String>,
    ) -> Result<CertificateRecord, IssuanceError> {
        let account = self.account().await?;
        let poll_interval = Duration::from_secs(ACME_POLL_INTERVAL_SECS);

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.to_string())],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        let mut ready_urls = Vec::new();
        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(IssuanceError(format!(
                        "authorization for {domain} is {status:?}"
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| IssuanceError(format!("no HTTP-01 challenge offered for {domain}")))?;

            let key_authorization = order.key_authorization(challenge);
            challenges
                .publish(challenge.token.clone(), key_authorization.as_str())
                .await;
            published.push(challenge.token.clone());
            ready_urls.push(challenge.url.clone());

            tracing::debug!(%domain, token = %challenge.token, "Published HTTP-01 challenge");
        }

        for url in &ready_urls {
            order.set_challenge_ready(url).await?;
        }

        let mut polls = 0;
        loop {
            let state = order.refresh().await?;
            match &state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    let detail = state
                        .error
                        .as_ref()
                        .map(|p| format!("{p:?}"))
                        .unwrap_or_else(|| "no detail".to_string());
                    return Err(IssuanceError(format!(
                        "order for {domain} became invalid: {detail}"
                    )));
                }
                OrderStatus::Valid => break,
                _ => {}
            }
            polls += 1;
            if polls >= ACME_MAX_POLLS {
                return Err(IssuanceError(format!(
                    "timed out waiting for {domain} to be validated"
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }

        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;

        if order.state().status == OrderStatus::Ready {
            order.finalize(csr.der().as_ref()).await?;
        }

        let mut polls = 0;
        let cert_chain_pem = loop {
            if let Some(chain) = order.certificate().await? {
                break chain;
            }
            polls += 1;
            if polls >= ACME_MAX_POLLS {
                return Err(IssuanceError(format!(
                    "timed out waiting for the {domain} certificate"
                )));
            }
            tokio::time::sleep(poll_interval).await;
        };

        let not_after = leaf_not_after(&cert_chain_pem)?;

        Ok(CertificateRecord {
            domain: domain.to_string(),
            cert_chain_pem,
            private_key_pem: key_pair.serialize_pem(),
            not_after,
        })
    }
}

#[async_trait]
impl Authority for AcmeAuthority {
    async fn obtain(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<CertificateRecord, IssuanceError> {
        tracing::info!(%domain, directory = %self.directory_url, "Requesting certificate");

        let mut published = Vec::new();
        let result = self.run_order(domain, challenges, &mut published).await;

        for token in &published {
            challenges.withdraw(token).await;
        }

        match &result {
            Ok(record) => {
                tracing::info!(%domain, not_after = %record.not_after, "Certificate issued")
            }
            Err(e) => tracing::warn!(%domain, error = %e, "Certificate issuance failed"),
        }
        result
    }
}
