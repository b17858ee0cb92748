//! HTTP-01 challenge tokens.
//!
//! The authority publishes `token -> key authorization` pairs here while an order
//! is being validated; the plaintext listener answers the certificate authority's
//! requests from the same registry. Tokens expire on their own.

use std::time::Duration;

use moka::future::Cache;

use crate::config::ACME_CHALLENGE_TTL_SECS;

#[derive(Clone)]
pub struct ChallengeStore {
    tokens: Cache<String, String>,
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(ACME_CHALLENGE_TTL_SECS))
    }
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub async fn publish(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens.insert(token.into(), key_authorization.into()).await;
    }

    pub async fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token).await
    }

    pub async fn withdraw(&self, token: &str) {
        self.tokens.invalidate(token).await;
    }
}
