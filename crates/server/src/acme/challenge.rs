//! HTTP-01 challenge store
//!
//! The ACME delegate publishes `token -> key authorization` pairs here while
//! an order is pending. The plain HTTP listener answers
//! `/.well-known/acme-challenge/<token>` from the same map.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    pending: Arc<DashMap<String, Bytes>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Publishing HTTP-01 challenge");
        self.pending
            .insert(token.to_owned(), Bytes::copy_from_slice(key_authorization.as_bytes()));
    }

    pub fn withdraw(&self, token: &str) {
        if self.pending.remove(token).is_some() {
            debug!(token = %token, "Withdrew HTTP-01 challenge");
        }
    }

    /// Body to answer a challenge request with
    pub fn key_authorization(&self, token: &str) -> Option<Bytes> {
        let found = self.pending.get(token).map(|entry| entry.value().clone());
        trace!(token = %token, found = found.is_some(), "Challenge lookup");
        found
    }

    /// Token of a challenge request path. Empty tokens and nested paths are
    /// not challenge requests.
    pub fn token_from_path(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Start publishing challenges for one order.
    pub fn published(&self) -> PublishedChallenges {
        PublishedChallenges {
            challenges: self.clone(),
            tokens: Vec::new(),
        }
    }
}

/// Challenges published for one order. Dropping it withdraws them, so an
/// order abandoned mid-flight leaves nothing behind.
#[derive(Debug)]
pub struct PublishedChallenges {
    challenges: ChallengeManager,
    tokens: Vec<String>,
}

impl PublishedChallenges {
    pub fn publish(&mut self, token: &str, key_authorization: &str) {
        self.challenges.publish(token, key_authorization);
        self.tokens.push(token.to_owned());
    }
}

impl Drop for PublishedChallenges {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.challenges.withdraw(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_withdraw() {
        let challenges = ChallengeManager::new();
        let listener = challenges.clone();

        challenges.publish("tok", "tok.thumbprint");
        assert_eq!(listener.key_authorization("tok").as_deref(), Some(&b"tok.thumbprint"[..]));

        challenges.withdraw("tok");
        assert!(listener.is_empty());
        assert!(listener.key_authorization("tok").is_none());
    }

    #[test]
    fn test_token_from_path() {
        assert_eq!(
            ChallengeManager::token_from_path("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeManager::token_from_path("/.well-known/acme-challenge/"), None);
        assert_eq!(ChallengeManager::token_from_path("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(ChallengeManager::token_from_path("/index.html"), None);
    }

    #[tokio::test]
    async fn test_cancelled_order_withdraws_challenges() {
        let challenges = ChallengeManager::new();
        let order = {
            let challenges = challenges.clone();
            async move {
                let mut published = challenges.published();
                published.publish("tok", "tok.thumbprint");
                std::future::pending::<()>().await;
            }
        };

        let result = tokio::time::timeout(std::time::Duration::from_millis(20), order).await;
        assert!(result.is_err());
        assert!(challenges.is_empty());
    }
}
