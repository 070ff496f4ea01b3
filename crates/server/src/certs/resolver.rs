//! Certificate resolution for TLS handshakes
//!
//! # Resolution Order
//!
//! 1. Normalize the server name and check the whitelist
//! 2. Serve a fresh in-memory entry (no I/O, no await on the fast path)
//! 3. Ask the ACME delegate, for ACME-whitelisted names only
//! 4. Fall back to a new self-signed certificate
//!
//! An ACME attempt is bounded by the ACME timeout; when it runs out the
//! attempt counts as failed and the self-signed fallback is used.
//!
//! An entry is fresh while its remaining lifetime is strictly greater than
//! the refresh threshold. Expiring entries are evicted and replaced wholesale.
//! Concurrent refreshes of the same name may both issue; the last insert wins.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{not_after, CertificateError, IssuedCertificate, SelfSignedIssuer};
use crate::acme::AcmeDelegate;
use crate::domain::{to_ascii, DomainWhitelist};

/// Default bound on one ACME attempt
pub const DEFAULT_ACME_TIMEOUT: Duration = Duration::from_secs(30);

/// One resolved certificate and its lazily parsed expiry.
#[derive(Debug)]
struct CacheEntry {
    key: Arc<CertifiedKey>,
    not_after: OnceLock<SystemTime>,
}

impl CacheEntry {
    fn new(key: Arc<CertifiedKey>) -> Self {
        Self {
            key,
            not_after: OnceLock::new(),
        }
    }

    /// Leaf expiry; an unparseable leaf counts as already expired.
    fn not_after(&self) -> SystemTime {
        *self.not_after.get_or_init(|| {
            self.key
                .cert
                .first()
                .and_then(not_after)
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
    }

    fn is_fresh(&self, now: SystemTime, threshold: Duration) -> bool {
        match self.not_after().duration_since(now) {
            Ok(remaining) => remaining > threshold,
            Err(_) => false,
        }
    }
}

/// Resolves server names to certificates, owning the in-memory cache.
pub struct CertificateResolver {
    whitelist: Arc<DomainWhitelist>,
    cache: DashMap<String, Arc<CacheEntry>>,
    acme: Option<Arc<dyn AcmeDelegate>>,
    issuer: SelfSignedIssuer,
    refresh_threshold: Duration,
    acme_timeout: Duration,
}

impl CertificateResolver {
    pub fn new(
        whitelist: Arc<DomainWhitelist>,
        issuer: SelfSignedIssuer,
        acme: Option<Arc<dyn AcmeDelegate>>,
        refresh_threshold: Duration,
    ) -> Self {
        Self {
            whitelist,
            cache: DashMap::new(),
            acme,
            issuer,
            refresh_threshold,
            acme_timeout: DEFAULT_ACME_TIMEOUT,
        }
    }

    pub fn with_acme_timeout(mut self, acme_timeout: Duration) -> Self {
        self.acme_timeout = acme_timeout;
        self
    }

    pub fn whitelist(&self) -> &DomainWhitelist {
        &self.whitelist
    }

    /// Resolve a certificate for a raw server name.
    pub async fn resolve(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        self.resolve_at(server_name, SystemTime::now()).await
    }

    /// Resolve a certificate as of `now`.
    pub async fn resolve_at(
        &self,
        server_name: &str,
        now: SystemTime,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        let ascii = to_ascii(server_name)?;
        if !self.whitelist.allows(&ascii) {
            return Err(CertificateError::NotWhitelisted(ascii));
        }

        if let Some(key) = self.cached(&ascii, now) {
            return Ok(key);
        }

        let acme_failure = match self.try_acme(&ascii).await {
            Ok(key) => return Ok(key),
            Err(reason) => reason,
        };

        match self.issue_self_signed(&ascii, now).await {
            Ok(key) => Ok(key),
            Err(e) => {
                warn!(domain = %ascii, acme = %acme_failure, error = %e, "All issuance paths failed");
                Err(CertificateError::IssuanceFailed {
                    domain: ascii,
                    acme: acme_failure,
                    self_signed: Box::new(e),
                })
            }
        }
    }

    /// Resolve every whitelisted name once, concurrently, logging failures.
    pub async fn warm(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        for domain in self.whitelist.domains().map(str::to_string) {
            let resolver = Arc::clone(&self);
            tasks.spawn(async move {
                match resolver.resolve(&domain).await {
                    Ok(_) => debug!(domain = %domain, "Certificate ready"),
                    Err(e) => warn!(domain = %domain, error = %e, "Failed to prepare certificate"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Number of names with a cached certificate
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Cached certificate for an ASCII name, regardless of freshness
    pub fn peek(&self, ascii: &str) -> Option<Arc<CertifiedKey>> {
        self.cache.get(ascii).map(|entry| Arc::clone(&entry.key))
    }

    fn cached(&self, ascii: &str, now: SystemTime) -> Option<Arc<CertifiedKey>> {
        let entry = self.cache.get(ascii).map(|e| Arc::clone(e.value()))?;

        if entry.is_fresh(now, self.refresh_threshold) {
            return Some(Arc::clone(&entry.key));
        }

        info!(
            domain = %ascii,
            threshold_secs = self.refresh_threshold.as_secs(),
            "Cached certificate expires within threshold, refreshing"
        );
        // Leave a replacement inserted by a concurrent refresh in place
        self.cache
            .remove_if(ascii, |_, current| Arc::ptr_eq(current, &entry));
        None
    }

    fn insert(&self, ascii: &str, key: Arc<CertifiedKey>) {
        self.cache
            .insert(ascii.to_string(), Arc::new(CacheEntry::new(key)));
    }

    /// Try ACME, returning the failure reason when it is not used or fails.
    async fn try_acme(&self, ascii: &str) -> Result<Arc<CertifiedKey>, String> {
        if !self.whitelist.allows_acme(ascii) {
            return Err("domain not configured for ACME".to_string());
        }
        let Some(acme) = &self.acme else {
            return Err("ACME disabled".to_string());
        };

        let issued = match tokio::time::timeout(self.acme_timeout, acme.obtain_or_renew(ascii)).await {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => {
                warn!(domain = %ascii, error = %e, "ACME issuance failed, falling back to self-signed");
                return Err(e.to_string());
            }
            Err(_) => {
                warn!(
                    domain = %ascii,
                    timeout_secs = self.acme_timeout.as_secs(),
                    "ACME issuance timed out, falling back to self-signed"
                );
                return Err(format!("timed out after {:?}", self.acme_timeout));
            }
        };

        let key = issued
            .into_certified_key(ascii)
            .map_err(|e| e.to_string())?;
        self.insert(ascii, Arc::clone(&key));
        Ok(key)
    }

    async fn issue_self_signed(
        &self,
        ascii: &str,
        now: SystemTime,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        let issuer = self.issuer.clone();
        let name = ascii.to_string();

        // RSA key generation is CPU bound
        let issued: IssuedCertificate =
            tokio::task::spawn_blocking(move || issuer.issue_at(&name, now))
                .await
                .map_err(|e| CertificateError::KeyGenFailed {
                    domain: ascii.to_string(),
                    message: e.to_string(),
                })??;

        let key = issued.into_certified_key(ascii)?;
        self.insert(ascii, Arc::clone(&key));
        Ok(key)
    }
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver")
            .field("cached", &self.cache.len())
            .field("acme", &self.acme.is_some())
            .field("refresh_threshold", &self.refresh_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn resolver() -> CertificateResolver {
        let whitelist = Arc::new(DomainWhitelist::new(Vec::<String>::new(), ["localhost"]));
        let issuer = SelfSignedIssuer::new(Arc::clone(&whitelist), HOUR, HOUR, 2048);
        CertificateResolver::new(whitelist, issuer, None, HOUR)
    }

    #[tokio::test]
    async fn test_invalid_and_unlisted_names() {
        let resolver = resolver();

        assert!(matches!(
            resolver.resolve("").await,
            Err(CertificateError::InvalidDomain(_))
        ));
        assert!(matches!(
            resolver.resolve("example.org").await,
            Err(CertificateError::NotWhitelisted(_))
        ));
        assert_eq!(resolver.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_case_insensitive_cache_key() {
        let resolver = resolver();

        let first = resolver.resolve("LocalHost").await.unwrap();
        let second = resolver.resolve("localhost").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unparseable_leaf_is_expired() {
        let whitelist = Arc::new(DomainWhitelist::new(Vec::<String>::new(), ["localhost"]));
        let issuer = SelfSignedIssuer::new(whitelist, HOUR, HOUR, 2048);
        let issued = issuer.issue("localhost").unwrap();

        let mut key = issued.into_certified_key("localhost").unwrap();
        Arc::make_mut(&mut key).cert = vec![rustls::pki_types::CertificateDer::from(vec![0u8; 4])];

        let entry = CacheEntry::new(key);
        assert!(!entry.is_fresh(SystemTime::now(), HOUR));
    }
}
