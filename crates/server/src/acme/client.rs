//! ACME delegate backed by instant-acme
//!
//! Obtains and renews certificates from Let's Encrypt using HTTP-01
//! challenges. Account credentials and issued certificates are kept in a
//! [`CertCache`]; inside the jailed worker that cache is the supervisor's
//! store reached over the command channel.
//!
//! # Cache Layout
//!
//! - `acme_account+key`: serialized account credentials (JSON)
//! - `<domain>`: PEM private key followed by the certificate chain

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};
use warden_config::CertificateConfig;

use super::challenge::{ChallengeManager, PublishedChallenges};
use super::error::AcmeError;
use crate::certs::{CacheError, CertCache, IssuedCertificate};
use crate::domain::DomainWhitelist;

/// Cache name of the ACME account credentials
pub const ACCOUNT_CACHE_KEY: &str = "acme_account+key";

/// Stored certificates are reissued this long before the refresh threshold
/// is reached, so the resolver never sees an ACME certificate it would evict.
pub const RENEWAL_MARGIN: Duration = Duration::from_secs(24 * 3600);

/// Timeout for challenge validation
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Timeout for certificate issuance after finalization
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Automated issuance and renewal for a single domain.
#[async_trait]
pub trait AcmeDelegate: Send + Sync {
    /// Return a valid certificate for an ASCII domain, reusing a stored one
    /// while it is far enough from expiry.
    async fn obtain_or_renew(&self, domain: &str) -> Result<IssuedCertificate, AcmeError>;
}

/// [`AcmeDelegate`] using the `instant-acme` client.
pub struct InstantAcmeDelegate {
    cache: Arc<dyn CertCache>,
    challenges: ChallengeManager,
    whitelist: Arc<DomainWhitelist>,
    email: Option<String>,
    staging: bool,
    refresh_threshold: Duration,
    account: OnceCell<Account>,
}

impl InstantAcmeDelegate {
    pub fn new(
        cache: Arc<dyn CertCache>,
        challenges: ChallengeManager,
        whitelist: Arc<DomainWhitelist>,
        config: &CertificateConfig,
    ) -> Self {
        Self {
            cache,
            challenges,
            whitelist,
            email: config.acme_email.clone(),
            staging: config.acme_staging,
            refresh_threshold: config.refresh_threshold(),
            account: OnceCell::new(),
        }
    }

    /// Read a cache entry, treating lookups that time out as misses.
    async fn load(&self, name: &str) -> Option<Bytes> {
        match self.cache.get(name).await {
            Ok(data) => Some(data),
            Err(CacheError::CacheMiss) => None,
            Err(e) => {
                warn!(name = %name, error = %e, "Certificate cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn store(&self, name: &str, data: Bytes) {
        if let Err(e) = self.cache.put(name, data).await {
            error!(name = %name, error = %e, "Failed to persist to certificate cache");
        }
    }

    /// Stored certificate, if it outlives the threshold plus the renewal margin.
    async fn cached_certificate(&self, domain: &str) -> Option<IssuedCertificate> {
        let bundle = self.load(domain).await?;
        let cert = match parse_bundle(&bundle) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Ignoring unreadable stored certificate");
                return None;
            }
        };

        let expires = cert.not_after()?;
        let remaining = expires.duration_since(SystemTime::now()).unwrap_or_default();
        if remaining > self.refresh_threshold.saturating_add(RENEWAL_MARGIN) {
            debug!(
                domain = %domain,
                expires = %DateTime::<Utc>::from(expires),
                "Using stored ACME certificate"
            );
            Some(cert)
        } else {
            info!(
                domain = %domain,
                expires = %DateTime::<Utc>::from(expires),
                "Stored ACME certificate needs renewal"
            );
            None
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        if let Some(json) = self.load(ACCOUNT_CACHE_KEY).await {
            info!("Loading existing ACME account from cache");

            let credentials: AccountCredentials = serde_json::from_slice(&json).map_err(|e| {
                AcmeError::AccountCreation(format!("Failed to deserialize credentials: {}", e))
            })?;

            let account = Account::builder()
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;
            return Ok(account);
        }

        info!(
            email = ?self.email,
            staging = self.staging,
            "Creating new ACME account"
        );

        let directory = if self.staging {
            LetsEncrypt::Staging
        } else {
            LetsEncrypt::Production
        };
        let contact = self.email.as_ref().map(|email| format!("mailto:{}", email));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory.url().to_owned(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        let json = serde_json::to_vec(&credentials).map_err(|e| {
            AcmeError::AccountCreation(format!("Failed to serialize credentials: {}", e))
        })?;
        self.store(ACCOUNT_CACHE_KEY, Bytes::from(json)).await;

        info!("ACME account created successfully");
        Ok(account)
    }

    /// Place an order and publish its HTTP-01 challenges through `published`,
    /// which withdraws them when dropped.
    async fn create_order(
        &self,
        account: &Account,
        domain: &str,
        published: &mut PublishedChallenges,
    ) -> Result<Order, AcmeError> {
        let identifiers = [Identifier::Dns(domain.to_string())];

        info!(domain = %domain, "Creating certificate order");
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(|e| {
                    AcmeError::OrderCreation(format!("Failed to get authorization: {}", e))
                })?;

                debug!(domain = %domain, status = ?authz.status, "Processing authorization");
                if authz.status == AuthorizationStatus::Valid {
                    continue;
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| AcmeError::NoHttp01Challenge(domain.to_string()))?;

                let key_authorization = challenge.key_authorization();
                published.publish(&challenge.token, key_authorization.as_str());

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| AcmeError::ChallengeValidation {
                        domain: domain.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        Ok(order)
    }

    async fn wait_for_order_ready(&self, order: &mut Order) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::OrderCreation(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::OrderCreation("Order became invalid".to_string()));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "Timed out waiting for order to become ready".to_string(),
                        ));
                    }
                    trace!(status = ?state.status, "Order not ready yet, waiting");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Submit a CSR and return the PEM bundle (key first, then chain).
    async fn finalize_order(&self, order: &mut Order, domain: &str) -> Result<String, AcmeError> {
        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("Failed to generate key: {}", e)))?;
        let csr = rcgen::CertificateParams::new(vec![domain.to_string()])
            .and_then(|params| params.serialize_request(&cert_key))
            .map_err(|e| AcmeError::Finalization(format!("Failed to build CSR: {}", e)))?;

        order
            .finalize_csr(csr.der())
            .await
            .map_err(|e| AcmeError::Finalization(format!("Failed to finalize order: {}", e)))?;

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        let chain = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Finalization(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        AcmeError::Finalization(format!("Failed to get certificate: {}", e))
                    })?;
                    break chain.ok_or_else(|| {
                        AcmeError::Finalization("No certificate in response".to_string())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "Timed out waiting for certificate".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok(format!("{}{}", cert_key.serialize_pem(), chain))
    }

    async fn issue(&self, domain: &str) -> Result<String, AcmeError> {
        let account = self.account().await?;

        // Withdrawn on every exit, including cancellation of this future
        let mut published = self.challenges.published();
        let mut order = self.create_order(account, domain, &mut published).await?;
        self.wait_for_order_ready(&mut order).await?;
        self.finalize_order(&mut order, domain).await
    }
}

#[async_trait]
impl AcmeDelegate for InstantAcmeDelegate {
    async fn obtain_or_renew(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        if !self.whitelist.allows_acme(domain) {
            return Err(AcmeError::NotConfigured(domain.to_string()));
        }

        if let Some(cert) = self.cached_certificate(domain).await {
            return Ok(cert);
        }

        let bundle = self.issue(domain).await?;
        let cert = parse_bundle(bundle.as_bytes())?;

        if let Some(expires) = cert.not_after() {
            info!(
                domain = %domain,
                expires = %DateTime::<Utc>::from(expires),
                "Certificate issued successfully"
            );
        }

        self.store(domain, Bytes::from(bundle)).await;
        Ok(cert)
    }
}

/// Split a stored PEM bundle into its certificate chain and private key.
pub fn parse_bundle(bundle: &[u8]) -> Result<IssuedCertificate, AcmeError> {
    let chain = rustls_pemfile::certs(&mut &bundle[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
    if chain.is_empty() {
        return Err(AcmeError::CertificateParse("no certificate in bundle".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut &bundle[..])
        .map_err(|e| AcmeError::CertificateParse(e.to_string()))?
        .ok_or_else(|| AcmeError::CertificateParse("no private key in bundle".to_string()))?;

    Ok(IssuedCertificate { chain, key })
}
