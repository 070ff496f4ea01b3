//! Certificate management
//!
//! # Architecture
//!
//! - [`CertificateResolver`] - Per-handshake lookup: memory cache, expiry
//!   check, ACME, then self-signed fallback
//! - [`SelfSignedIssuer`] - Short-lived RSA certificates for whitelisted names
//! - [`CertCache`] - Persistent get/put/delete store used by the ACME delegate
//! - [`DirCache`] - Filesystem store owned by the supervisor
//! - [`RemoteCache`] - Worker-side store that forwards every call to the
//!   supervisor over the command channel

mod cache;
mod error;
mod remote;
mod resolver;
mod selfsigned;
mod store;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;

pub use cache::CertCache;
pub use error::{CacheError, CertificateError};
pub use remote::RemoteCache;
pub use resolver::CertificateResolver;
pub use selfsigned::SelfSignedIssuer;
pub use store::DirCache;

/// A certificate chain and its private key, leaf first.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl IssuedCertificate {
    /// Expiry of the leaf certificate
    pub fn not_after(&self) -> Option<SystemTime> {
        self.chain.first().and_then(not_after)
    }

    /// Turn the pair into a rustls signing bundle.
    pub fn into_certified_key(self, domain: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        if self.chain.is_empty() {
            return Err(CertificateError::build(domain, "empty certificate chain"));
        }
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&self.key)
            .map_err(|e| CertificateError::build(domain, e))?;
        Ok(Arc::new(CertifiedKey::new(self.chain, signing_key)))
    }
}

/// Parse the `NotAfter` field of a DER certificate.
pub fn not_after(cert: &CertificateDer<'_>) -> Option<SystemTime> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let secs = parsed.validity().not_after.timestamp();
    u64::try_from(secs)
        .ok()
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}
