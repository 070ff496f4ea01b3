//! Certificate and cache error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving a certificate for a TLS handshake.
///
/// Every variant fails the current handshake only.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Server name is empty or not a valid IDNA domain
    #[error("Invalid domain name '{0}'")]
    InvalidDomain(String),

    /// Server name is in neither whitelist
    #[error("Domain '{0}' is not whitelisted")]
    NotWhitelisted(String),

    /// Key pair generation failed
    #[error("Failed to generate key pair for '{domain}': {message}")]
    KeyGenFailed { domain: String, message: String },

    /// Certificate could not be built, signed, or parsed
    #[error("Failed to build certificate for '{domain}': {message}")]
    CertBuildFailed { domain: String, message: String },

    /// ACME and the self-signed fallback both failed
    #[error("Certificate issuance failed for '{domain}' (acme: {acme}; self-signed: {self_signed})")]
    IssuanceFailed {
        domain: String,
        acme: String,
        self_signed: Box<CertificateError>,
    },
}

impl CertificateError {
    pub(crate) fn build(domain: &str, message: impl ToString) -> Self {
        Self::CertBuildFailed {
            domain: domain.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors of the persistent certificate cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry stored under this name
    #[error("Cache miss")]
    CacheMiss,

    /// The supervisor did not answer in time
    #[error("Timed out after {0:?} waiting for the certificate store")]
    Timeout(Duration),

    /// Empty payloads cannot be stored
    #[error("Refusing to store an empty entry for '{0}'")]
    EmptyPayload(String),

    /// Filesystem failure in the store
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// The command channel to the supervisor is gone
    #[error("Command channel closed")]
    ChannelClosed,
}
