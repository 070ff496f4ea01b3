//! Field validators and cross-field checks.

use std::net::SocketAddr;
use validator::ValidationError;

use crate::certificates::SUPPORTED_RSA_KEY_BITS;
use crate::{Config, ConfigError};

/// `validator` hook: the value must parse as `ip:port`.
pub(crate) fn validate_socket_addr(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("socket_addr"))
}

pub(crate) fn validate_domains(config: &Config) -> Result<(), ConfigError> {
    let certs = &config.certificates;
    for domain in certs.acme_domains.iter().chain(&certs.self_signed_domains) {
        if domain.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "empty domain in certificate whitelist".to_string(),
            ));
        }
    }

    if !certs.acme_domains.is_empty() && certs.acme_email.as_deref().unwrap_or("").is_empty() {
        return Err(ConfigError::Invalid(
            "acme-domains requires acme-email for the ACME account".to_string(),
        ));
    }

    Ok(())
}

pub(crate) fn validate_key_size(config: &Config) -> Result<(), ConfigError> {
    let bits = config.certificates.rsa_key_bits;
    if !SUPPORTED_RSA_KEY_BITS.contains(&bits) {
        return Err(ConfigError::Invalid(format!(
            "rsa-key-bits {} not supported (expected one of {:?})",
            bits, SUPPORTED_RSA_KEY_BITS
        )));
    }
    Ok(())
}

/// An ACME attempt has to end early enough for the self-signed fallback to
/// finish inside the same handshake.
pub(crate) fn validate_timeouts(config: &Config) -> Result<(), ConfigError> {
    let acme = config.certificates.acme_timeout_secs;
    let request = config.server.request_timeout_secs;
    if acme >= request {
        return Err(ConfigError::Invalid(format!(
            "acme-timeout-secs ({}) must be below request-timeout-secs ({})",
            acme, request
        )));
    }
    Ok(())
}
