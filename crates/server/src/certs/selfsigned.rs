//! Self-signed certificate issuance
//!
//! Fallback for whitelisted names when ACME is unavailable or not configured
//! for the name. Certificates live just past the refresh threshold so the
//! resolver retries ACME once they start expiring.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, RsaKeySize,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tracing::{debug, info};
use warden_config::CertificateConfig;

use super::{CertificateError, IssuedCertificate};
use crate::domain::DomainWhitelist;

/// Generates a fresh RSA key and self-signed server certificate per call.
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    whitelist: Arc<DomainWhitelist>,
    validity: Duration,
    key_bits: u32,
}

impl SelfSignedIssuer {
    /// Certificates are valid for `refresh_threshold + margin`.
    pub fn new(
        whitelist: Arc<DomainWhitelist>,
        refresh_threshold: Duration,
        margin: Duration,
        key_bits: u32,
    ) -> Self {
        Self {
            whitelist,
            validity: refresh_threshold.saturating_add(margin),
            key_bits,
        }
    }

    pub fn from_config(whitelist: Arc<DomainWhitelist>, config: &CertificateConfig) -> Self {
        Self::new(
            whitelist,
            config.refresh_threshold(),
            config.self_signed_margin(),
            config.rsa_key_bits,
        )
    }

    /// Lifetime of issued certificates
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a certificate for an ASCII name, valid from now.
    pub fn issue(&self, ascii: &str) -> Result<IssuedCertificate, CertificateError> {
        self.issue_at(ascii, SystemTime::now())
    }

    /// Issue a certificate valid over `[now, now + validity]`.
    ///
    /// Fails with [`CertificateError::NotWhitelisted`] before any key
    /// material is generated.
    pub fn issue_at(
        &self,
        ascii: &str,
        now: SystemTime,
    ) -> Result<IssuedCertificate, CertificateError> {
        if !self.whitelist.allows(ascii) {
            return Err(CertificateError::NotWhitelisted(ascii.to_string()));
        }

        let mut params = CertificateParams::new(vec![ascii.to_string()])
            .map_err(|e| CertificateError::build(ascii, e))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ascii);
        params.distinguished_name = dn;

        let not_before = OffsetDateTime::from(now);
        let validity =
            time::Duration::try_from(self.validity).map_err(|e| CertificateError::build(ascii, e))?;
        params.not_before = not_before;
        params.not_after = not_before
            .checked_add(validity)
            .ok_or_else(|| CertificateError::build(ascii, "validity period out of range"))?;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;

        debug!(domain = %ascii, bits = self.key_bits, "Generating RSA key");
        let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rsa_key_size(self.key_bits))
            .map_err(|e| CertificateError::KeyGenFailed {
                domain: ascii.to_string(),
                message: e.to_string(),
            })?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::build(ascii, e))?;

        info!(
            domain = %ascii,
            valid_for_hours = self.validity.as_secs() / 3600,
            "Issued self-signed certificate"
        );

        Ok(IssuedCertificate {
            chain: vec![CertificateDer::from(cert.der().to_vec())],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }
}

fn rsa_key_size(bits: u32) -> RsaKeySize {
    match bits {
        2048 => RsaKeySize::_2048,
        3072 => RsaKeySize::_3072,
        _ => RsaKeySize::_4096,
    }
}
