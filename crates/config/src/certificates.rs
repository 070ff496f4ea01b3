//! Certificate management configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Lower bound for the refresh threshold (1 hour)
pub const MIN_REFRESH_THRESHOLD: Duration = Duration::from_secs(3600);

/// Upper bound for the refresh threshold (10 years)
pub const MAX_REFRESH_THRESHOLD_SECS: u64 = 10 * 365 * 86400;

/// Upper bound for the self-signed margin (10 years)
pub const MAX_SELF_SIGNED_MARGIN_DAYS: u64 = 10 * 365;

/// RSA modulus sizes accepted for self-signed keys
pub const SUPPORTED_RSA_KEY_BITS: [u32; 3] = [2048, 3072, 4096];

/// Whitelists, refresh policy, and the supervisor's certificate store
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct CertificateConfig {
    /// Domains allowed to request certificates from the ACME provider
    pub acme_domains: Vec<String>,

    /// Domains allowed to receive a self-signed certificate.
    ///
    /// ACME domains are always added to this list at startup.
    pub self_signed_domains: Vec<String>,

    /// Directory of the supervisor's on-disk certificate store
    pub cache_directory: PathBuf,

    /// Remaining lifetime below which a certificate is refreshed
    #[validate(range(max = 315360000))]
    pub refresh_threshold_secs: u64,

    /// Extra validity of self-signed certificates beyond the refresh threshold
    #[validate(range(max = 3650))]
    pub self_signed_margin_days: u64,

    pub rsa_key_bits: u32,

    /// Contact address for the ACME account
    pub acme_email: Option<String>,

    /// Use the provider's staging directory
    pub acme_staging: bool,

    /// Bound on a cache lookup round trip to the supervisor
    #[validate(range(min = 1))]
    pub channel_timeout_secs: u64,

    /// Bound on one ACME attempt before falling back to self-signed.
    /// Must stay below the server's request timeout.
    #[validate(range(min = 1))]
    pub acme_timeout_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            acme_domains: Vec::new(),
            self_signed_domains: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            cache_directory: PathBuf::from("certs"),
            refresh_threshold_secs: default_refresh_threshold(),
            self_signed_margin_days: 14,
            rsa_key_bits: 4096,
            acme_email: None,
            acme_staging: false,
            channel_timeout_secs: 5,
            acme_timeout_secs: 30,
        }
    }
}

impl CertificateConfig {
    /// Refresh threshold, never below [`MIN_REFRESH_THRESHOLD`].
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs).max(MIN_REFRESH_THRESHOLD)
    }

    pub fn self_signed_margin(&self) -> Duration {
        Duration::from_secs(self.self_signed_margin_days.saturating_mul(86400))
    }

    pub fn acme_timeout(&self) -> Duration {
        Duration::from_secs(self.acme_timeout_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    /// Clamp the refresh threshold in place. Returns a notice when it was
    /// raised.
    pub(crate) fn clamp_refresh_threshold(&mut self) -> Option<String> {
        let min = MIN_REFRESH_THRESHOLD.as_secs();
        if self.refresh_threshold_secs >= min {
            return None;
        }
        let notice = format!(
            "refresh-threshold-secs {} is below the minimum, using {}",
            self.refresh_threshold_secs, min
        );
        self.refresh_threshold_secs = min;
        Some(notice)
    }
}

pub(crate) fn default_refresh_threshold() -> u64 {
    24 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_threshold_clamped() {
        let mut config = CertificateConfig {
            refresh_threshold_secs: 60,
            ..Default::default()
        };
        assert_eq!(config.refresh_threshold(), MIN_REFRESH_THRESHOLD);

        let notice = config.clamp_refresh_threshold().unwrap();
        assert!(notice.contains("60"), "{}", notice);
        assert_eq!(config.refresh_threshold_secs, 3600);
    }

    #[test]
    fn test_refresh_threshold_kept_above_minimum() {
        let mut config = CertificateConfig::default();
        assert!(config.clamp_refresh_threshold().is_none());
        assert_eq!(config.refresh_threshold(), Duration::from_secs(86400));
    }

    #[test]
    fn test_upper_bounds_rejected() {
        let config = CertificateConfig {
            refresh_threshold_secs: 1_000_000_000_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CertificateConfig {
            self_signed_margin_days: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CertificateConfig {
            refresh_threshold_secs: MAX_REFRESH_THRESHOLD_SECS,
            self_signed_margin_days: MAX_SELF_SIGNED_MARGIN_DAYS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_margin_in_days() {
        let config = CertificateConfig::default();
        assert_eq!(config.self_signed_margin(), Duration::from_secs(14 * 86400));
    }
}
