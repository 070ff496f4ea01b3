//! Certificate store validation
//!
//! Inspects certificates the supervisor has already persisted for ACME
//! domains and reports expired or soon-expiring ones.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Validate cached ACME certificates
pub fn validate_cached_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let dir = &config.certificates.cache_directory;
    let threshold = config.certificates.refresh_threshold();

    for domain in &config.certificates.acme_domains {
        // The store keys certificates by the IDNA ASCII form of the name
        let Ok(ascii) = idna::domain_to_ascii_strict(domain) else {
            result.add_warning(ValidationWarning::new(format!(
                "ACME domain {:?} is not a valid domain name",
                domain
            )));
            continue;
        };
        let path = dir.join(ascii);
        if !path.exists() {
            continue;
        }

        match check_certificate_file(&path, threshold) {
            Ok(Some(warning)) => result.add_warning(warning),
            Ok(None) => {}
            Err(e) => result.add_error(e),
        }
    }

    result
}

/// Load the first certificate of a PEM bundle and check its expiry
fn check_certificate_file(
    path: &Path,
    threshold: Duration,
) -> Result<Option<ValidationWarning>, ValidationError> {
    let bundle = std::fs::read(path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", path, e),
        )
    })?;

    let blocks = pem::parse_many(&bundle).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", path, e),
        )
    })?;

    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| {
            ValidationError::new(
                ErrorCategory::Certificate,
                format!("No certificate in {:?}", path),
            )
        })?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", path, e),
        )
    })?;

    let not_after = cert.validity().not_after.timestamp().max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);
    let now = SystemTime::now();

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Certificate expired: {:?} (expired at {})",
                path,
                cert.validity().not_after
            ),
        ));
    }

    if expiry_time < now + threshold {
        return Ok(Some(ValidationWarning::new(format!(
            "Certificate will be renewed on first use: {:?} (expires at {})",
            path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_cert(dir: &Path, domain: &str, year: i32) {
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(1999, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let bundle = format!("{}{}", key.serialize_pem(), cert.pem());
        std::fs::write(dir.join(domain), bundle).unwrap();
    }

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::default();
        config.certificates.cache_directory = dir.to_path_buf();
        config.certificates.acme_domains = vec!["example.com".to_string()];
        config
    }

    #[test]
    fn test_expired_certificate_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "example.com", 2000);

        let result = validate_cached_certificates(&config_for(dir.path()));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("Certificate expired"));
    }

    #[test]
    fn test_valid_certificate_passes() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "example.com", 2090);

        let result = validate_cached_certificates(&config_for(dir.path()));
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_certificate_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate_cached_certificates(&config_for(dir.path()));
        assert!(result.is_valid());
    }

    #[test]
    fn test_garbage_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("example.com"), b"not pem").unwrap();

        let result = validate_cached_certificates(&config_for(dir.path()));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_idn_domain_checked_under_ascii_name() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "xn--bcher-kva.example", 2000);

        let mut config = config_for(dir.path());
        config.certificates.acme_domains = vec!["Bücher.example".to_string()];

        let result = validate_cached_certificates(&config);
        assert_eq!(result.errors.len(), 1);
    }
}
