//! Server name validation and the domain whitelists
//!
//! Every name that reaches the certificate engine or the file server goes
//! through [`to_ascii`] first, so `EXAMPLE.com`, `example.com` and the
//! Unicode form of an IDN all map to the same key.

use std::collections::HashSet;
use std::net::IpAddr;

use tracing::{debug, warn};
use warden_config::CertificateConfig;

use crate::certs::CertificateError;

/// Normalize a server name to its ASCII form.
///
/// Uses UTS #46 non-transitional processing with STD3 rules, so names that
/// differ only in final sigma stay distinct. IP literals (with or without
/// IPv6 brackets) are returned in canonical form.
pub fn to_ascii(raw: &str) -> Result<String, CertificateError> {
    if raw.is_empty() {
        return Err(CertificateError::InvalidDomain(String::new()));
    }

    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    idna::domain_to_ascii_strict(raw).map_err(|_| CertificateError::InvalidDomain(raw.to_string()))
}

/// Domains allowed to receive certificates and files.
///
/// Built once at startup and never mutated. The ACME set is always contained
/// in the self-signed set.
#[derive(Debug, Clone, Default)]
pub struct DomainWhitelist {
    acme: HashSet<String>,
    self_signed: HashSet<String>,
}

impl DomainWhitelist {
    /// Build the whitelists from raw names. Invalid entries are skipped with
    /// a warning.
    pub fn new<A, S>(acme: A, self_signed: S) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let acme: HashSet<String> = acme.into_iter().filter_map(|d| normalize(d.as_ref())).collect();

        let mut self_signed: HashSet<String> = self_signed
            .into_iter()
            .filter_map(|d| normalize(d.as_ref()))
            .collect();
        self_signed.extend(acme.iter().cloned());

        debug!(
            acme = acme.len(),
            self_signed = self_signed.len(),
            "Built domain whitelist"
        );

        Self { acme, self_signed }
    }

    pub fn from_config(config: &CertificateConfig) -> Self {
        Self::new(&config.acme_domains, &config.self_signed_domains)
    }

    /// Whether an ASCII name may be issued a certificate by ACME
    pub fn allows_acme(&self, ascii: &str) -> bool {
        self.acme.contains(ascii)
    }

    /// Whether an ASCII name may be served at all
    pub fn allows(&self, ascii: &str) -> bool {
        self.self_signed.contains(ascii)
    }

    /// Validate a raw name and check it against the whitelist.
    pub fn check(&self, raw: &str) -> Result<String, CertificateError> {
        let ascii = to_ascii(raw)?;
        if self.allows(&ascii) {
            Ok(ascii)
        } else {
            Err(CertificateError::NotWhitelisted(ascii))
        }
    }

    /// All domains, ACME ones included
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.self_signed.iter().map(String::as_str)
    }
}

fn normalize(raw: &str) -> Option<String> {
    match to_ascii(raw) {
        Ok(ascii) => Some(ascii),
        Err(e) => {
            warn!(domain = %raw, error = %e, "Ignoring invalid whitelist entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_case_folding() {
        assert_eq!(to_ascii("EXAMPLE.com").unwrap(), "example.com");
    }

    #[test]
    fn test_idn_converted_to_punycode() {
        assert_eq!(to_ascii("bücher.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_final_sigma_kept_distinct() {
        let final_sigma = to_ascii("βόλος.com").unwrap();
        let sigma = to_ascii("βόλοσ.com").unwrap();
        assert_ne!(final_sigma, sigma);
    }

    #[test]
    fn test_empty_and_invalid_names() {
        assert!(matches!(to_ascii(""), Err(CertificateError::InvalidDomain(_))));
        assert!(matches!(
            to_ascii("exa mple.com"),
            Err(CertificateError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_ip_literals() {
        assert_eq!(to_ascii("127.0.0.1").unwrap(), "127.0.0.1");
        assert_eq!(to_ascii("[::1]").unwrap(), "::1");
    }

    #[test]
    fn test_acme_domains_unioned_into_self_signed() {
        let whitelist = DomainWhitelist::new(["Example.com"], ["localhost"]);

        assert!(whitelist.allows_acme("example.com"));
        assert!(whitelist.allows("example.com"));
        assert!(whitelist.allows("localhost"));
        assert!(!whitelist.allows_acme("localhost"));
        assert_eq!(whitelist.domains().count(), 2);
    }

    #[test]
    fn test_check() {
        let whitelist = DomainWhitelist::new(Vec::<String>::new(), ["localhost"]);

        assert_eq!(whitelist.check("LOCALHOST").unwrap(), "localhost");
        assert!(matches!(
            whitelist.check("other.org"),
            Err(CertificateError::NotWhitelisted(name)) if name == "other.org"
        ));
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let whitelist = DomainWhitelist::new(["", "good.org"], ["bad name"]);
        assert_eq!(whitelist.domains().collect::<Vec<_>>(), vec!["good.org"]);
    }

    proptest! {
        #[test]
        fn prop_to_ascii_is_idempotent(label in "[a-zA-Z][a-zA-Z0-9]{0,19}", tld in "[a-zA-Z]{2,6}") {
            let name = format!("{}.{}", label, tld);
            if let Ok(ascii) = to_ascii(&name) {
                prop_assert_eq!(&ascii, &name.to_ascii_lowercase());
                prop_assert_eq!(to_ascii(&ascii).unwrap(), ascii);
            }
        }
    }
}
