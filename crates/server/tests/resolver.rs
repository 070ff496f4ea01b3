//! Certificate resolution with a stub ACME delegate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use warden_server::certs::not_after;
use warden_server::{
    AcmeDelegate, AcmeError, CertificateError, CertificateResolver, DomainWhitelist,
    IssuedCertificate, SelfSignedIssuer,
};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86400);

/// Certificate for `domain` expiring at `expires` (whole seconds).
fn certificate(domain: &str, expires: SystemTime) -> IssuedCertificate {
    let secs = expires.duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(secs - 90 * 86400).unwrap();
    params.not_after = time::OffsetDateTime::from_unix_timestamp(secs).unwrap();

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    IssuedCertificate {
        chain: vec![cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    }
}

fn whole_seconds(time: SystemTime) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(time.duration_since(UNIX_EPOCH).unwrap().as_secs())
}

/// Delegate returning certificates with a configurable expiry.
struct StubDelegate {
    calls: AtomicUsize,
    expires: Mutex<Option<SystemTime>>,
    delay: Duration,
}

impl StubDelegate {
    fn new(expires: Option<SystemTime>) -> Arc<Self> {
        Self::with_delay(expires, Duration::ZERO)
    }

    fn with_delay(expires: Option<SystemTime>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            expires: Mutex::new(expires),
            delay,
        })
    }

    fn set_expiry(&self, expires: SystemTime) {
        *self.expires.lock().unwrap() = Some(expires);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcmeDelegate for StubDelegate {
    async fn obtain_or_renew(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let expires = *self.expires.lock().unwrap();
        match expires {
            Some(expires) => Ok(certificate(domain, expires)),
            None => Err(AcmeError::Timeout("stub".to_string())),
        }
    }
}

/// Delegate whose provider never answers.
#[derive(Default)]
struct HangingDelegate {
    calls: AtomicUsize,
}

#[async_trait]
impl AcmeDelegate for HangingDelegate {
    async fn obtain_or_renew(&self, _domain: &str) -> Result<IssuedCertificate, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

fn hanging_resolver(delegate: Arc<HangingDelegate>) -> CertificateResolver {
    let whitelist = Arc::new(DomainWhitelist::new(["example.com"], ["localhost"]));
    let issuer = SelfSignedIssuer::new(Arc::clone(&whitelist), HOUR, DAY, 2048);
    let delegate: Arc<dyn AcmeDelegate> = delegate;
    CertificateResolver::new(whitelist, issuer, Some(delegate), HOUR)
        .with_acme_timeout(Duration::from_millis(100))
}

fn resolver(delegate: Arc<StubDelegate>) -> CertificateResolver {
    let whitelist = Arc::new(DomainWhitelist::new(["example.com"], ["localhost"]));
    let issuer = SelfSignedIssuer::new(Arc::clone(&whitelist), HOUR, DAY, 2048);
    let delegate: Arc<dyn AcmeDelegate> = delegate;
    CertificateResolver::new(whitelist, issuer, Some(delegate), HOUR)
}

#[tokio::test]
async fn test_fresh_entry_is_served_from_cache() {
    let delegate = StubDelegate::new(Some(SystemTime::now() + 90 * DAY));
    let resolver = resolver(Arc::clone(&delegate));

    let first = resolver.resolve("example.com").await.unwrap();
    let second = resolver.resolve("EXAMPLE.com").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.cert, second.cert);
    assert_eq!(delegate.calls(), 1);
}

#[tokio::test]
async fn test_expiry_boundary() {
    let expires = whole_seconds(SystemTime::now() + 30 * DAY);
    let delegate = StubDelegate::new(Some(expires));
    let resolver = resolver(Arc::clone(&delegate));

    resolver
        .resolve_at("example.com", expires - 10 * DAY)
        .await
        .unwrap();
    assert_eq!(delegate.calls(), 1);

    // One second more than the threshold left: still fresh
    resolver
        .resolve_at("example.com", expires - HOUR - Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(delegate.calls(), 1);

    // Exactly the threshold left: refreshed
    resolver.resolve_at("example.com", expires - HOUR).await.unwrap();
    assert_eq!(delegate.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_refresh_leaves_one_fresh_entry() {
    let now = SystemTime::now();
    let delegate = StubDelegate::with_delay(Some(now + HOUR / 2), Duration::from_millis(50));
    let resolver = Arc::new(resolver(Arc::clone(&delegate)));

    // Cached, but already inside the refresh window
    resolver.resolve("example.com").await.unwrap();
    assert_eq!(delegate.calls(), 1);

    delegate.set_expiry(now + 90 * DAY);
    let (a, b) = tokio::join!(
        resolver.resolve("example.com"),
        resolver.resolve("example.com")
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    assert_eq!(resolver.cached_count(), 1);
    let cached = resolver.peek("example.com").unwrap();
    let expiry = not_after(&cached.cert[0]).unwrap();
    assert!(expiry > SystemTime::now() + HOUR);
}

#[tokio::test]
async fn test_acme_failure_falls_back_to_self_signed() {
    let delegate = StubDelegate::new(None);
    let resolver = resolver(Arc::clone(&delegate));

    let key = resolver.resolve("example.com").await.unwrap();
    assert_eq!(delegate.calls(), 1);

    let (_, cert) = x509_parser::parse_x509_certificate(&key.cert[0]).unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "example.com");

    // The fallback is cached like any other entry
    let again = resolver.resolve("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&key, &again));
    assert_eq!(delegate.calls(), 1);
}

#[tokio::test]
async fn test_self_signed_only_domain_skips_acme() {
    let delegate = StubDelegate::new(Some(SystemTime::now() + 90 * DAY));
    let resolver = resolver(Arc::clone(&delegate));

    resolver.resolve("localhost").await.unwrap();
    assert_eq!(delegate.calls(), 0);
}

#[tokio::test]
async fn test_unlisted_domain_never_reaches_issuers() {
    let delegate = StubDelegate::new(Some(SystemTime::now() + 90 * DAY));
    let resolver = resolver(Arc::clone(&delegate));

    let result = resolver.resolve("unlisted.example").await;
    assert!(matches!(result, Err(CertificateError::NotWhitelisted(_))));
    assert_eq!(delegate.calls(), 0);
    assert_eq!(resolver.cached_count(), 0);
}

#[tokio::test]
async fn test_hung_acme_falls_back_to_self_signed() {
    let delegate = Arc::new(HangingDelegate::default());
    let resolver = hanging_resolver(Arc::clone(&delegate));

    let key = tokio::time::timeout(Duration::from_secs(10), resolver.resolve("example.com"))
        .await
        .expect("resolution waited on the ACME provider")
        .unwrap();
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);

    let (_, cert) = x509_parser::parse_x509_certificate(&key.cert[0]).unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "example.com");
}

#[tokio::test]
async fn test_warm_is_not_held_up_by_a_hung_domain() {
    let delegate = Arc::new(HangingDelegate::default());
    let resolver = Arc::new(hanging_resolver(delegate));

    tokio::time::timeout(Duration::from_secs(10), Arc::clone(&resolver).warm())
        .await
        .expect("warm-up did not finish");
    assert!(resolver.peek("localhost").is_some());
    assert!(resolver.peek("example.com").is_some());
}
