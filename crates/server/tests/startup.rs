//! Startup ordering: listeners bind first, serve only after release, and the
//! worker serves from its preloaded cache once the web root is out of reach.
//! Binding and the privilege drop need no runtime, so every runtime thread
//! starts out restricted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use warden_config::Config;
use warden_server::certs::CacheError;
use warden_server::jail::{JailError, JailOutcome};
use warden_server::{
    CertCache, ChallengeManager, DomainWhitelist, Handlers, Listeners, PrivilegeDrop,
    StaticFiles, TlsAcceptor, Worker,
};

/// Cache that never has anything
struct EmptyCache;

#[async_trait::async_trait]
impl CertCache for EmptyCache {
    async fn get(&self, _name: &str) -> Result<bytes::Bytes, CacheError> {
        Err(CacheError::CacheMiss)
    }

    async fn put(&self, _name: &str, _data: bytes::Bytes) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Pretends to chroot into `jail`.
struct FakeJail {
    jail: PathBuf,
    calls: AtomicUsize,
}

impl PrivilegeDrop for FakeJail {
    fn drop_privileges(&self) -> Result<JailOutcome, JailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JailOutcome::Jailed {
            jail: self.jail.clone(),
        })
    }
}

/// Accepts the worker's self-signed certificate.
#[derive(Debug)]
struct AcceptAny(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> TlsConnector {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny(provider)))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn test_config(web_root: PathBuf) -> Config {
    let mut config = Config::default();
    config.server.http_address = "127.0.0.1:0".to_string();
    config.server.https_address = "127.0.0.1:0".to_string();
    config.server.graceful_shutdown_timeout_secs = 1;
    config.certificates.rsa_key_bits = 2048;
    config.files.web_root = web_root;
    config
}

async fn send_request(addr: SocketAddr, request: &str) -> String {
    exchange(TcpStream::connect(addr).await.unwrap(), request).await
}

async fn send_tls_request(addr: SocketAddr, request: &str) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::IpAddress(addr.ip().into());
    let tls = tls_connector().connect(name, tcp).await.unwrap();
    exchange(tls, request).await
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_listeners_serve_only_after_release() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path().to_path_buf());

    let whitelist = Arc::new(DomainWhitelist::from_config(&config.certificates));
    let files = Arc::new(StaticFiles::from_config(&config, Arc::clone(&whitelist)).unwrap());
    let worker = Worker::new(&config, Arc::new(EmptyCache)).unwrap();
    let handlers = Arc::new(Handlers {
        files,
        challenges: ChallengeManager::new(),
        tls: TlsAcceptor::new(Arc::clone(worker.resolver())),
        request_timeout: Duration::from_secs(5),
        graceful_shutdown_timeout: Duration::from_secs(1),
        log_requests: true,
    });

    let listeners = Listeners::bind(&config.server, handlers).unwrap();
    let http_addr = listeners.http_addr();

    // The kernel accepts into the backlog, but nothing answers yet
    let mut early = TcpStream::connect(http_addr).await.unwrap();
    early
        .write_all(b"GET /docs HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let pending = tokio::time::timeout(Duration::from_millis(200), early.read(&mut buf)).await;
    assert!(pending.is_err(), "listener answered before release");

    let handle = listeners.release();

    let mut response = Vec::new();
    early.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 302"), "{}", response);
    assert!(response.contains("https://example.com/docs"));

    handle.shutdown().await;
}

#[test]
fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path().to_path_buf());
    config.server.https_address = taken.local_addr().unwrap().to_string();

    let worker = Worker::new(&config, Arc::new(EmptyCache)).unwrap();
    let jail = FakeJail {
        jail: temp_dir.path().to_path_buf(),
        calls: AtomicUsize::new(0),
    };

    let result = worker.prepare(&config.server, &jail);
    assert!(result.is_err());
    assert_eq!(jail.calls.load(Ordering::SeqCst), 0, "privileges dropped after failed bind");
}

#[tokio::test]
async fn test_worker_serves_cached_files_after_jail() {
    let temp_dir = TempDir::new().unwrap();
    let web_root = temp_dir.path().join("www");
    std::fs::create_dir_all(web_root.join("nodomain")).unwrap();
    std::fs::write(web_root.join("nodomain/index.html"), b"cached page").unwrap();

    let config = test_config(web_root.clone());
    let worker = Worker::new(&config, Arc::new(EmptyCache)).unwrap();
    // The web root maps to /www, which does not exist on the host
    let jail = FakeJail {
        jail: temp_dir.path().canonicalize().unwrap(),
        calls: AtomicUsize::new(0),
    };

    let sockets = worker.prepare(&config.server, &jail).unwrap();
    let handle = worker.serve(sockets).unwrap();
    assert_eq!(jail.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*worker.files().root(), PathBuf::from("/www"));
    assert_eq!(worker.files().cached_count(), 1);

    let response = send_request(
        handle.http_addr(),
        "GET /.well-known/acme-challenge/unknown HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

    // No SNI and no Host: certificate for the local IP, files from nodomain
    let response = send_tls_request(
        handle.https_addr(),
        "GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("cached page"), "{}", response);
    assert!(worker.resolver().peek("127.0.0.1").is_some());

    handle.shutdown().await;
}

/// Sets `no_new_privs` on the calling thread, like the real jail does.
#[cfg(target_os = "linux")]
struct NoNewPrivsJail;

#[cfg(target_os = "linux")]
impl PrivilegeDrop for NoNewPrivsJail {
    fn drop_privileges(&self) -> Result<JailOutcome, JailError> {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        assert_eq!(rc, 0);
        Ok(JailOutcome::Skipped)
    }
}

#[cfg(target_os = "linux")]
fn no_new_privs() -> i32 {
    unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) }
}

#[cfg(target_os = "linux")]
#[test]
fn test_runtime_threads_inherit_privilege_drop() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path().to_path_buf());

    // Runs on a fresh thread so the flag does not leak into other tests
    std::thread::spawn(move || {
        let worker = Worker::new(&config, Arc::new(EmptyCache)).unwrap();
        let sockets = worker.prepare(&config.server, &NoNewPrivsJail).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let handle = worker.serve(sockets).unwrap();

            for _ in 0..8 {
                assert_eq!(tokio::spawn(async { no_new_privs() }).await.unwrap(), 1);
            }
            assert_eq!(tokio::task::spawn_blocking(no_new_privs).await.unwrap(), 1);

            let response = send_request(
                handle.http_addr(),
                "GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 302"), "{}", response);

            handle.shutdown().await;
        });
    })
    .join()
    .unwrap();
}
