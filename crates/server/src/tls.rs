//! TLS acceptor backed by the certificate resolver
//!
//! rustls resolves certificates synchronously, while resolution may need to
//! wait on ACME or the supervisor. The acceptor therefore reads the
//! ClientHello first, resolves the certificate asynchronously, and only then
//! continues the handshake with a config that serves exactly that key.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, trace};

use crate::certs::{CertificateError, CertificateResolver};

/// ALPN protocols offered to clients
const ALPN_PROTOCOLS: &[&[u8]] = &[b"http/1.1"];

/// TLS handshake errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("Client sent no server name")]
    MissingServerName,

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

/// Serves the single certificate chosen for this connection.
#[derive(Debug)]
struct ResolvedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Accepts TLS connections, resolving certificates per handshake.
#[derive(Clone)]
pub struct TlsAcceptor {
    resolver: Arc<CertificateResolver>,
    provider: Arc<CryptoProvider>,
}

impl TlsAcceptor {
    pub fn new(resolver: Arc<CertificateResolver>) -> Self {
        Self {
            resolver,
            provider: Arc::new(aws_lc_rs::default_provider()),
        }
    }

    pub fn resolver(&self) -> &Arc<CertificateResolver> {
        &self.resolver
    }

    /// Complete a handshake on `io`.
    ///
    /// Clients connecting by IP address send no SNI; `local_ip` then stands
    /// in for the server name so that IP literals can still be whitelisted.
    pub async fn accept<IO>(
        &self,
        io: IO,
        local_ip: Option<IpAddr>,
    ) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;

        let server_name = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            None => local_ip
                .map(|ip| ip.to_canonical().to_string())
                .ok_or(TlsError::MissingServerName)?,
        };
        trace!(server_name = %server_name, "Received ClientHello");

        let key = self.resolver.resolve(&server_name).await.inspect_err(|e| {
            debug!(server_name = %server_name, error = %e, "No certificate for handshake");
        })?;

        let config = self.server_config(key)?;
        Ok(start.into_stream(config).await?)
    }

    fn server_config(&self, key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, rustls::Error> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ResolvedCert(key)));
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::SelfSignedIssuer;
    use crate::domain::DomainWhitelist;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::time::Duration;
    use tokio_rustls::TlsConnector;

    /// Accepts any server certificate; the tests only inspect what was sent.
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

    fn acceptor() -> TlsAcceptor {
        let hour = Duration::from_secs(3600);
        let whitelist = Arc::new(DomainWhitelist::new(
            Vec::<String>::new(),
            ["localhost", "127.0.0.1"],
        ));
        let issuer = SelfSignedIssuer::new(Arc::clone(&whitelist), hour, hour, 2048);
        TlsAcceptor::new(Arc::new(CertificateResolver::new(whitelist, issuer, None, hour)))
    }

    fn connector() -> TlsConnector {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAny(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsConnector::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_handshake_with_self_signed_certificate() {
        let acceptor = acceptor();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move { acceptor.accept(server_io, None).await });
        let name = ServerName::try_from("LocalHost").unwrap();
        let client = connector().connect(name, client_io).await.unwrap();

        let (_, session) = client.get_ref();
        assert_eq!(session.alpn_protocol(), Some(&b"http/1.1"[..]));
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ip_without_sni_uses_local_address() {
        let acceptor = acceptor();
        let resolver = Arc::clone(acceptor.resolver());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let local_ip: IpAddr = "127.0.0.1".parse().unwrap();
        let server = tokio::spawn(async move { acceptor.accept(server_io, Some(local_ip)).await });
        let name = ServerName::try_from("127.0.0.1").unwrap();
        connector().connect(name, client_io).await.unwrap();

        assert!(server.await.unwrap().is_ok());
        assert!(resolver.peek("127.0.0.1").is_some());
    }

    #[tokio::test]
    async fn test_unlisted_name_fails_handshake() {
        let acceptor = acceptor();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let name = ServerName::try_from("example.org").unwrap();
        let connector = connector();
        let (server, client) = tokio::join!(
            acceptor.accept(server_io, None),
            connector.connect(name, client_io)
        );

        assert!(matches!(
            server,
            Err(TlsError::Certificate(CertificateError::NotWhitelisted(_)))
        ));
        assert!(client.is_err());
    }
}
