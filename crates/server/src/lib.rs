//! Warden server library
//!
//! A self-hosted HTTPS static file server that manages its own certificates
//! and isolates itself from the host after startup.
//!
//! The binary runs as two processes:
//!
//! - **Supervisor**: stays unjailed, owns the on-disk certificate store and
//!   answers cache commands from the worker ([`supervisor`]).
//! - **Worker**: binds the listeners, drops privileges, and serves HTTP and
//!   HTTPS ([`worker`]). Certificates are resolved per handshake by the
//!   [`CertificateResolver`], which reaches the supervisor's store through a
//!   [`RemoteCache`].
//!
//! Both halves talk over the line-framed command channel from
//! `warden-protocol`.

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod certs;
pub mod domain;
pub mod http;
pub mod jail;
pub mod logging;
pub mod server;
pub mod supervisor;
pub mod tls;
pub mod worker;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificates
pub use certs::{
    CacheError, CertCache, CertificateError, CertificateResolver, DirCache, IssuedCertificate,
    RemoteCache, SelfSignedIssuer,
};

// Domains
pub use domain::DomainWhitelist;

// ACME
pub use acme::{AcmeDelegate, AcmeError, ChallengeManager, InstantAcmeDelegate};

// Serving
pub use http::StaticFiles;
pub use server::{BoundSockets, Handlers, Listeners, ServeHandle};
pub use tls::TlsAcceptor;

// Processes
pub use jail::{Jail, JailError, NoJail, PrivilegeDrop};
pub use supervisor::Supervisor;
pub use worker::Worker;
