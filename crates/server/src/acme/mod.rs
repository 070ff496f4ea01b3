//! ACME automatic certificate management
//!
//! Certificates for ACME-whitelisted domains are obtained from Let's Encrypt
//! on first use and renewed when they approach the refresh threshold.
//!
//! # Challenge Flow
//!
//! 1. The [`CertificateResolver`](crate::CertificateResolver) calls
//!    [`AcmeDelegate::obtain_or_renew`] during a TLS handshake
//! 2. A stored certificate far enough from expiry is returned as-is
//! 3. Otherwise [`InstantAcmeDelegate`] places an order and registers the
//!    HTTP-01 token with the [`ChallengeManager`]
//! 4. The CA fetches `/.well-known/acme-challenge/<token>` from the plain
//!    HTTP listener
//! 5. The order is finalized and the bundle is written back to the cache

mod challenge;
mod client;
mod error;

pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{
    parse_bundle, AcmeDelegate, InstantAcmeDelegate, ACCOUNT_CACHE_KEY, RENEWAL_MARGIN,
};
pub use error::AcmeError;
