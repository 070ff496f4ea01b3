//! Server, response header, and logging configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::validation::validate_socket_addr;

// ============================================================================
// Server Configuration
// ============================================================================

/// Listener addresses and connection handling
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Plain HTTP listener (redirects and ACME challenges)
    #[validate(custom(function = "validate_socket_addr"))]
    pub http_address: String,

    /// HTTPS listener serving files
    #[validate(custom(function = "validate_socket_addr"))]
    pub https_address: String,

    /// Upper bound for reading a request and writing its response
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Grace period for in-flight connections on shutdown
    #[validate(range(min = 1))]
    pub graceful_shutdown_timeout_secs: u64,

    /// Log one line per served request
    pub log_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_address: default_http_address(),
            https_address: default_https_address(),
            request_timeout_secs: default_request_timeout(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
            log_requests: false,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

pub(crate) fn default_http_address() -> String {
    "0.0.0.0:80".to_string()
}

pub(crate) fn default_https_address() -> String {
    "0.0.0.0:443".to_string()
}

pub(crate) fn default_request_timeout() -> u64 {
    60
}

pub(crate) fn default_graceful_shutdown_timeout() -> u64 {
    10
}

// ============================================================================
// Response Headers
// ============================================================================

/// Headers added to every file response. An empty value disables the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HeadersConfig {
    pub server: String,
    pub x_content_type_options: String,
    pub strict_transport_security: String,
    pub content_security_policy: String,
    pub x_frame_options: String,
    pub x_xss_protection: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            server: "warden".to_string(),
            x_content_type_options: "nosniff".to_string(),
            strict_transport_security: "max-age=63072000; includeSubDomains".to_string(),
            content_security_policy: "default-src 'self'".to_string(),
            x_frame_options: "DENY".to_string(),
            x_xss_protection: "1; mode=block".to_string(),
            referrer_policy: "no-referrer".to_string(),
            permissions_policy: "geolocation=(), microphone=(), camera=()".to_string(),
        }
    }
}

impl HeadersConfig {
    /// Enabled headers as `(name, value)` pairs, in a stable order.
    pub fn enabled(&self) -> Vec<(&'static str, &str)> {
        [
            ("server", self.server.as_str()),
            ("x-content-type-options", self.x_content_type_options.as_str()),
            ("strict-transport-security", self.strict_transport_security.as_str()),
            ("content-security-policy", self.content_security_policy.as_str()),
            ("x-frame-options", self.x_frame_options.as_str()),
            ("x-xss-protection", self.x_xss_protection.as_str()),
            ("referrer-policy", self.referrer_policy.as_str()),
            ("permissions-policy", self.permissions_policy.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect()
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
