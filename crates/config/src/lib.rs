//! Configuration for the Warden HTTPS server
//!
//! This crate provides configuration parsing, defaults, and validation for
//! both roles of the server process: the supervisor (certificate store) and
//! the jailed worker (listeners, certificate resolution, file serving).
//!
//! # Module Organization
//!
//! - [`server`]: Listener, response header, and logging configuration
//! - [`certificates`]: Whitelists, refresh policy, and certificate store
//! - [`files`]: Static files and jail configuration
//! - [`validate`]: Deployment checks used by `warden test`
//! - `kdl`: KDL format parsing
//! - `defaults`: Default embedded configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use validator::Validate;

// ============================================================================
// Module Declarations
// ============================================================================

pub mod certificates;
mod defaults;
pub mod files;
mod kdl;
pub mod server;
pub mod validate;
mod validation;

// ============================================================================
// Re-exports
// ============================================================================

pub use certificates::{CertificateConfig, MIN_REFRESH_THRESHOLD, SUPPORTED_RSA_KEY_BITS};
pub use defaults::DEFAULT_CONFIG_KDL;
pub use files::{FilesConfig, JailConfig};
pub use server::{HeadersConfig, LogFormat, LoggingConfig, ServerConfig};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Main Configuration Structure
// ============================================================================

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub certificates: CertificateConfig,

    pub files: FilesConfig,

    pub jail: JailConfig,

    pub headers: HeadersConfig,

    pub logging: LoggingConfig,

    /// Adjustments made while loading, reported once logging is set up
    #[serde(skip)]
    notices: Vec<String>,
}

// ============================================================================
// Config Implementation
// ============================================================================

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
    }

    /// Load the default embedded configuration.
    pub fn default_embedded() -> Result<Self> {
        Self::from_kdl(DEFAULT_CONFIG_KDL).or_else(|e| {
            tracing::warn!(
                "Failed to parse embedded KDL config, using programmatic default: {}",
                e
            );
            Ok(Self::default())
        })
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            use miette::Diagnostic;

            let mut error_msg = String::new();
            error_msg.push_str("KDL configuration parse error:\n\n");

            let mut found_details = false;
            if let Some(related) = e.related() {
                for diagnostic in related {
                    error_msg.push_str(&format!("  {}\n", diagnostic));
                    found_details = true;

                    if let Some(labels) = diagnostic.labels() {
                        for label in labels {
                            let (line, col) = kdl::offset_to_line_col(content, label.offset());
                            error_msg
                                .push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                            if let Some(line_content) = content.lines().nth(line.saturating_sub(1)) {
                                error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                                error_msg.push_str(&format!(
                                    "     | {}^",
                                    " ".repeat(col.saturating_sub(1))
                                ));
                                if let Some(label_msg) = label.label() {
                                    error_msg.push_str(&format!(" {}", label_msg));
                                }
                                error_msg.push('\n');
                            }
                        }
                    }

                    if let Some(help) = diagnostic.help() {
                        error_msg.push_str(&format!("\n  Help: {}\n", help));
                    }
                }
            }

            if !found_details {
                error_msg.push_str(&format!("  {}\n", e));
            }

            anyhow::anyhow!("{}", error_msg)
        })?;

        let mut config = kdl::parse_kdl_document(doc)?;
        config.normalize();
        Ok(config)
    }

    /// Parse configuration from TOML format
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.normalize();
        Ok(config)
    }

    /// Apply load-time adjustments that are not errors.
    fn normalize(&mut self) {
        self.notices.extend(self.certificates.clamp_refresh_threshold());
    }

    /// Adjustments made while loading that deserve a warning
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;
        validation::validate_domains(self)?;
        validation::validate_key_size(self)?;
        validation::validate_timeouts(self)?;
        Ok(())
    }
}
