//! Section parsers for the KDL configuration format.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::certificates::CertificateConfig;
use crate::files::{FilesConfig, JailConfig};
use crate::server::{HeadersConfig, LogFormat, LoggingConfig, ServerConfig};

use super::helpers::{
    get_bool_entry, get_string_entry, get_string_list_entry, get_u64_entry,
};

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");
    let defaults = ServerConfig::default();

    let config = ServerConfig {
        http_address: get_string_entry(node, "http-address").unwrap_or(defaults.http_address),
        https_address: get_string_entry(node, "https-address").unwrap_or(defaults.https_address),
        request_timeout_secs: get_u64_entry(node, "request-timeout-secs")?
            .unwrap_or(defaults.request_timeout_secs),
        graceful_shutdown_timeout_secs: get_u64_entry(node, "graceful-shutdown-timeout-secs")?
            .unwrap_or(defaults.graceful_shutdown_timeout_secs),
        log_requests: get_bool_entry(node, "log-requests").unwrap_or(defaults.log_requests),
    };

    trace!(
        http = %config.http_address,
        https = %config.https_address,
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse certificates configuration block
pub fn parse_certificates_config(node: &kdl::KdlNode) -> Result<CertificateConfig> {
    trace!("Parsing certificates configuration block");
    let defaults = CertificateConfig::default();

    let rsa_key_bits = match get_u64_entry(node, "rsa-key-bits")? {
        Some(bits) => u32::try_from(bits)
            .map_err(|_| anyhow::anyhow!("rsa-key-bits {} out of range", bits))?,
        None => defaults.rsa_key_bits,
    };

    let config = CertificateConfig {
        acme_domains: get_string_list_entry(node, "acme-domains").unwrap_or(defaults.acme_domains),
        self_signed_domains: get_string_list_entry(node, "self-signed-domains")
            .unwrap_or(defaults.self_signed_domains),
        cache_directory: get_string_entry(node, "cache-directory")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_directory),
        refresh_threshold_secs: get_u64_entry(node, "refresh-threshold-secs")?
            .unwrap_or(defaults.refresh_threshold_secs),
        self_signed_margin_days: get_u64_entry(node, "self-signed-margin-days")?
            .unwrap_or(defaults.self_signed_margin_days),
        rsa_key_bits,
        acme_email: get_string_entry(node, "acme-email"),
        acme_staging: get_bool_entry(node, "acme-staging").unwrap_or(defaults.acme_staging),
        channel_timeout_secs: get_u64_entry(node, "channel-timeout-secs")?
            .unwrap_or(defaults.channel_timeout_secs),
        acme_timeout_secs: get_u64_entry(node, "acme-timeout-secs")?
            .unwrap_or(defaults.acme_timeout_secs),
    };

    trace!(
        acme_domains = config.acme_domains.len(),
        self_signed_domains = config.self_signed_domains.len(),
        refresh_threshold_secs = config.refresh_threshold_secs,
        "Parsed certificates configuration"
    );

    Ok(config)
}

/// Parse files configuration block
pub fn parse_files_config(node: &kdl::KdlNode) -> Result<FilesConfig> {
    trace!("Parsing files configuration block");
    let defaults = FilesConfig::default();

    Ok(FilesConfig {
        web_root: get_string_entry(node, "web-root")
            .map(PathBuf::from)
            .unwrap_or(defaults.web_root),
        max_cacheable_file_size: get_u64_entry(node, "max-cacheable-file-size")?
            .unwrap_or(defaults.max_cacheable_file_size),
        serve_files_not_in_cache: get_bool_entry(node, "serve-files-not-in-cache")
            .unwrap_or(defaults.serve_files_not_in_cache),
    })
}

/// Parse jail configuration block
pub fn parse_jail_config(node: &kdl::KdlNode) -> Result<JailConfig> {
    trace!("Parsing jail configuration block");
    let defaults = JailConfig::default();

    Ok(JailConfig {
        enabled: get_bool_entry(node, "enabled").unwrap_or(defaults.enabled),
        directory: get_string_entry(node, "directory")
            .map(PathBuf::from)
            .unwrap_or(defaults.directory),
        user: get_string_entry(node, "user").unwrap_or(defaults.user),
        lock_permissions: get_bool_entry(node, "lock-permissions")
            .unwrap_or(defaults.lock_permissions),
    })
}

/// Parse headers configuration block
pub fn parse_headers_config(node: &kdl::KdlNode) -> Result<HeadersConfig> {
    trace!("Parsing headers configuration block");
    let d = HeadersConfig::default();

    Ok(HeadersConfig {
        server: get_string_entry(node, "server").unwrap_or(d.server),
        x_content_type_options: get_string_entry(node, "x-content-type-options")
            .unwrap_or(d.x_content_type_options),
        strict_transport_security: get_string_entry(node, "strict-transport-security")
            .unwrap_or(d.strict_transport_security),
        content_security_policy: get_string_entry(node, "content-security-policy")
            .unwrap_or(d.content_security_policy),
        x_frame_options: get_string_entry(node, "x-frame-options").unwrap_or(d.x_frame_options),
        x_xss_protection: get_string_entry(node, "x-xss-protection").unwrap_or(d.x_xss_protection),
        referrer_policy: get_string_entry(node, "referrer-policy").unwrap_or(d.referrer_policy),
        permissions_policy: get_string_entry(node, "permissions-policy")
            .unwrap_or(d.permissions_policy),
    })
}

/// Parse logging configuration block
pub fn parse_logging_config(node: &kdl::KdlNode) -> Result<LoggingConfig> {
    let defaults = LoggingConfig::default();

    let format = match get_string_entry(node, "format") {
        Some(s) => LogFormat::from_str_loose(&s).ok_or_else(|| {
            anyhow::anyhow!("Invalid log format '{}'. Valid formats: pretty, json", s)
        })?,
        None => defaults.format,
    };

    Ok(LoggingConfig {
        level: get_string_entry(node, "level").unwrap_or(defaults.level),
        format,
    })
}
