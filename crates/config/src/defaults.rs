//! Default embedded configuration.
//!
//! Used when no configuration file is given: plain HTTP on port 80,
//! HTTPS on port 443, self-signed certificates for localhost only, and the
//! worker jailed into the web root.

/// Embedded default configuration in KDL format
pub const DEFAULT_CONFIG_KDL: &str = r#"
// Warden Default Configuration

server {
    http-address "0.0.0.0:80"
    https-address "0.0.0.0:443"
    request-timeout-secs 60
    graceful-shutdown-timeout-secs 10
    log-requests #false
}

certificates {
    // acme-domains "example.com" "www.example.com"
    // acme-email "admin@example.com"
    self-signed-domains "localhost" "127.0.0.1"
    cache-directory "certs"
    refresh-threshold-secs 86400
    self-signed-margin-days 14
    rsa-key-bits 4096
    channel-timeout-secs 5
    acme-timeout-secs 30
}

files {
    web-root "www"
    max-cacheable-file-size 10485760
    serve-files-not-in-cache #true
}

jail {
    enabled #true
    directory "www"
    user "www"
    lock-permissions #true
}

logging {
    level "info"
    format "pretty"
}
"#;
