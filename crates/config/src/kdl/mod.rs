//! KDL configuration parsing.

mod helpers;
mod sections;

use anyhow::Result;
use tracing::{debug, warn};

use crate::Config;

pub(crate) use helpers::offset_to_line_col;

/// Build a [`Config`] from a parsed KDL document.
///
/// Unknown top-level nodes are logged and ignored.
pub(crate) fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => config.server = sections::parse_server_config(node)?,
            "certificates" => config.certificates = sections::parse_certificates_config(node)?,
            "files" => config.files = sections::parse_files_config(node)?,
            "jail" => config.jail = sections::parse_jail_config(node)?,
            "headers" => config.headers = sections::parse_headers_config(node)?,
            "logging" => config.logging = sections::parse_logging_config(node)?,
            other => warn!(node = other, "Ignoring unknown configuration block"),
        }
    }

    debug!("Parsed KDL configuration");
    Ok(config)
}
