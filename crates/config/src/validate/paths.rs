//! Directory checks for the web root, jail, and certificate store.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

pub fn validate_paths(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if !config.files.web_root.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Filesystem,
            format!("Web root not found: {:?}", config.files.web_root),
        ));
    }

    if config.jail.enabled && !config.jail.directory.exists() {
        result.add_warning(ValidationWarning::new(format!(
            "Jail directory {:?} does not exist and will be created",
            config.jail.directory
        )));
    }

    let cache_dir = &config.certificates.cache_directory;
    if cache_dir.exists() && !cache_dir.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Filesystem,
            format!("Certificate cache path is not a directory: {:?}", cache_dir),
        ));
    }

    result
}
