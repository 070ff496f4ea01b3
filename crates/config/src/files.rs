//! Static file and jail configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Static file serving
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FilesConfig {
    /// Root holding one directory per domain
    pub web_root: PathBuf,

    /// Files above this size are never held in memory
    pub max_cacheable_file_size: u64,

    /// Consult the disk for files missing from (or stale in) the cache
    pub serve_files_not_in_cache: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("www"),
            max_cacheable_file_size: 10 * 1024 * 1024,
            serve_files_not_in_cache: true,
        }
    }
}

/// Privilege drop of the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct JailConfig {
    pub enabled: bool,

    /// New root directory of the worker
    pub directory: PathBuf,

    /// Account to switch to; `nobody` and then uid/gid 65534 are tried next
    pub user: String,

    /// Make the web root read-only (directories 0555, files 0444) before jailing
    pub lock_permissions: bool,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("www"),
            user: "www".to_string(),
            lock_permissions: true,
        }
    }
}
