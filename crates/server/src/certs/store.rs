//! On-disk certificate store
//!
//! Owned by the supervisor. Each cache name maps to one file directly under
//! the store directory:
//!
//! ```text
//! certs/
//! ├── acme_account+key    # ACME account credentials (JSON)
//! ├── example.com         # private key + certificate chain (PEM)
//! └── www.example.com
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, trace};

use super::{CacheError, CertCache};

/// Filesystem-backed [`CertCache`] with restrictive permissions.
#[derive(Debug)]
pub struct DirCache {
    base_path: PathBuf,
}

impl DirCache {
    /// Open the store, creating the directory (mode 0700) if needed.
    pub fn new(base_path: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(base_path, std::fs::Permissions::from_mode(0o700))?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate store"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Map a cache name to a file, rejecting anything that could leave the
    /// store directory.
    fn entry_path(&self, name: &str) -> Result<PathBuf, CacheError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
            return Err(CacheError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cache name '{}'", name),
            )));
        }
        Ok(self.base_path.join(name))
    }
}

#[async_trait]
impl CertCache for DirCache {
    async fn get(&self, name: &str) -> Result<Bytes, CacheError> {
        let path = self.entry_path(name)?;
        match fs::read(&path).await {
            Ok(data) if data.is_empty() => Err(CacheError::CacheMiss),
            Ok(data) => {
                debug!(name = %name, bytes = data.len(), "Loaded cache entry");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(name = %name, "No stored cache entry");
                Err(CacheError::CacheMiss)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<(), CacheError> {
        if data.is_empty() {
            return Err(CacheError::EmptyPayload(name.to_string()));
        }
        let path = self.entry_path(name)?;

        // Write beside the target and rename so readers never see a partial entry.
        let tmp = self.base_path.join(format!(".{}.tmp", name));
        fs::write(&tmp, &data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, &path).await?;

        info!(name = %name, bytes = data.len(), "Saved cache entry");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), CacheError> {
        let path = self.entry_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(name = %name, "Deleted cache entry");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(name = %name, "Cache entry to delete not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, DirCache) {
        let temp_dir = TempDir::new().unwrap();
        let store = DirCache::new(&temp_dir.path().join("certs")).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_temp_dir, store) = setup_store();

        store
            .put("example.com", Bytes::from_static(b"bundle"))
            .await
            .unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), "bundle");

        store.delete("example.com").await.unwrap();
        assert!(matches!(
            store.get("example.com").await,
            Err(CacheError::CacheMiss)
        ));
    }

    #[tokio::test]
    async fn test_missing_entry_is_miss() {
        let (_temp_dir, store) = setup_store();
        assert!(matches!(
            store.get("absent.org").await,
            Err(CacheError::CacheMiss)
        ));
    }

    #[tokio::test]
    async fn test_empty_put_rejected() {
        let (_temp_dir, store) = setup_store();
        assert!(matches!(
            store.put("example.com", Bytes::new()).await,
            Err(CacheError::EmptyPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_temp_dir, store) = setup_store();
        store.delete("absent.org").await.unwrap();
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_temp_dir, store) = setup_store();
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(CacheError::Storage(_))
        ));
        assert!(store.put(".hidden", Bytes::from_static(b"x")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, store) = setup_store();
        store
            .put("acme_account+key", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(store.base_path()).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(store.base_path().join("acme_account+key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
