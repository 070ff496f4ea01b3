//! Worker privilege drop
//!
//! After the listeners are bound the worker locks itself into the jail
//! directory and gives up root:
//!
//! 1. Create the jail directory if missing and make the web root read-only
//! 2. `chdir` + `chroot` into the jail
//! 3. Empty the capability bounding set (needs `CAP_SETPCAP`, so before the
//!    UID switch)
//! 4. `setgroups([gid])`, `setgid`, `setuid`
//! 5. Set `PR_SET_NO_NEW_PRIVS` and clear the environment
//!
//! UID/GID changes go through libc, which applies them to every thread of
//! the process. The bounding set and `no_new_privs` are per-thread: they
//! cover the calling thread and threads it starts later, so the drop has to
//! happen while the process is still single-threaded. Clearing the
//! environment has the same requirement.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use nix::unistd::{self, Gid, Uid, User};
use thiserror::Error;
use tracing::{info, warn};
use warden_config::JailConfig;

/// Account used when neither the configured user nor `nobody` exist
pub const FALLBACK_ID: u32 = 65534;

/// Privilege drop errors
#[derive(Error, Debug)]
pub enum JailError {
    #[error("Failed to create jail directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock permissions under {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to enter jail {path}: {source}")]
    Chroot {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to switch to uid {uid} gid {gid}: {source}")]
    SwitchUser {
        uid: u32,
        gid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to drop capabilities: {0}")]
    Capabilities(#[source] nix::Error),

    #[error("Root privileges could be regained after the switch")]
    RootRegained,
}

/// Result of a privilege drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JailOutcome {
    /// Jailed; paths below the jail are now seen relative to `/`
    Jailed { jail: PathBuf },
    /// Still running with the original root and credentials
    Skipped,
}

impl JailOutcome {
    /// Translate a path that was valid before the drop.
    pub fn rebase(&self, path: &Path) -> PathBuf {
        match self {
            JailOutcome::Jailed { jail } => rebase_path(jail, path).unwrap_or_else(|| {
                warn!(
                    path = %path.display(),
                    jail = %jail.display(),
                    "Path is outside the jail and cannot be reached"
                );
                path.to_path_buf()
            }),
            JailOutcome::Skipped => path.to_path_buf(),
        }
    }
}

/// Step that restricts the worker between binding and serving.
pub trait PrivilegeDrop: Send + Sync {
    fn drop_privileges(&self) -> Result<JailOutcome, JailError>;
}

/// Leaves the process untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJail;

impl PrivilegeDrop for NoJail {
    fn drop_privileges(&self) -> Result<JailOutcome, JailError> {
        Ok(JailOutcome::Skipped)
    }
}

/// chroot + unprivileged user
#[derive(Debug, Clone)]
pub struct Jail {
    config: JailConfig,
    web_root: PathBuf,
}

impl Jail {
    pub fn new(config: JailConfig, web_root: PathBuf) -> Self {
        Self { config, web_root }
    }
}

impl PrivilegeDrop for Jail {
    fn drop_privileges(&self) -> Result<JailOutcome, JailError> {
        if !self.config.enabled {
            warn!("Jail disabled in configuration, serving without privilege drop");
            return Ok(JailOutcome::Skipped);
        }
        if !unistd::geteuid().is_root() {
            warn!("Not running as root, serving without privilege drop");
            return Ok(JailOutcome::Skipped);
        }

        let jail = prepare_directory(&self.config.directory)?;
        if self.config.lock_permissions && self.web_root.exists() {
            info!(path = %self.web_root.display(), "Setting web root permissions to read-only");
            lock_permissions(&self.web_root)?;
        }

        let (uid, gid) = lookup_user(&self.config.user);

        info!(jail = %jail.display(), "Entering jail");
        unistd::chdir(&jail)
            .and_then(|_| unistd::chroot("."))
            .map_err(|source| JailError::Chroot {
                path: jail.clone(),
                source,
            })?;

        drop_bounding_set()?;

        info!(uid = uid.as_raw(), gid = gid.as_raw(), "Switching user");
        let switch_err = |source: nix::Error| JailError::SwitchUser {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            source,
        };
        unistd::setgroups(&[gid]).map_err(switch_err)?;
        unistd::setgid(gid).map_err(switch_err)?;
        unistd::setuid(uid).map_err(switch_err)?;

        if unistd::setuid(Uid::from_raw(0)).is_ok() {
            return Err(JailError::RootRegained);
        }

        set_no_new_privs()?;
        clear_environment();

        Ok(JailOutcome::Jailed { jail })
    }
}

/// Create the jail directory if needed and return its canonical path.
fn prepare_directory(directory: &Path) -> Result<PathBuf, JailError> {
    let create_err = |source: std::io::Error| JailError::CreateDirectory {
        path: directory.to_path_buf(),
        source,
    };
    if !directory.exists() {
        fs::create_dir_all(directory).map_err(create_err)?;
        fs::set_permissions(directory, fs::Permissions::from_mode(0o555)).map_err(create_err)?;
    }
    directory.canonicalize().map_err(create_err)
}

/// Make a tree read-only: directories 0555, files 0444. Symlinks are left alone.
pub fn lock_permissions(root: &Path) -> Result<(), JailError> {
    let perm_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| JailError::Permissions { path, source }
    };

    let meta = fs::symlink_metadata(root).map_err(perm_err(root))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(root).map_err(perm_err(root))? {
            let entry = entry.map_err(perm_err(root))?;
            lock_permissions(&entry.path())?;
        }
        fs::set_permissions(root, fs::Permissions::from_mode(0o555)).map_err(perm_err(root))?;
    } else {
        fs::set_permissions(root, fs::Permissions::from_mode(0o444)).map_err(perm_err(root))?;
    }
    Ok(())
}

/// Resolve the account to switch to: `user`, then `nobody`, then 65534.
fn lookup_user(name: &str) -> (Uid, Gid) {
    for candidate in [name, "nobody"] {
        match User::from_name(candidate) {
            Ok(Some(user)) => return (user.uid, user.gid),
            Ok(None) => warn!(user = candidate, "User not found"),
            Err(e) => warn!(user = candidate, error = %e, "User lookup failed"),
        }
    }
    warn!(id = FALLBACK_ID, "Falling back to numeric uid and gid");
    (Uid::from_raw(FALLBACK_ID), Gid::from_raw(FALLBACK_ID))
}

/// Path of `path` as seen from inside `jail`, or `None` when outside it.
///
/// Both paths are made absolute and normalized lexically first.
pub fn rebase_path(jail: &Path, path: &Path) -> Option<PathBuf> {
    let jail = normalize(jail);
    let path = normalize(path);
    let relative = path.strip_prefix(&jail).ok()?;
    Some(Path::new("/").join(relative))
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(target_os = "linux")]
fn drop_bounding_set() -> Result<(), JailError> {
    for cap in 0..64 {
        // SAFETY: PR_CAPBSET_DROP takes plain integer arguments
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 {
            let errno = nix::errno::Errno::last();
            // EINVAL marks the first capability the kernel does not know
            if errno == nix::errno::Errno::EINVAL {
                break;
            }
            return Err(JailError::Capabilities(errno));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn drop_bounding_set() -> Result<(), JailError> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_no_new_privs() -> Result<(), JailError> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes plain integer arguments
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(JailError::Capabilities(nix::errno::Errno::last()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_no_new_privs() -> Result<(), JailError> {
    Ok(())
}

fn clear_environment() {
    for (key, _) in std::env::vars_os() {
        std::env::remove_var(key);
    }
}
