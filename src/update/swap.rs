//! Replacement of the running executable
//!
//! A running image can be renamed on every supported platform even where it
//! cannot be deleted or overwritten, so the swap is always done in two steps:
//!
//! 1. rename the live file `P` aside to `P.old`
//! 2. move the verified staged file to `P` (plain rename, or copy to `P.new`
//!    followed by a rename when the staged file lives on another volume)
//!
//! If step 2 fails, `P.old` is renamed back before the error is returned, so a
//! failed swap is a no-op. `P.old` stays behind as the pending-cleanup marker
//! and is deleted by the next process on startup via
//! [`cleanup_previous_install`].

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use super::UpdateError;

/// Well-known siblings of the live executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPaths {
    pub live: PathBuf,
    /// Previous binary, kept until the next startup
    pub old: PathBuf,
    /// Cross-volume copy target
    pub new: PathBuf,
    /// Download staging file
    pub staging: PathBuf,
}

impl SwapPaths {
    pub fn for_executable(live: &Path) -> Self {
        Self {
            live: live.to_path_buf(),
            old: sibling(live, "old"),
            new: sibling(live, "new"),
            staging: sibling(live, "download"),
        }
    }
}

/// `STTDesktop.exe` -> `STTDesktop.exe.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("app"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Result of a successful swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutcome {
    pub installed: PathBuf,
    /// Previous binary awaiting deletion by the next process
    pub previous: PathBuf,
}

/// Performs the rename-aside / rename-in protocol
#[derive(Debug, Clone)]
pub struct BinarySwapper {
    paths: SwapPaths,
}

impl BinarySwapper {
    pub fn new(live: &Path) -> Self {
        Self {
            paths: SwapPaths::for_executable(live),
        }
    }

    pub fn paths(&self) -> &SwapPaths {
        &self.paths
    }

    /// Replace the live executable with `staged`
    ///
    /// On error the live executable is unchanged and `staged` is removed.
    pub fn swap(&self, staged: &Path) -> Result<SwapOutcome, UpdateError> {
        let result = self.swap_inner(staged);
        if result.is_err() {
            discard(staged);
        }
        result
    }

    fn swap_inner(&self, staged: &Path) -> Result<SwapOutcome, UpdateError> {
        let SwapPaths { live, old, new, .. } = &self.paths;

        if staged == live.as_path() {
            return Err(UpdateError::Swap(
                "staged artifact path is the live executable".to_string(),
            ));
        }
        if !live.is_file() {
            return Err(UpdateError::Swap(format!(
                "live executable {} not found",
                live.display()
            )));
        }

        // A leftover from an earlier update that was never cleaned up
        remove_if_present(old).map_err(|e| {
            UpdateError::from_io(&format!("cannot remove stale {}", old.display()), &e)
        })?;
        remove_if_present(new).map_err(|e| {
            UpdateError::from_io(&format!("cannot remove stale {}", new.display()), &e)
        })?;

        std::fs::rename(live, old).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => UpdateError::Permission(format!(
                "cannot move {} aside: {}",
                live.display(),
                e
            )),
            _ => UpdateError::Swap(format!("cannot move {} aside: {}", live.display(), e)),
        })?;
        tracing::debug!(from = %live.display(), to = %old.display(), "moved live executable aside");

        if let Err(install_err) = self.install(staged) {
            tracing::error!("installing new executable failed, rolling back: {}", install_err);
            return Err(self.rollback(install_err));
        }

        inherit_permissions(live, old);
        tracing::info!(path = %live.display(), "executable replaced");

        Ok(SwapOutcome {
            installed: live.clone(),
            previous: old.clone(),
        })
    }

    /// Move `staged` onto the live path, which is currently vacant
    fn install(&self, staged: &Path) -> io::Result<()> {
        match std::fs::rename(staged, &self.paths.live) {
            Ok(()) => return Ok(()),
            Err(e) => tracing::debug!("rename into place failed ({}), falling back to copy", e),
        }

        self.install_by_copy(staged)?;
        discard(staged);
        Ok(())
    }

    /// Cross-volume install: copy to `P.new` first so `P` is only ever absent or complete
    fn install_by_copy(&self, staged: &Path) -> io::Result<()> {
        let SwapPaths { live, new, .. } = &self.paths;

        let copied = std::fs::copy(staged, new).and_then(|_| {
            std::fs::OpenOptions::new().write(true).open(new)?.sync_all()?;
            std::fs::rename(new, live)
        });
        if copied.is_err() {
            let _ = std::fs::remove_file(new);
        }
        copied
    }

    /// Put `P.old` back at `P` after a failed install
    fn rollback(&self, cause: io::Error) -> UpdateError {
        let SwapPaths { live, old, .. } = &self.paths;

        // The install step may have left a partial file at P
        if live.exists() {
            let _ = std::fs::remove_file(live);
        }

        match std::fs::rename(old, live) {
            Ok(()) => {
                tracing::info!(path = %live.display(), "restored previous executable");
                UpdateError::Swap(format!("cannot install new executable: {}", cause))
            }
            Err(e) => {
                tracing::error!(
                    old = %old.display(),
                    live = %live.display(),
                    "could not restore previous executable: {}",
                    e
                );
                UpdateError::Swap(format!(
                    "cannot install new executable ({}) and restoring {} failed ({}); \
                     rename it back to {} manually",
                    cause,
                    old.display(),
                    e,
                    live.display()
                ))
            }
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn discard(path: &Path) {
    if let Err(e) = remove_if_present(path) {
        tracing::warn!(path = %path.display(), "could not remove staged artifact: {}", e);
    }
}

/// Give `live` the permissions of the binary it replaced, plus execute bits
/// wherever read is allowed
fn inherit_permissions(live: &Path, previous: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let base = match std::fs::metadata(previous) {
            Ok(meta) => meta.permissions().mode() & 0o7777,
            Err(e) => {
                tracing::warn!(path = %previous.display(), "cannot read previous permissions: {}", e);
                0o755
            }
        };
        let mode = executable_mode(base);
        if let Err(e) = std::fs::set_permissions(live, std::fs::Permissions::from_mode(mode)) {
            tracing::warn!(path = %live.display(), "cannot set executable permission: {}", e);
        }
    }
    #[cfg(not(unix))]
    let _ = (live, previous);
}

/// `mode` with an execute bit added for each class that may read
#[cfg(unix)]
fn executable_mode(mode: u32) -> u32 {
    mode | ((mode & 0o444) >> 2)
}

/// Delete leftovers of a previous update next to `live`
///
/// Run on startup by the new process. Delete failures (for example the old
/// image still being locked) are logged and ignored; the next start retries.
/// Returns the number of files removed.
pub fn cleanup_previous_install(live: &Path) -> usize {
    let paths = SwapPaths::for_executable(live);
    let mut removed = 0;

    for leftover in [&paths.old, &paths.new, &paths.staging] {
        match std::fs::remove_file(leftover) {
            Ok(()) => {
                tracing::info!(path = %leftover.display(), "removed leftover from previous update");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %leftover.display(), "could not remove leftover: {}", e)
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (PathBuf, PathBuf) {
        let live = dir.path().join("STTDesktop.exe");
        let staged = dir.path().join("STTDesktop.exe.download");
        std::fs::write(&live, "old-content").unwrap();
        std::fs::write(&staged, "new-content").unwrap();
        (live, staged)
    }

    #[test]
    fn test_sibling_names() {
        let paths = SwapPaths::for_executable(Path::new("/opt/stt/STTDesktop.exe"));
        assert_eq!(paths.old, Path::new("/opt/stt/STTDesktop.exe.old"));
        assert_eq!(paths.new, Path::new("/opt/stt/STTDesktop.exe.new"));
        assert_eq!(paths.staging, Path::new("/opt/stt/STTDesktop.exe.download"));
        assert_ne!(paths.staging, paths.live);
    }

    #[test]
    fn test_swap_replaces_live_and_keeps_old() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        let swapper = BinarySwapper::new(&live);

        let outcome = swapper.swap(&staged).unwrap();

        assert_eq!(outcome.installed, live);
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "new-content");
        assert_eq!(std::fs::read_to_string(&outcome.previous).unwrap(), "old-content");
        assert!(!staged.exists());
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        std::fs::remove_file(&staged).unwrap();
        let swapper = BinarySwapper::new(&live);

        let err = swapper.swap(&staged).unwrap_err();

        assert!(matches!(err, UpdateError::Swap(_)));
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "old-content");
        assert!(!swapper.paths().old.exists());
        assert!(!swapper.paths().new.exists());
    }

    #[test]
    fn test_missing_live_fails_and_discards_staged() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        std::fs::remove_file(&live).unwrap();

        let err = BinarySwapper::new(&live).swap(&staged).unwrap_err();

        assert!(matches!(err, UpdateError::Swap(_)));
        assert!(!staged.exists());
        assert!(!live.exists());
    }

    #[test]
    fn test_staged_equal_to_live_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (live, _) = setup(&dir);

        let swapper = BinarySwapper::new(&live);
        assert!(swapper.swap_inner(&live).is_err());
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "old-content");
    }

    #[test]
    fn test_stale_old_is_replaced() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        let swapper = BinarySwapper::new(&live);
        std::fs::write(&swapper.paths().old, "ancient").unwrap();

        let outcome = swapper.swap(&staged).unwrap();
        assert_eq!(std::fs::read_to_string(outcome.previous).unwrap(), "old-content");
    }

    #[test]
    fn test_swap_from_other_directory() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let (live, _) = setup(&dir);
        let staged = other.path().join("payload");
        std::fs::write(&staged, "moved-content").unwrap();

        let outcome = BinarySwapper::new(&live).swap(&staged).unwrap();

        assert_eq!(std::fs::read_to_string(&outcome.installed).unwrap(), "moved-content");
        assert!(!staged.exists());
    }

    #[test]
    fn test_install_by_copy_leaves_no_intermediate() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        let swapper = BinarySwapper::new(&live);
        std::fs::remove_file(&live).unwrap();

        swapper.install_by_copy(&staged).unwrap();

        assert_eq!(std::fs::read_to_string(&live).unwrap(), "new-content");
        assert!(!swapper.paths().new.exists());
        assert!(staged.exists());
    }

    #[test]
    fn test_install_by_copy_failure_leaves_live_absent() {
        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        let swapper = BinarySwapper::new(&live);
        std::fs::remove_file(&live).unwrap();
        std::fs::remove_file(&staged).unwrap();

        assert!(swapper.install_by_copy(&staged).is_err());
        assert!(!live.exists());
        assert!(!swapper.paths().new.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_swapped_binary_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o644)).unwrap();
        BinarySwapper::new(&live).swap(&staged).unwrap();

        let mode = std::fs::metadata(&live).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_swap_keeps_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (live, staged) = setup(&dir);
        std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o700)).unwrap();
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o666)).unwrap();
        BinarySwapper::new(&live).swap(&staged).unwrap();

        let mode = std::fs::metadata(&live).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_mode_follows_read_bits() {
        assert_eq!(executable_mode(0o644), 0o755);
        assert_eq!(executable_mode(0o600), 0o700);
        assert_eq!(executable_mode(0o640), 0o750);
        assert_eq!(executable_mode(0o4755), 0o4755);
    }

    #[cfg(unix)]
    #[test]
    fn test_readonly_directory_is_permission_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("app");
        std::fs::create_dir(&app_dir).unwrap();
        let live = app_dir.join("STTDesktop.exe");
        std::fs::write(&live, "old-content").unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, "new-content").unwrap();

        std::fs::set_permissions(&app_dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        let result = BinarySwapper::new(&live).swap(&staged);
        std::fs::set_permissions(&app_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Root ignores directory permissions, so only assert when the rename was refused
        if let Err(err) = result {
            assert!(matches!(err, UpdateError::Permission(_)));
            assert_eq!(std::fs::read_to_string(&live).unwrap(), "old-content");
            assert!(!staged.exists());
        }
    }

    #[test]
    fn test_cleanup_removes_leftovers() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("STTDesktop.exe");
        std::fs::write(&live, "current").unwrap();
        let paths = SwapPaths::for_executable(&live);
        std::fs::write(&paths.old, "previous").unwrap();
        std::fs::write(&paths.staging, "partial").unwrap();

        assert_eq!(cleanup_previous_install(&live), 2);
        assert!(!paths.old.exists());
        assert!(!paths.staging.exists());
        assert!(live.exists());

        assert_eq!(cleanup_previous_install(&live), 0);
    }
}
