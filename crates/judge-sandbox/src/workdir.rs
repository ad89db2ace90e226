use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

/// Private per-context working directory holding the driver and the submission.
///
/// Sealed read-only before the child starts; removed on drop.
pub(crate) struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub(crate) fn new(prefix: &str) -> Result<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let base = std::env::temp_dir();
        let pid = std::process::id();

        for _ in 0..10_000 {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = base.join(format!("{prefix}_{pid}_{n}"));
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
                        .with_context(|| format!("chmod work dir: {}", path.display()))?;
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create work dir: {}", path.display()))
                }
            }
        }
        anyhow::bail!("failed to create unique work dir under {}", base.display())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.path.join(name);
        std::fs::write(&path, contents).with_context(|| format!("write: {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444))
            .with_context(|| format!("chmod: {}", path.display()))?;
        Ok(path)
    }

    /// Directory becomes `r-x`: the child can read its files but create none.
    pub(crate) fn seal(&self) -> Result<()> {
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o555))
            .with_context(|| format!("seal work dir: {}", self.path.display()))
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o700));
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
