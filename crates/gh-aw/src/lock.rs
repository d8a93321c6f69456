//! Advisory file lock guarding mutation of shared on-disk artifacts.
//!
//! The pin lock (`actions-lock.json`) is read-mostly; writers acquire an
//! exclusive advisory lock on a sibling file, perform read-modify-write,
//! and release. The lock file contains JSON metadata about the holder
//! (PID, hostname, timestamp) so stale locks can be diagnosed and removed.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Lock handle that releases on Drop.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    /// Acquire the advisory lock guarding `target`.
    ///
    /// The lock lives at `<target>.lock`. Fails if another process holds a
    /// fresh lock; locks older than `stale_after` are taken over, as are
    /// corrupt lock files.
    pub fn acquire(target: &Path, stale_after: Duration) -> Result<Self> {
        let lock_path = sibling_lock_path(target);

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        if lock_path.exists() {
            match read_lock_info(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "lock already held by pid {} on {} since {}",
                            info.pid,
                            info.hostname,
                            info.acquired_at
                        );
                    }
                }
                Err(_) => {
                    // Corrupt lock file: take it over.
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock {}", lock_path.display())
                    })?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        let tmp_path = lock_path.with_extension("lock.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create lock tmp {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write lock tmp {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync lock file")?;
        }
        fs::rename(&tmp_path, &lock_path)
            .with_context(|| format!("failed to rename lock to {}", lock_path.display()))?;

        Ok(Self { path: lock_path })
    }

    /// Release the lock.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        // Best effort on drop.
        let _ = self.release();
    }
}

/// The sibling lock path for a guarded file.
pub fn sibling_lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

/// Write `content` to `path` atomically via a temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}
