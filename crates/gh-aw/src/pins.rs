//! Action pinning: every `uses:` reference resolves to an immutable commit
//! identifier before emission.
//!
//! Resolution order: the on-disk pin lock (`.github/aw/actions-lock.json`),
//! then an upstream lookup, then the embedded product-shipped table. The
//! pin lock is mutated under an exclusive advisory lock; readers tolerate
//! being overtaken and re-read after a miss before resolving remotely.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diag::{Category, CompileError, Warning, diagnostic};
use crate::fetch::Fetcher;
use crate::lock::{AdvisoryLock, write_atomic};

/// Built-in actions referenced by synthesized jobs, shipped pre-pinned so
/// a fresh checkout compiles offline.
pub const EMBEDDED_PINS: &[(&str, &str)] = &[
    (
        "actions/checkout@v4",
        "11bd71901bbe5b1630ceea73d27597364c9af683",
    ),
    (
        "actions/github-script@v7",
        "60a0d83039c74a4aee543508d2ffcb1c3799cdea",
    ),
    (
        "actions/upload-artifact@v4",
        "b4b15b8c7c6ac21ea08fcf65892d2ee8f75cf882",
    ),
    (
        "actions/download-artifact@v4",
        "fa0a91b85d4f404e444e00e005971372dc801d16",
    ),
    (
        "actions/setup-node@v4",
        "39370e3970a6d050c480ffad4ff0ed4d3fdee5af",
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinEntry {
    pub sha: String,
    pub resolved_at: DateTime<Utc>,
}

/// An action reference resolved to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedAction {
    /// The reference as authored, e.g. `actions/checkout@v4`.
    pub reference: String,
    pub sha: String,
}

impl PinnedAction {
    /// The emitted form: `owner/repo@<sha> # <original-reference>`.
    pub fn uses_value(&self) -> (String, String) {
        let location = self
            .reference
            .split_once('@')
            .map(|(l, _)| l)
            .unwrap_or(&self.reference);
        (format!("{location}@{}", self.sha), self.reference.clone())
    }
}

fn is_full_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// The action pinner for one compilation. Newly resolved pins are persisted
/// immediately via read-modify-write under the advisory lock.
pub struct Pinner<'a> {
    lock_path: PathBuf,
    fetcher: &'a Fetcher,
    stale_after: Duration,
    entries: BTreeMap<String, PinEntry>,
    pub warnings: Vec<Warning>,
}

impl<'a> Pinner<'a> {
    pub fn new(lock_path: PathBuf, fetcher: &'a Fetcher, stale_after: Duration) -> Self {
        let entries = load_entries(&lock_path).unwrap_or_default();
        Self {
            lock_path,
            fetcher,
            stale_after,
            entries,
            warnings: Vec::new(),
        }
    }

    fn is_fresh(&self, entry: &PinEntry) -> bool {
        let age = Utc::now() - entry.resolved_at;
        age.num_seconds().unsigned_abs() <= self.stale_after.as_secs()
    }

    /// Pin one action reference for the workflow at `src_path`.
    pub fn pin(&mut self, src_path: &Path, reference: &str) -> Result<PinnedAction, CompileError> {
        let (location, reference_part) = reference.split_once('@').ok_or_else(|| {
            CompileError::Pin(
                diagnostic(
                    Category::Pin,
                    src_path,
                    format!("action reference `{reference}` has no version"),
                )
                .suggest("use the `owner/repo@ref` form"),
            )
        })?;

        // Already immutable: pass through.
        if is_full_sha(reference_part) {
            return Ok(PinnedAction {
                reference: reference.to_string(),
                sha: reference_part.to_ascii_lowercase(),
            });
        }

        // 1. Pin lock, if fresh.
        if let Some(entry) = self.entries.get(reference)
            && self.is_fresh(entry)
        {
            return Ok(PinnedAction {
                reference: reference.to_string(),
                sha: entry.sha.clone(),
            });
        }

        // A concurrent compilation may have resolved it since we loaded:
        // re-read before going to the network.
        if self.entries.get(reference).is_none()
            && let Ok(disk) = load_entries(&self.lock_path)
        {
            self.entries = disk;
            if let Some(entry) = self.entries.get(reference)
                && self.is_fresh(entry)
            {
                return Ok(PinnedAction {
                    reference: reference.to_string(),
                    sha: entry.sha.clone(),
                });
            }
        }

        // 2. Upstream resolution. Subdirectory actions pin the repository.
        let mut repo_parts = location.splitn(3, '/');
        let owner = repo_parts.next().unwrap_or_default();
        let repo = repo_parts.next().unwrap_or_default();
        match self.fetcher.resolve_ref(owner, repo, reference_part) {
            Ok(sha) => {
                self.persist(reference, &sha)?;
                return Ok(PinnedAction {
                    reference: reference.to_string(),
                    sha,
                });
            }
            Err(resolve_err) => {
                // Stale cache entry beats failing outright.
                if let Some(entry) = self.entries.get(reference) {
                    self.warnings.push(Warning {
                        path: src_path.to_path_buf(),
                        json_path: None,
                        message: format!(
                            "pin for `{reference}` is stale (resolved {}) and re-resolution failed",
                            entry.resolved_at
                        ),
                    });
                    return Ok(PinnedAction {
                        reference: reference.to_string(),
                        sha: entry.sha.clone(),
                    });
                }

                // 3. Embedded table.
                if let Some((_, sha)) =
                    EMBEDDED_PINS.iter().find(|(r, _)| *r == reference)
                {
                    return Ok(PinnedAction {
                        reference: reference.to_string(),
                        sha: (*sha).to_string(),
                    });
                }

                Err(CompileError::Pin(
                    diagnostic(
                        Category::Pin,
                        src_path,
                        format!("failed to resolve `{reference}`: {resolve_err}"),
                    )
                    .suggest("pin the action to a 40-hex commit identifier"),
                ))
            }
        }
    }

    /// Read-modify-write of the pin lock under the advisory lock.
    fn persist(&mut self, reference: &str, sha: &str) -> Result<(), CompileError> {
        let entry = PinEntry {
            sha: sha.to_string(),
            resolved_at: Utc::now(),
        };
        self.entries.insert(reference.to_string(), entry.clone());

        let io_err = |message: String| CompileError::Io {
            path: self.lock_path.clone(),
            message,
            source: None,
        };

        let _guard = AdvisoryLock::acquire(&self.lock_path, Duration::from_secs(60))
            .map_err(|e| io_err(format!("failed to lock pin file: {e:#}")))?;

        // Merge with whatever landed on disk while we worked.
        let mut merged = load_entries(&self.lock_path).unwrap_or_default();
        merged.insert(reference.to_string(), entry);
        let json = serde_json::to_string_pretty(&merged)
            .map_err(|e| io_err(format!("failed to serialize pin lock: {e}")))?;
        write_atomic(&self.lock_path, json.as_bytes())
            .map_err(|e| io_err(format!("failed to write pin lock: {e:#}")))?;
        self.entries = merged;
        Ok(())
    }
}

fn load_entries(path: &Path) -> anyhow::Result<BTreeMap<String, PinEntry>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
