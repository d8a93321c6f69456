//! Domain types: sources, imports, graphs, options, reports.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::frontmatter::Frontmatter;

/// Hex-encoded SHA-256 of arbitrary bytes. Used for source content hashes,
/// canonical import identities, and cache verification.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A parsed workflow source file. Immutable once created.
#[derive(Debug, Clone)]
pub struct WorkflowSource {
    pub path: PathBuf,
    pub frontmatter: Frontmatter,
    pub body: String,
    /// Content hash of the raw file bytes.
    pub sha: String,
}

impl WorkflowSource {
    /// Shared components lack an `on` field: importable, never compiled.
    pub fn is_shared_component(&self) -> bool {
        !self.frontmatter.contains("on")
    }
}

/// A reference to a remote import, prior to resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRef {
    /// Semantic version tag, e.g. `v1.2.0` or `1.2.0`. Resolved once, cached.
    Tag(String),
    /// Branch name. Re-resolved on every compilation.
    Branch(String),
    /// 40-hex commit identifier. Used as-is.
    Commit(String),
}

impl RemoteRef {
    /// Syntactic classification: 40-hex is a commit, dotted numerics (with
    /// optional `v` prefix) are tags, anything else is a branch.
    pub fn classify(reference: &str) -> RemoteRef {
        if reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return RemoteRef::Commit(reference.to_ascii_lowercase());
        }
        let digits = reference.strip_prefix('v').unwrap_or(reference);
        let tag_like = !digits.is_empty()
            && digits
                .split('.')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if tag_like {
            RemoteRef::Tag(reference.to_string())
        } else {
            RemoteRef::Branch(reference.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RemoteRef::Tag(s) | RemoteRef::Branch(s) | RemoteRef::Commit(s) => s,
        }
    }

    /// Pinned means immutable: only full commit identifiers qualify.
    pub fn is_commit(&self) -> bool {
        matches!(self, RemoteRef::Commit(_))
    }

    /// Strict mode accepts tags and commits, never branches.
    pub fn is_strict_acceptable(&self) -> bool {
        !matches!(self, RemoteRef::Branch(_))
    }

    /// A hex string shorter than a full commit id; rejected with a
    /// dedicated remediation instead of being treated as a branch.
    pub fn looks_like_short_sha(reference: &str) -> bool {
        (7..40).contains(&reference.len())
            && reference.chars().all(|c| c.is_ascii_hexdigit())
            && reference.chars().any(|c| c.is_ascii_digit())
    }
}

/// One entry of an `imports:` list, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportRef {
    /// Path relative to the importing file.
    Local { path: String },
    /// `owner/repo/path/in/repo@ref`.
    Remote {
        owner: String,
        repo: String,
        path: String,
        reference: RemoteRef,
    },
}

impl ImportRef {
    /// Parse an import specifier. Remote specifiers contain a `@ref` suffix
    /// and at least `owner/repo/path`; everything else is a local path.
    pub fn parse(spec: &str) -> Result<ImportRef, String> {
        if let Some((location, reference)) = spec.rsplit_once('@') {
            let parts: Vec<&str> = location.splitn(3, '/').collect();
            if parts.len() == 3 && !parts[0].is_empty() && !parts[1].is_empty() {
                if reference.is_empty() {
                    return Err(format!("import `{spec}` has an empty reference"));
                }
                if RemoteRef::looks_like_short_sha(reference) {
                    return Err(format!(
                        "import `{spec}` uses a short commit id; use the full 40-hex form"
                    ));
                }
                return Ok(ImportRef::Remote {
                    owner: parts[0].to_string(),
                    repo: parts[1].to_string(),
                    path: parts[2].to_string(),
                    reference: RemoteRef::classify(reference),
                });
            }
        }
        Ok(ImportRef::Local {
            path: spec.to_string(),
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ImportRef::Remote { .. })
    }

    /// The specifier as written (used in diagnostics).
    pub fn display(&self) -> String {
        match self {
            ImportRef::Local { path } => path.clone(),
            ImportRef::Remote {
                owner,
                repo,
                path,
                reference,
            } => format!("{owner}/{repo}/{path}@{}", reference.as_str()),
        }
    }
}

/// A resolved node of the import graph.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    /// Canonical identity: local absolute path, or `owner/repo/path@sha`.
    pub identity: String,
    pub source: WorkflowSource,
    /// Commit the content was resolved at, for remote imports.
    pub commit: Option<String>,
    /// The reference as written, for remote imports (strict mode rejects
    /// branch references).
    pub reference: Option<RemoteRef>,
    /// Manifest line recorded in the lock-file header. Remote:
    /// `owner/repo/path@sha`; local: `relative/path@content-sha`.
    pub manifest_entry: String,
    /// Whether the node is under a `.github/agents/` directory.
    pub is_agent: bool,
}

/// The rooted import DAG, in BFS order. The root occupies position 0.
#[derive(Debug, Clone)]
pub struct ImportGraph {
    pub nodes: Vec<ResolvedImport>,
}

impl ImportGraph {
    /// Header manifest lines: every node except the root, in BFS order.
    pub fn manifest_entries(&self) -> Vec<String> {
        self.nodes
            .iter()
            .skip(1)
            .map(|n| n.manifest_entry.clone())
            .collect()
    }

    pub fn root(&self) -> &ResolvedImport {
        &self.nodes[0]
    }
}

/// Options record the CLI hands to the compiler.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Explicit source paths; empty means "walk the workflows directory".
    pub paths: Vec<PathBuf>,
    pub watch: bool,
    /// Run the validators only; implies no lock file is written.
    pub validate: bool,
    /// Compile fully but skip writing lock files.
    pub no_emit: bool,
    pub strict: bool,
    pub purge: bool,
    pub output_dir: Option<PathBuf>,
    /// Apply codemods before compiling.
    pub fix_first: bool,
    pub json_report: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            watch: false,
            validate: false,
            no_emit: false,
            strict: false,
            purge: false,
            output_dir: None,
            fix_first: false,
            json_report: false,
        }
    }
}

/// Well-known repository-relative locations.
#[derive(Debug, Clone)]
pub struct Layout {
    pub workdir: PathBuf,
}

impl Layout {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.workdir.join(".github").join("workflows")
    }

    pub fn imports_cache_dir(&self) -> PathBuf {
        self.workdir.join(".github").join("aw").join("imports")
    }

    pub fn actions_lock_path(&self) -> PathBuf {
        self.workdir
            .join(".github")
            .join("aw")
            .join("actions-lock.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.workdir.join(".aw.toml")
    }
}

/// Cooperative cancellation shared between the driver and pipeline stages.
///
/// Long loops (import BFS, batch walks, watch polling) check this between
/// units of work; remote fetches check it before starting.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Per-file result returned to the CLI on success.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source_path: PathBuf,
    pub source_hash: String,
    /// Absent under `--no-emit` and for shared components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<PathBuf>,
    pub import_manifest: Vec<String>,
    pub warnings: Vec<crate::diag::Warning>,
}

/// Derive the lock path for a source path.
pub fn lock_path_for(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    let file = format!("{}.lock.yml", stem.to_string_lossy());
    match output_dir {
        Some(dir) => dir.join(file),
        None => source.with_file_name(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable_and_64_chars() {
        let a = sha256_hex(b"hello");
        let b = sha256_hex(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn remote_ref_classification() {
        assert!(matches!(
            RemoteRef::classify(&"a".repeat(40)),
            RemoteRef::Commit(_)
        ));
        assert!(matches!(
            RemoteRef::classify("v1.2.3"),
            RemoteRef::Tag(_)
        ));
        assert!(matches!(RemoteRef::classify("1.0"), RemoteRef::Tag(_)));
        assert!(matches!(RemoteRef::classify("main"), RemoteRef::Branch(_)));
        assert!(matches!(
            RemoteRef::classify("feature/x"),
            RemoteRef::Branch(_)
        ));
    }

    #[test]
    fn short_sha_detection() {
        assert!(RemoteRef::looks_like_short_sha("abc1234"));
        assert!(!RemoteRef::looks_like_short_sha(&"a".repeat(40)));
        assert!(!RemoteRef::looks_like_short_sha("main"));
        // All-alpha hex words read as branch names, not truncated ids.
        assert!(!RemoteRef::looks_like_short_sha("deadbeef"));
    }

    #[test]
    fn import_ref_parses_remote_and_local() {
        let remote = ImportRef::parse("acme/shared/.github/agents/reviewer.md@v1.2.0").unwrap();
        match remote {
            ImportRef::Remote {
                owner,
                repo,
                path,
                reference,
            } => {
                assert_eq!(owner, "acme");
                assert_eq!(repo, "shared");
                assert_eq!(path, ".github/agents/reviewer.md");
                assert_eq!(reference, RemoteRef::Tag("v1.2.0".to_string()));
            }
            other => panic!("expected remote, got {other:?}"),
        }

        let local = ImportRef::parse("shared/common.md").unwrap();
        assert_eq!(
            local,
            ImportRef::Local {
                path: "shared/common.md".to_string()
            }
        );
    }

    #[test]
    fn import_ref_rejects_short_sha() {
        let err = ImportRef::parse("acme/shared/file.md@abc1234").unwrap_err();
        assert!(err.contains("full 40-hex"));
    }

    #[test]
    fn lock_path_replaces_extension() {
        assert_eq!(
            lock_path_for(Path::new(".github/workflows/ci.md"), None),
            PathBuf::from(".github/workflows/ci.lock.yml")
        );
        assert_eq!(
            lock_path_for(Path::new("wf.md"), Some(Path::new("out"))),
            PathBuf::from("out/wf.lock.yml")
        );
    }

    #[test]
    fn layout_paths_match_contract() {
        let layout = Layout::new("/repo");
        assert_eq!(
            layout.imports_cache_dir(),
            PathBuf::from("/repo/.github/aw/imports")
        );
        assert_eq!(
            layout.actions_lock_path(),
            PathBuf::from("/repo/.github/aw/actions-lock.json")
        );
    }
}
