//! HTTPS fetch of remote imports and schemas, plus the on-disk imports
//! cache.
//!
//! All network access in the compiler funnels through [`Fetcher`]. Requests
//! are bounded: three attempts with exponential backoff, a few seconds
//! total. The cache at `.github/aw/imports/` is content-addressed by commit
//! identifier and append-only per sha; corrupt entries are detected by
//! hash verification at read time and re-fetched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gh_aw_retry::RetryStrategyConfig;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::write_atomic;
use crate::types::{RemoteRef, sha256_hex};

/// Failure of a single remote operation.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream answered 404. Not retried.
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("unexpected status {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("request failed: {0}")]
    Transport(String),

    /// Schema fetches are HTTPS-only.
    #[error("refusing non-https url {0}")]
    InsecureUrl(String),
}

impl FetchError {
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            FetchError::NotFound { .. } | FetchError::InsecureUrl(_)
        ) || matches!(self, FetchError::Status { status, .. } if (400..500).contains(status))
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

/// Blocking HTTP client with injectable base URLs (tests point these at a
/// local server).
#[derive(Debug, Clone)]
pub struct Fetcher {
    http: Client,
    api_base: String,
    raw_base: String,
    retry: RetryStrategyConfig,
}

impl Fetcher {
    /// Build a fetcher against github.com, honoring the
    /// `GH_AW_GITHUB_API_URL` / `GH_AW_GITHUB_RAW_URL` overrides used for
    /// GitHub Enterprise deployments.
    pub fn new(retry: RetryStrategyConfig) -> Result<Self> {
        let api_base = std::env::var("GH_AW_GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        let raw_base = std::env::var("GH_AW_GITHUB_RAW_URL")
            .unwrap_or_else(|_| "https://raw.githubusercontent.com".to_string());
        Self::with_bases(api_base, raw_base, retry)
    }

    pub fn with_bases(
        api_base: impl Into<String>,
        raw_base: impl Into<String>,
        retry: RetryStrategyConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("gh-aw/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            raw_base: raw_base.into(),
            retry,
        })
    }

    /// Retry transient failures with backoff; permanent failures (404,
    /// 4xx, insecure URL) surface immediately.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_permanent() || attempt >= self.retry.max_attempts => return Err(e),
                Err(_) => {
                    std::thread::sleep(gh_aw_retry::calculate_delay(&self.retry, attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .http
            .get(url)
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        match resp.status() {
            StatusCode::OK => resp
                .text()
                .map_err(|e| FetchError::Transport(e.to_string())),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound {
                what: url.to_string(),
            }),
            s => Err(FetchError::Status {
                status: s.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// Resolve a tag or branch name to a full commit identifier.
    pub fn resolve_ref(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
    ) -> Result<String, FetchError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/commits/{reference}",
            self.api_base.trim_end_matches('/')
        );
        self.with_retry(|| {
            let body = self.get_text(&url)?;
            let parsed: CommitResponse = serde_json::from_str(&body)
                .map_err(|e| FetchError::Transport(format!("bad commit response: {e}")))?;
            Ok(parsed.sha.to_ascii_lowercase())
        })
    }

    /// Fetch a file's verbatim content at a commit.
    pub fn fetch_raw(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        path: &str,
    ) -> Result<String, FetchError> {
        let url = format!(
            "{}/{owner}/{repo}/{sha}/{path}",
            self.raw_base.trim_end_matches('/')
        );
        self.with_retry(|| self.get_text(&url))
    }

    /// Fetch a JSON schema for a custom MCP server type. HTTPS-only (the
    /// injectable test base is exempt via the loopback check).
    pub fn fetch_schema(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let loopback = url.starts_with("http://127.0.0.1") || url.starts_with("http://localhost");
        if !url.starts_with("https://") && !loopback {
            return Err(FetchError::InsecureUrl(url.to_string()));
        }
        self.with_retry(|| {
            let body = self.get_text(url)?;
            serde_json::from_str(&body)
                .map_err(|e| FetchError::Transport(format!("bad schema body: {e}")))
        })
    }
}

/// Per-file cache metadata, written next to the cached content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    /// The reference as written in the importing file.
    pub reference: String,
    pub fetched_at: DateTime<Utc>,
    pub content_sha: String,
}

/// Content-addressed imports cache at `.github/aw/imports/`.
#[derive(Debug, Clone)]
pub struct ImportsCache {
    root: PathBuf,
}

impl ImportsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<owner>/<repo>/<sha>/<path-within-repo>`
    pub fn entry_path(&self, owner: &str, repo: &str, sha: &str, path: &str) -> PathBuf {
        let mut p = self.root.join(owner).join(repo).join(sha);
        for part in path.split('/') {
            p = p.join(part);
        }
        p
    }

    fn meta_path(&self, owner: &str, repo: &str, sha: &str, path: &str) -> PathBuf {
        let entry = self.entry_path(owner, repo, sha, path);
        let mut name = entry.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        entry.with_file_name(name)
    }

    /// Read a cache entry, verifying it against the recorded content hash.
    /// A corrupt entry is removed and reported as a miss.
    pub fn read(&self, owner: &str, repo: &str, sha: &str, path: &str) -> Result<Option<String>> {
        let entry = self.entry_path(owner, repo, sha, path);
        if !entry.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&entry)
            .with_context(|| format!("failed to read cache entry {}", entry.display()))?;

        let meta_path = self.meta_path(owner, repo, sha, path);
        if let Ok(meta_raw) = fs::read_to_string(&meta_path)
            && let Ok(meta) = serde_json::from_str::<CacheMeta>(&meta_raw)
            && meta.content_sha != sha256_hex(content.as_bytes())
        {
            // Corrupt entry: drop it so the caller re-fetches.
            let _ = fs::remove_file(&entry);
            let _ = fs::remove_file(&meta_path);
            return Ok(None);
        }
        Ok(Some(content))
    }

    /// Populate a cache entry atomically. The cache is append-only per sha;
    /// an existing entry is left untouched.
    pub fn write(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        path: &str,
        reference: &str,
        content: &str,
    ) -> Result<()> {
        let entry = self.entry_path(owner, repo, sha, path);
        if entry.exists() {
            return Ok(());
        }
        write_atomic(&entry, content.as_bytes())?;
        let meta = CacheMeta {
            reference: reference.to_string(),
            fetched_at: Utc::now(),
            content_sha: sha256_hex(content.as_bytes()),
        };
        let meta_json = serde_json::to_string_pretty(&meta).context("serialize cache meta")?;
        write_atomic(&self.meta_path(owner, repo, sha, path), meta_json.as_bytes())?;
        Ok(())
    }

    fn refs_path(&self, owner: &str, repo: &str) -> PathBuf {
        self.root.join(owner).join(repo).join("refs.json")
    }

    /// Cached tag resolution. Branches are never cached here.
    pub fn read_tag(&self, owner: &str, repo: &str, tag: &str) -> Option<String> {
        let raw = fs::read_to_string(self.refs_path(owner, repo)).ok()?;
        let map: BTreeMap<String, String> = serde_json::from_str(&raw).ok()?;
        map.get(tag).cloned()
    }

    pub fn write_tag(&self, owner: &str, repo: &str, tag: &str, sha: &str) -> Result<()> {
        let path = self.refs_path(owner, repo);
        let mut map: BTreeMap<String, String> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        map.insert(tag.to_string(), sha.to_string());
        let json = serde_json::to_string_pretty(&map).context("serialize refs")?;
        write_atomic(&path, json.as_bytes())
    }
}

/// Resolution of one remote import to `(commit, content)`, cache-first.
pub fn resolve_remote(
    fetcher: &Fetcher,
    cache: &ImportsCache,
    owner: &str,
    repo: &str,
    path: &str,
    reference: &RemoteRef,
) -> Result<(String, String), FetchError> {
    let sha = match reference {
        RemoteRef::Commit(sha) => sha.clone(),
        RemoteRef::Tag(tag) => match cache.read_tag(owner, repo, tag) {
            Some(sha) => sha,
            None => {
                let sha = fetcher.resolve_ref(owner, repo, tag)?;
                cache
                    .write_tag(owner, repo, tag, &sha)
                    .map_err(|e| FetchError::Transport(e.to_string()))?;
                sha
            }
        },
        // Branches re-resolve on every compilation.
        RemoteRef::Branch(branch) => fetcher.resolve_ref(owner, repo, branch)?,
    };

    if let Ok(Some(content)) = cache.read(owner, repo, &sha, path) {
        return Ok((sha, content));
    }

    let content = fetcher.fetch_raw(owner, repo, &sha, path)?;
    cache
        .write(owner, repo, &sha, path, reference.as_str(), &content)
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    Ok((sha, content))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use gh_aw_retry::RetryStrategyType;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    use super::*;

    fn immediate_retry() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// A local server standing in for both the API and raw hosts.
    fn spawn_server(routes: Vec<(String, u16, String)>) -> String {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", server.server_addr());
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let url = request.url().to_string();
                let matched = routes.iter().find(|(route, _, _)| route == &url);
                match matched {
                    Some((_, status, body)) => {
                        let response =
                            Response::from_string(body.clone()).with_status_code(*status);
                        let _ = request.respond(response);
                    }
                    None => {
                        let _ = request.respond(Response::from_string("").with_status_code(404));
                    }
                }
            }
        });
        base
    }

    #[test]
    fn resolve_ref_parses_commit_sha() {
        let sha = "a".repeat(40);
        let base = spawn_server(vec![(
            "/repos/acme/shared/commits/v1.2.0".to_string(),
            200,
            format!("{{\"sha\": \"{sha}\"}}"),
        )]);
        let fetcher = Fetcher::with_bases(&base, &base, immediate_retry()).expect("fetcher");
        assert_eq!(
            fetcher.resolve_ref("acme", "shared", "v1.2.0").expect("resolve"),
            sha
        );
    }

    #[test]
    fn missing_ref_is_not_found() {
        let base = spawn_server(vec![]);
        let fetcher = Fetcher::with_bases(&base, &base, immediate_retry()).expect("fetcher");
        let err = fetcher.resolve_ref("acme", "shared", "gone").expect_err("404");
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[test]
    fn fetch_schema_rejects_plain_http() {
        let fetcher = Fetcher::with_bases(
            "https://api.github.com",
            "https://raw.githubusercontent.com",
            immediate_retry(),
        )
        .expect("fetcher");
        let err = fetcher
            .fetch_schema("http://example.com/schema.json")
            .expect_err("insecure");
        assert!(matches!(err, FetchError::InsecureUrl(_)));
    }

    #[test]
    fn cache_roundtrip_and_layout() {
        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        let sha = "b".repeat(40);
        cache
            .write("acme", "shared", &sha, ".github/agents/reviewer.md", "v1", "content")
            .expect("write");

        let entry = cache.entry_path("acme", "shared", &sha, ".github/agents/reviewer.md");
        assert!(entry.exists());
        assert!(entry.ends_with(
            Path::new("acme")
                .join("shared")
                .join(&sha)
                .join(".github")
                .join("agents")
                .join("reviewer.md")
        ));

        let read = cache
            .read("acme", "shared", &sha, ".github/agents/reviewer.md")
            .expect("read");
        assert_eq!(read.as_deref(), Some("content"));
    }

    #[test]
    fn corrupt_cache_entry_is_dropped() {
        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        let sha = "c".repeat(40);
        cache
            .write("acme", "shared", &sha, "file.md", "main", "original")
            .expect("write");

        // Tamper with the content but not the metadata.
        let entry = cache.entry_path("acme", "shared", &sha, "file.md");
        fs::write(&entry, "tampered").expect("tamper");

        let read = cache.read("acme", "shared", &sha, "file.md").expect("read");
        assert_eq!(read, None, "hash mismatch must register as a miss");
        assert!(!entry.exists());
    }

    #[test]
    fn cache_is_append_only_per_sha() {
        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        let sha = "d".repeat(40);
        cache
            .write("acme", "shared", &sha, "file.md", "v1", "first")
            .expect("write");
        cache
            .write("acme", "shared", &sha, "file.md", "v1", "second")
            .expect("rewrite");
        let read = cache.read("acme", "shared", &sha, "file.md").expect("read");
        assert_eq!(read.as_deref(), Some("first"));
    }

    #[test]
    fn tag_resolutions_are_cached() {
        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        assert_eq!(cache.read_tag("acme", "shared", "v1"), None);
        cache
            .write_tag("acme", "shared", "v1", &"e".repeat(40))
            .expect("write");
        assert_eq!(
            cache.read_tag("acme", "shared", "v1"),
            Some("e".repeat(40))
        );
    }

    #[test]
    fn resolve_remote_uses_cache_before_network() {
        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        let sha = "f".repeat(40);
        cache
            .write("acme", "shared", &sha, "wf.md", &sha, "cached body")
            .expect("write");

        // Fetcher points at an unreachable base: a cache hit must not touch it.
        let fetcher =
            Fetcher::with_bases("http://127.0.0.1:1", "http://127.0.0.1:1", immediate_retry())
                .expect("fetcher");
        let (resolved, content) = resolve_remote(
            &fetcher,
            &cache,
            "acme",
            "shared",
            "wf.md",
            &RemoteRef::Commit(sha.clone()),
        )
        .expect("resolve");
        assert_eq!(resolved, sha);
        assert_eq!(content, "cached body");
    }

    #[test]
    fn resolve_remote_fetches_and_populates_cache() {
        let sha = "9".repeat(40);
        let base = spawn_server(vec![
            (
                "/repos/acme/shared/commits/v1.2.0".to_string(),
                200,
                format!("{{\"sha\": \"{sha}\"}}"),
            ),
            (
                format!("/acme/shared/{sha}/.github/agents/reviewer.md"),
                200,
                "---\ndescription: reviewer\n---\nReview.\n".to_string(),
            ),
        ]);

        let td = tempdir().expect("tempdir");
        let cache = ImportsCache::new(td.path());
        let fetcher = Fetcher::with_bases(&base, &base, immediate_retry()).expect("fetcher");

        let (resolved, content) = resolve_remote(
            &fetcher,
            &cache,
            "acme",
            "shared",
            ".github/agents/reviewer.md",
            &RemoteRef::Tag("v1.2.0".to_string()),
        )
        .expect("resolve");

        assert_eq!(resolved, sha);
        assert!(content.contains("reviewer"));
        // Both the content and the tag resolution are now cached.
        assert!(
            cache
                .entry_path("acme", "shared", &sha, ".github/agents/reviewer.md")
                .exists()
        );
        assert_eq!(cache.read_tag("acme", "shared", "v1.2.0"), Some(sha));
    }
}
