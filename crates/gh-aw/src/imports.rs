//! Breadth-first import resolution.
//!
//! Entries from each source's `imports:` list are processed through a FIFO
//! queue. Every node is canonicalized to a stable identity (local absolute
//! path, or `owner/repo/path@sha`) before being enqueued, so aliased and
//! shared imports collapse to one visit. A file importing one of its own
//! ancestors is a cycle; a file importing an already-visited sibling is
//! intentional sharing and is skipped silently.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::diag::{Category, CompileError, diagnostic};
use crate::fetch::{FetchError, Fetcher, ImportsCache, resolve_remote};
use crate::frontmatter::{self, Frontmatter};
use crate::types::{
    CancelFlag, ImportGraph, ImportRef, Layout, RemoteRef, ResolvedImport, WorkflowSource,
    sha256_hex,
};

/// Where the importing file itself lives; local imports inside it resolve
/// relative to this.
#[derive(Debug, Clone)]
enum Context {
    Local { dir: PathBuf },
    Remote { owner: String, repo: String, sha: String, dir: String },
}

#[derive(Debug, Clone)]
struct QueueEntry {
    spec: String,
    context: Context,
    /// Ancestors from the root to the importing file: (identity, display).
    chain: Vec<(String, String)>,
}

pub struct Resolver<'a> {
    pub layout: &'a Layout,
    pub fetcher: &'a Fetcher,
    pub cache: &'a ImportsCache,
    pub cancel: CancelFlag,
}

impl Resolver<'_> {
    /// Resolve the full import graph rooted at `root`.
    pub fn resolve(&self, root: WorkflowSource) -> Result<ImportGraph, CompileError> {
        let root_path = &root.path;
        let root_identity = canonical_local_identity(root_path);
        let root_display = self.display_path(root_path);

        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(root_identity.clone());

        let mut queue: VecDeque<QueueEntry> = VecDeque::new();
        for spec in import_specs(root_path, &root.frontmatter)? {
            queue.push_back(QueueEntry {
                spec,
                context: Context::Local {
                    dir: root_path.parent().unwrap_or(Path::new(".")).to_path_buf(),
                },
                chain: vec![(root_identity.clone(), root_display.clone())],
            });
        }

        let root_manifest = format!("{root_display}@{}", root.sha);
        let mut nodes = vec![ResolvedImport {
            identity: root_identity,
            source: root,
            commit: None,
            reference: None,
            manifest_entry: root_manifest,
            is_agent: false,
        }];
        let mut agent_import: Option<String> = None;

        while let Some(entry) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(CompileError::Io {
                    path: root_path_of(&nodes),
                    message: "compilation cancelled".to_string(),
                    source: None,
                });
            }

            let src_path = root_path_of(&nodes);
            let import_ref = ImportRef::parse(&entry.spec).map_err(|msg| {
                CompileError::Import(
                    diagnostic(Category::Import, &src_path, msg).at("imports"),
                )
            })?;

            if import_target_path(&import_ref).ends_with(".lock.yml") {
                return Err(CompileError::Import(
                    diagnostic(
                        Category::Import,
                        &src_path,
                        format!("forbidden import `{}`: lock files are compiler output", entry.spec),
                    )
                    .at("imports")
                    .suggest("import the `.md` source instead"),
                ));
            }

            let resolved = self.resolve_one(&src_path, &entry, &import_ref)?;

            // Cycle: importing any ancestor of the importing file.
            if let Some(pos) = entry
                .chain
                .iter()
                .position(|(identity, _)| identity == &resolved.node.identity)
            {
                let mut names: Vec<String> = entry.chain[pos..]
                    .iter()
                    .map(|(_, display)| short_name(display))
                    .collect();
                names.push(short_name(&resolved.display));
                return Err(CompileError::Import(
                    diagnostic(
                        Category::Import,
                        &src_path,
                        format!("cycle detected: {}", names.join(" -> ")),
                    )
                    .at("imports"),
                ));
            }

            if !visited.insert(resolved.node.identity.clone()) {
                continue;
            }

            if resolved.node.is_agent {
                if let Some(existing) = &agent_import {
                    return Err(CompileError::Import(
                        diagnostic(
                            Category::Import,
                            &src_path,
                            format!(
                                "agent conflict: both `{existing}` and `{}` are agent files",
                                resolved.display
                            ),
                        )
                        .at("imports")
                        .suggest("a workflow may import at most one file under .github/agents/"),
                    ));
                }
                agent_import = Some(resolved.display.clone());
            }

            let mut child_chain = entry.chain.clone();
            child_chain.push((resolved.node.identity.clone(), resolved.display.clone()));

            for spec in import_specs(&src_path, &resolved.node.source.frontmatter)? {
                queue.push_back(QueueEntry {
                    spec,
                    context: resolved.child_context.clone(),
                    chain: child_chain.clone(),
                });
            }

            nodes.push(resolved.node);
        }

        Ok(ImportGraph { nodes })
    }

    fn resolve_one(
        &self,
        src_path: &Path,
        entry: &QueueEntry,
        import_ref: &ImportRef,
    ) -> Result<Resolved, CompileError> {
        match import_ref {
            ImportRef::Local { path } => match &entry.context {
                Context::Local { dir } => self.resolve_local(src_path, dir, path),
                Context::Remote { owner, repo, sha, dir } => {
                    // A relative import inside a remote file stays in that
                    // repository at the same commit.
                    let joined = join_remote_path(dir, path);
                    self.resolve_remote_file(
                        src_path,
                        owner,
                        repo,
                        &joined,
                        &RemoteRef::Commit(sha.clone()),
                    )
                }
            },
            ImportRef::Remote {
                owner,
                repo,
                path,
                reference,
            } => self.resolve_remote_file(src_path, owner, repo, path, reference),
        }
    }

    fn resolve_local(
        &self,
        src_path: &Path,
        base_dir: &Path,
        rel: &str,
    ) -> Result<Resolved, CompileError> {
        let joined = base_dir.join(rel);
        if !joined.exists() {
            return Err(CompileError::Import(
                diagnostic(
                    Category::Import,
                    src_path,
                    format!("import not found: `{rel}` (resolved to {})", joined.display()),
                )
                .at("imports"),
            ));
        }
        let abs = joined.canonicalize().map_err(|e| {
            CompileError::io(&joined, format!("failed to canonicalize {}", joined.display()), e)
        })?;

        let display = self.display_path(&abs);
        let source = if is_yaml_workflow(rel) {
            let content = std::fs::read_to_string(&abs).map_err(|e| {
                CompileError::io(&abs, format!("failed to read {}", abs.display()), e)
            })?;
            yaml_workflow_to_source(&abs, &content)?
        } else {
            frontmatter::parse_file(&abs, true)?
        };

        let manifest_entry = format!("{display}@{}", source.sha);
        Ok(Resolved {
            display,
            child_context: Context::Local {
                dir: abs.parent().unwrap_or(Path::new(".")).to_path_buf(),
            },
            node: ResolvedImport {
                identity: canonical_local_identity(&abs),
                is_agent: path_is_agent(&abs.to_string_lossy()),
                source,
                commit: None,
                reference: None,
                manifest_entry,
            },
        })
    }

    fn resolve_remote_file(
        &self,
        src_path: &Path,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &RemoteRef,
    ) -> Result<Resolved, CompileError> {
        let display = format!("{owner}/{repo}/{path}@{}", reference.as_str());
        let (sha, content) =
            resolve_remote(self.fetcher, self.cache, owner, repo, path, reference).map_err(
                |e| match e {
                    FetchError::NotFound { what } => CompileError::Import(
                        diagnostic(
                            Category::Import,
                            src_path,
                            format!("import not found: `{display}` ({what})"),
                        )
                        .at("imports"),
                    ),
                    other => CompileError::Io {
                        path: src_path.to_path_buf(),
                        message: format!("failed to fetch `{display}`: {other}"),
                        source: None,
                    },
                },
            )?;

        let virtual_path = PathBuf::from(format!("{owner}/{repo}/{path}@{sha}"));
        let source = if is_yaml_workflow(path) {
            yaml_workflow_to_source(&virtual_path, &content)?
        } else {
            frontmatter::parse_bytes(&virtual_path, &content, true)?
        };

        let dir = match path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };

        Ok(Resolved {
            display,
            child_context: Context::Remote {
                owner: owner.to_string(),
                repo: repo.to_string(),
                sha: sha.clone(),
                dir,
            },
            node: ResolvedImport {
                identity: format!("{owner}/{repo}/{path}@{sha}"),
                is_agent: path_is_agent(path),
                source,
                manifest_entry: format!("{owner}/{repo}/{path}@{sha}"),
                reference: Some(reference.clone()),
                commit: Some(sha),
            },
        })
    }

    fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.layout.workdir) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.to_string_lossy().replace('\\', "/"),
        }
    }
}

struct Resolved {
    display: String,
    child_context: Context,
    node: ResolvedImport,
}

fn root_path_of(nodes: &[ResolvedImport]) -> PathBuf {
    nodes[0].source.path.clone()
}

/// Last path component, used when naming files in cycle messages.
fn short_name(display: &str) -> String {
    display.rsplit('/').next().unwrap_or(display).to_string()
}

fn canonical_local_identity(path: &Path) -> String {
    let abs = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    abs.to_string_lossy().replace('\\', "/")
}

fn path_is_agent(path: &str) -> bool {
    path.replace('\\', "/").contains(".github/agents/")
}

fn is_yaml_workflow(path: &str) -> bool {
    (path.ends_with(".yml") || path.ends_with(".yaml")) && !path.ends_with(".lock.yml")
}

fn import_target_path(import_ref: &ImportRef) -> String {
    match import_ref {
        ImportRef::Local { path } => path.clone(),
        ImportRef::Remote { path, .. } => path.clone(),
    }
}

fn join_remote_path(dir: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for part in rel.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Extract the `imports:` list from frontmatter.
fn import_specs(path: &Path, frontmatter: &Frontmatter) -> Result<Vec<String>, CompileError> {
    let Some(value) = frontmatter.get("imports") else {
        return Ok(Vec::new());
    };
    let Some(seq) = value.as_sequence() else {
        return Err(CompileError::Import(
            diagnostic(Category::Import, path, "`imports` must be a list of strings")
                .at("imports"),
        ));
    };
    let mut specs = Vec::with_capacity(seq.len());
    for item in seq {
        match item.as_str() {
            Some(s) => specs.push(s.to_string()),
            None => {
                return Err(CompileError::Import(
                    diagnostic(Category::Import, path, "`imports` entries must be strings")
                        .at("imports"),
                ));
            }
        }
    }
    Ok(specs)
}

/// Convert an imported plain YAML workflow (§ job libraries) into a
/// synthetic source whose frontmatter carries only `jobs:`.
///
/// Action definition files (top-level `runs:`) and lock files are rejected;
/// per-job `services` keys are prefixed with `<jobname>_` to avoid
/// collisions when merged.
fn yaml_workflow_to_source(path: &Path, content: &str) -> Result<WorkflowSource, CompileError> {
    let doc: Mapping = serde_yaml::from_str(content).map_err(|e| {
        CompileError::Parse(diagnostic(
            Category::Parse,
            path,
            format!("malformed YAML import: {e}"),
        ))
    })?;

    if doc.contains_key(Value::String("runs".to_string())) {
        return Err(CompileError::Import(
            diagnostic(
                Category::Import,
                path,
                "forbidden import: GitHub Action definitions cannot be imported",
            )
            .suggest("reference the action from a job's `uses:` instead"),
        ));
    }

    let Some(jobs) = doc
        .get(Value::String("jobs".to_string()))
        .and_then(Value::as_mapping)
    else {
        return Err(CompileError::Import(
            diagnostic(
                Category::Import,
                path,
                "YAML imports must be workflow files with a top-level `jobs:` mapping",
            ),
        ));
    };

    let mut rewritten_jobs = Mapping::new();
    for (job_name, job_value) in jobs {
        let Some(name) = job_name.as_str() else {
            return Err(CompileError::Import(diagnostic(
                Category::Import,
                path,
                "job names in YAML imports must be strings",
            )));
        };
        let mut job = job_value.as_mapping().cloned().unwrap_or_default();
        if let Some(services) = job
            .remove(Value::String("services".to_string()))
            .and_then(|v| v.as_mapping().cloned())
        {
            let mut prefixed = Mapping::new();
            for (svc_name, svc_value) in services {
                let svc = svc_name.as_str().unwrap_or_default();
                prefixed.insert(
                    Value::String(format!("{name}_{svc}")),
                    svc_value.clone(),
                );
            }
            job.insert(Value::String("services".to_string()), Value::Mapping(prefixed));
        }
        rewritten_jobs.insert(job_name.clone(), Value::Mapping(job));
    }

    let mut head = Mapping::new();
    head.insert(
        Value::String("jobs".to_string()),
        Value::Mapping(rewritten_jobs),
    );

    Ok(WorkflowSource {
        path: path.to_path_buf(),
        frontmatter: Frontmatter::new(head),
        body: String::new(),
        sha: sha256_hex(content.as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use gh_aw_retry::RetryStrategyConfig;
    use tempfile::tempdir;

    use super::*;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    struct Fixture {
        _td: tempfile::TempDir,
        layout: Layout,
        fetcher: Fetcher,
        cache: ImportsCache,
    }

    impl Fixture {
        fn new() -> Self {
            let td = tempdir().expect("tempdir");
            let layout = Layout::new(td.path());
            let cache = ImportsCache::new(layout.imports_cache_dir());
            let fetcher = Fetcher::with_bases(
                "http://127.0.0.1:1",
                "http://127.0.0.1:1",
                RetryStrategyConfig {
                    max_attempts: 1,
                    ..Default::default()
                },
            )
            .expect("fetcher");
            Self { _td: td, layout, fetcher, cache }
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver {
                layout: &self.layout,
                fetcher: &self.fetcher,
                cache: &self.cache,
                cancel: CancelFlag::new(),
            }
        }

        fn workflows_dir(&self) -> PathBuf {
            self.layout.workflows_dir()
        }

        fn parse_root(&self, name: &str, content: &str) -> WorkflowSource {
            let path = self.workflows_dir().join(name);
            write_file(&path, content);
            frontmatter::parse_file(&path, false).expect("parse root")
        }
    }

    #[test]
    fn root_only_graph_has_empty_manifest() {
        let fx = Fixture::new();
        let root = fx.parse_root("ci.md", "---\non: push\n---\nbody\n");
        let graph = fx.resolver().resolve(root).expect("resolve");
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.manifest_entries().is_empty());
    }

    #[test]
    fn local_imports_resolve_in_declared_bfs_order() {
        let fx = Fixture::new();
        write_file(
            &fx.workflows_dir().join("shared/a.md"),
            "---\nimports:\n  - c.md\n---\nA\n",
        );
        write_file(&fx.workflows_dir().join("shared/b.md"), "---\n---\nB\n");
        write_file(&fx.workflows_dir().join("shared/c.md"), "---\n---\nC\n");
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - shared/a.md\n  - shared/b.md\n---\nbody\n",
        );

        let graph = fx.resolver().resolve(root).expect("resolve");
        let names: Vec<String> = graph
            .nodes
            .iter()
            .map(|n| {
                n.source
                    .path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        // BFS: both of the root's imports before a.md's own import.
        assert_eq!(names, vec!["ci.md", "a.md", "b.md", "c.md"]);
    }

    #[test]
    fn shared_import_is_visited_once() {
        let fx = Fixture::new();
        write_file(
            &fx.workflows_dir().join("a.md"),
            "---\nimports:\n  - common.md\n---\nA\n",
        );
        write_file(
            &fx.workflows_dir().join("b.md"),
            "---\nimports:\n  - common.md\n---\nB\n",
        );
        write_file(&fx.workflows_dir().join("common.md"), "---\n---\nshared\n");
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - a.md\n  - b.md\n---\nbody\n",
        );

        let graph = fx.resolver().resolve(root).expect("resolve");
        assert_eq!(graph.nodes.len(), 4, "common.md appears exactly once");
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let fx = Fixture::new();
        write_file(
            &fx.workflows_dir().join("a.md"),
            "---\nimports:\n  - b.md\n---\nA\n",
        );
        write_file(
            &fx.workflows_dir().join("b.md"),
            "---\nimports:\n  - a.md\n---\nB\n",
        );
        let root = fx.parse_root("ci.md", "---\non: push\nimports:\n  - a.md\n---\nbody\n");

        let err = fx.resolver().resolve(root).expect_err("cycle");
        let msg = err.to_string();
        assert!(msg.contains("cycle detected"), "{msg}");
        assert!(msg.contains("a.md -> b.md -> a.md"), "{msg}");
    }

    #[test]
    fn self_import_is_a_cycle() {
        let fx = Fixture::new();
        let root = fx.parse_root("ci.md", "---\non: push\nimports:\n  - ci.md\n---\nbody\n");
        let err = fx.resolver().resolve(root).expect_err("cycle");
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn lock_file_import_is_forbidden() {
        let fx = Fixture::new();
        write_file(&fx.workflows_dir().join("old.lock.yml"), "jobs: {}\n");
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - old.lock.yml\n---\nbody\n",
        );
        let err = fx.resolver().resolve(root).expect_err("forbidden");
        assert!(err.to_string().contains("forbidden import"), "{err}");
    }

    #[test]
    fn missing_local_import_is_not_found() {
        let fx = Fixture::new();
        let root = fx.parse_root("ci.md", "---\non: push\nimports:\n  - gone.md\n---\nbody\n");
        let err = fx.resolver().resolve(root).expect_err("missing");
        assert!(err.to_string().contains("import not found"), "{err}");
    }

    #[test]
    fn two_agent_imports_conflict() {
        let fx = Fixture::new();
        write_file(
            &fx.layout.workdir.join(".github/agents/one.md"),
            "---\n---\nagent one\n",
        );
        write_file(
            &fx.layout.workdir.join(".github/agents/two.md"),
            "---\n---\nagent two\n",
        );
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - ../agents/one.md\n  - ../agents/two.md\n---\nbody\n",
        );
        let err = fx.resolver().resolve(root).expect_err("conflict");
        assert!(err.to_string().contains("agent conflict"), "{err}");
    }

    #[test]
    fn single_agent_import_is_fine() {
        let fx = Fixture::new();
        write_file(
            &fx.layout.workdir.join(".github/agents/one.md"),
            "---\n---\nagent one\n",
        );
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - ../agents/one.md\n---\nbody\n",
        );
        let graph = fx.resolver().resolve(root).expect("resolve");
        assert!(graph.nodes[1].is_agent);
    }

    #[test]
    fn yaml_job_library_import_extracts_jobs() {
        let fx = Fixture::new();
        write_file(
            &fx.workflows_dir().join("lib.yml"),
            "jobs:\n  lint:\n    runs-on: ubuntu-latest\n    services:\n      db:\n        image: postgres\n    steps: []\n",
        );
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - lib.yml\n---\nbody\n",
        );
        let graph = fx.resolver().resolve(root).expect("resolve");
        let lib = &graph.nodes[1];
        let jobs = lib.source.frontmatter.get_mapping("jobs").expect("jobs");
        let lint = jobs
            .get(Value::String("lint".to_string()))
            .and_then(Value::as_mapping)
            .expect("lint job");
        let services = lint
            .get(Value::String("services".to_string()))
            .and_then(Value::as_mapping)
            .expect("services");
        assert!(
            services.contains_key(Value::String("lint_db".to_string())),
            "service keys are prefixed with the job name"
        );
    }

    #[test]
    fn action_definition_import_is_rejected() {
        let fx = Fixture::new();
        write_file(
            &fx.workflows_dir().join("action.yml"),
            "name: some-action\nruns:\n  using: node20\n  main: index.js\n",
        );
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - action.yml\n---\nbody\n",
        );
        let err = fx.resolver().resolve(root).expect_err("action");
        assert!(err.to_string().contains("Action definitions"), "{err}");
    }

    #[test]
    fn remote_import_resolves_via_cache_without_network() {
        let fx = Fixture::new();
        let sha = "a".repeat(40);
        fx.cache
            .write(
                "acme",
                "shared",
                &sha,
                ".github/agents/reviewer.md",
                &sha,
                "---\ndescription: reviewer\n---\nReview things.\n",
            )
            .expect("seed cache");

        let root = fx.parse_root(
            "ci.md",
            &format!(
                "---\non: push\nimports:\n  - acme/shared/.github/agents/reviewer.md@{sha}\n---\nbody\n"
            ),
        );
        let graph = fx.resolver().resolve(root).expect("resolve");
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(
            graph.manifest_entries(),
            vec![format!("acme/shared/.github/agents/reviewer.md@{sha}")]
        );
        assert!(graph.nodes[1].is_agent);
    }

    #[test]
    fn manifest_order_matches_bfs() {
        let fx = Fixture::new();
        write_file(&fx.workflows_dir().join("one.md"), "---\n---\n1\n");
        write_file(&fx.workflows_dir().join("two.md"), "---\n---\n2\n");
        let root = fx.parse_root(
            "ci.md",
            "---\non: push\nimports:\n  - two.md\n  - one.md\n---\nbody\n",
        );
        let graph = fx.resolver().resolve(root).expect("resolve");
        let manifest = graph.manifest_entries();
        assert!(manifest[0].contains("two.md"), "{manifest:?}");
        assert!(manifest[1].contains("one.md"), "{manifest:?}");
    }

    #[test]
    fn join_remote_path_normalizes_dots() {
        assert_eq!(join_remote_path("a/b", "c.md"), "a/b/c.md");
        assert_eq!(join_remote_path("a/b", "../c.md"), "a/c.md");
        assert_eq!(join_remote_path("", "./c.md"), "c.md");
    }
}
