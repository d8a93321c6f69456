//! Per-file compilation pipeline.
//!
//! Source file → parser → import resolver → merger → template validation →
//! schema + security validation → action pinning → job synthesis →
//! dependency solving → emission. The first fatal error aborts the file
//! with no partial lock file written; other files are unaffected.

use std::path::Path;
use std::time::Duration;

use crate::codemod;
use crate::diag::{CompileError, Warning};
use crate::emit::{self, LockFileParts, Node};
use crate::fetch::{Fetcher, ImportsCache};
use crate::frontmatter::{self, Frontmatter};
use crate::graph;
use crate::imports::Resolver;
use crate::jobs::JobBuilder;
use crate::merge;
use crate::pins::Pinner;
use crate::schema;
use crate::security;
use crate::template;
use crate::types::{
    CancelFlag, CompileOptions, FileReport, Layout, WorkflowSource, lock_path_for,
};

/// Sink for human-facing progress and findings. The CLI writes to stderr;
/// tests collect.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Everything a single compilation needs besides the source path.
pub struct CompileContext<'a> {
    pub layout: &'a Layout,
    pub fetcher: &'a Fetcher,
    pub cache: &'a ImportsCache,
    pub options: &'a CompileOptions,
    pub stale_pin_after: Duration,
    pub cancel: CancelFlag,
    /// Watch-mode poll interval.
    pub poll_interval: Duration,
}

impl CompileContext<'_> {
    fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.layout.workdir) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.to_string_lossy().replace('\\', "/"),
        }
    }
}

/// The outcome of looking at one source file.
#[derive(Debug)]
pub enum FileOutcome {
    /// A lock file was produced (or would be, under `--no-emit`).
    Compiled(FileReport),
    /// Shared component: valid, importable, never compiled.
    SharedComponent,
}

/// Compile one workflow source file.
pub fn compile_file(
    ctx: &CompileContext<'_>,
    path: &Path,
    reporter: &mut dyn Reporter,
) -> Result<FileOutcome, CompileError> {
    let mut source = frontmatter::parse_file(path, false)?;

    if ctx.options.fix_first {
        let mut mapping = source.frontmatter.mapping().clone();
        let applied = codemod::apply_all(&mut mapping);
        for proposal in &applied {
            reporter.info(&format!("codemod {}: {}", proposal.codemod, proposal.message()));
        }
        source = WorkflowSource {
            frontmatter: Frontmatter::new(mapping),
            ..source
        };
    }

    if source.is_shared_component() {
        schema::validate_source(&source, true)?;
        return Ok(FileOutcome::SharedComponent);
    }

    let resolver = Resolver {
        layout: ctx.layout,
        fetcher: ctx.fetcher,
        cache: ctx.cache,
        cancel: ctx.cancel.clone(),
    };
    let graph_nodes = resolver.resolve(source.clone())?;

    let merged = merge::merge(&graph_nodes)?;

    // Expression safety across every source in the graph.
    for node in &graph_nodes.nodes {
        template::validate_source(&node.source)?;
    }

    schema::validate_source(&source, false)?;
    for node in graph_nodes.nodes.iter().skip(1) {
        schema::validate_source(&node.source, true)?;
    }
    schema::validate_merged(&source, &merged, ctx.fetcher, ctx.cache)?;

    let mut warnings: Vec<Warning> =
        security::validate(&source, &merged, &graph_nodes, ctx.options.strict)?;

    // Imports that contribute neither configuration nor prompt text.
    for node in graph_nodes.nodes.iter().skip(1) {
        let contributes_config = merged
            .trace
            .iter()
            .any(|t| t.source == node.manifest_entry);
        if !contributes_config && node.source.body.trim().is_empty() {
            warnings.push(Warning {
                path: source.path.clone(),
                json_path: Some("imports".to_string()),
                message: format!("unreachable import `{}` contributes nothing", node.manifest_entry),
            });
        }
    }

    let source_display = ctx.display_path(path);
    let prompt: String = {
        let mut parts: Vec<&str> = Vec::new();
        for node in &graph_nodes.nodes {
            let body = node.source.body.trim_matches('\n');
            if !body.is_empty() {
                parts.push(body);
            }
        }
        let mut joined = parts.join("\n\n");
        if !joined.is_empty() {
            joined.push('\n');
        }
        joined
    };

    let mut pinner = Pinner::new(
        ctx.layout.actions_lock_path(),
        ctx.fetcher,
        ctx.stale_pin_after,
    );
    let mut builder = JobBuilder {
        source: &source,
        merged: &merged,
        pinner: &mut pinner,
        source_display: source_display.clone(),
        prompt,
    };
    let built = builder.build()?;
    warnings.append(&mut pinner.warnings);

    let job_nodes: Vec<graph::JobNode> = built.iter().map(|j| j.node.clone()).collect();
    let solved = graph::solve(path, &job_nodes)?;

    // Assemble the workflow document in solver order.
    let workflow_name = source
        .frontmatter
        .get_str("name")
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "workflow".to_string())
        });

    let mut job_entries: Vec<(String, Node)> = Vec::new();
    for name in &solved.order {
        let job = built
            .iter()
            .find(|j| &j.node.name == name)
            .expect("solved order names a built job");
        job_entries.push((name.clone(), job.rendered.clone()));
    }

    let mut doc_entries: Vec<(String, Node)> = vec![
        ("name".to_string(), Node::str(&workflow_name)),
        (
            "on".to_string(),
            merged
                .on
                .as_ref()
                .map(Node::from_yaml)
                .unwrap_or_else(|| Node::str("workflow_dispatch")),
        ),
    ];
    if let Some(env_value) = source.frontmatter.get("env") {
        doc_entries.push(("env".to_string(), Node::from_yaml(env_value)));
    }
    if let Some(concurrency) = source.frontmatter.get("concurrency") {
        doc_entries.push(("concurrency".to_string(), Node::from_yaml(concurrency)));
    }
    doc_entries.push(("jobs".to_string(), Node::Map(job_entries)));
    let workflow = Node::Map(doc_entries);

    let manifest = graph_nodes.manifest_entries();
    let rendered = emit::render_lock_file(&LockFileParts {
        source_display: &source_display,
        source_sha: &source.sha,
        manifest: &manifest,
        mermaid: &solved.mermaid,
        prompt: &source.body,
        workflow: &workflow,
    });

    let emitting = !ctx.options.no_emit && !ctx.options.validate;
    let lock_path = lock_path_for(path, ctx.options.output_dir.as_deref());
    if emitting {
        emit::write_lock_file(&lock_path, &rendered).map_err(|e| CompileError::Io {
            path: lock_path.clone(),
            message: format!("failed to write lock file: {e:#}"),
            source: None,
        })?;
    }

    for warning in &warnings {
        reporter.warn(&warning.to_string());
    }

    Ok(FileOutcome::Compiled(FileReport {
        source_path: path.to_path_buf(),
        source_hash: source.sha.clone(),
        lock_path: emitting.then_some(lock_path),
        import_manifest: manifest,
        warnings,
    }))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use gh_aw_retry::{RetryStrategyConfig, RetryStrategyType};
    use tempfile::tempdir;

    use super::*;

    #[derive(Default)]
    pub struct TestReporter {
        pub infos: Vec<String>,
        pub warns: Vec<String>,
        pub errors: Vec<String>,
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        layout: Layout,
        fetcher: Fetcher,
        cache: ImportsCache,
        options: CompileOptions,
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
                    strategy: RetryStrategyType::Immediate,
                    max_attempts: 1,
                    ..Default::default()
                },
            )
            .expect("fetcher");
            Self {
                _td: td,
                layout,
                fetcher,
                cache,
                options: CompileOptions::default(),
            }
        }

        fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.layout.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(&path, content).expect("write");
            path
        }

        fn compile(&self, path: &Path) -> Result<FileOutcome, CompileError> {
            let ctx = CompileContext {
                layout: &self.layout,
                fetcher: &self.fetcher,
                cache: &self.cache,
                options: &self.options,
                stale_pin_after: Duration::from_secs(90 * 24 * 3600),
                cancel: CancelFlag::new(),
                poll_interval: Duration::from_millis(50),
            };
            compile_file(&ctx, path, &mut TestReporter::default())
        }
    }

    const MINIMAL: &str = "---\non: workflow_dispatch\nengine: copilot\npermissions:\n  contents: read\n---\n";

    #[test]
    fn minimal_workflow_compiles_to_expected_jobs() {
        let fx = Fixture::new();
        let path = fx.write(".github/workflows/ci.md", MINIMAL);
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!("expected compiled outcome");
        };

        let lock = fs::read_to_string(report.lock_path.as_ref().expect("lock path"))
            .expect("read lock");
        assert!(lock.contains("  activation:"), "{lock}");
        assert!(lock.contains("  agent:"), "{lock}");
        assert!(!lock.contains("  detection:"), "{lock}");
        assert!(!lock.contains("  conclusion:"), "{lock}");
        assert!(!lock.contains("  pre_activation:"), "{lock}");
        assert!(lock.contains("needs:\n      - activation"), "{lock}");
        assert!(report.import_manifest.is_empty());
    }

    #[test]
    fn compilation_is_deterministic() {
        let fx = Fixture::new();
        let path = fx.write(
            ".github/workflows/ci.md",
            "---\non: push\nsafe-outputs:\n  create-issue:\n    max: 3\n  add-comment: {}\n---\nDo things.\n",
        );
        let FileOutcome::Compiled(first) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let first_lock = fs::read_to_string(first.lock_path.as_ref().unwrap()).unwrap();
        let FileOutcome::Compiled(_) = fx.compile(&path).expect("recompile") else {
            panic!();
        };
        let second_lock = fs::read_to_string(first.lock_path.as_ref().unwrap()).unwrap();
        assert_eq!(first_lock, second_lock, "byte-for-byte determinism");
    }

    #[test]
    fn header_sha_matches_source_content() {
        let fx = Fixture::new();
        let content = "---\non: push\n---\nPrompt.\n";
        let path = fx.write(".github/workflows/ci.md", content);
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let lock = fs::read_to_string(report.lock_path.as_ref().unwrap()).unwrap();
        assert!(
            lock.contains(&format!("sha: {}", crate::types::sha256_hex(content.as_bytes()))),
            "{lock}"
        );
    }

    #[test]
    fn shared_component_is_not_compiled() {
        let fx = Fixture::new();
        let path = fx.write(".github/workflows/shared.md", "---\ndescription: shared\n---\n");
        match fx.compile(&path).expect("outcome") {
            FileOutcome::SharedComponent => {}
            FileOutcome::Compiled(_) => panic!("shared components must not compile"),
        }
        assert!(!fx.layout.workdir.join(".github/workflows/shared.lock.yml").exists());
    }

    #[test]
    fn failing_file_leaves_no_lock_behind() {
        let fx = Fixture::new();
        let path = fx.write(
            ".github/workflows/bad.md",
            "---\non: push\njobs:\n  deploy:\n    needs: [missing]\n    runs-on: ubuntu-latest\n---\n",
        );
        let err = fx.compile(&path).expect_err("unknown dependency");
        assert!(err.to_string().contains("unknown job `missing`"));
        assert!(!fx.layout.workdir.join(".github/workflows/bad.lock.yml").exists());
    }

    #[test]
    fn cyclic_imports_produce_no_lock_file() {
        let fx = Fixture::new();
        fx.write(".github/workflows/a.md", "---\nimports: [b.md]\n---\n");
        fx.write(".github/workflows/b.md", "---\nimports: [a.md]\n---\n");
        let path = fx.write(
            ".github/workflows/main.md",
            "---\non: push\nimports: [a.md]\n---\n",
        );
        let err = fx.compile(&path).expect_err("cycle");
        assert!(err.to_string().contains("a.md -> b.md -> a.md"), "{err}");
        assert!(!fx.layout.workdir.join(".github/workflows/main.lock.yml").exists());
    }

    #[test]
    fn no_emit_validates_without_writing() {
        let mut fx = Fixture::new();
        fx.options.no_emit = true;
        let path = fx.write(".github/workflows/ci.md", MINIMAL);
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        assert!(report.lock_path.is_none());
        assert!(!fx.layout.workdir.join(".github/workflows/ci.lock.yml").exists());
    }

    #[test]
    fn fix_first_compiles_deprecated_shapes_in_strict_mode() {
        let mut fx = Fixture::new();
        fx.options.strict = true;
        fx.options.fix_first = true;
        let path = fx.write(
            ".github/workflows/old.md",
            "---\non: push\ntimeout_minutes: 10\npermissions:\n  contents: read\nnetwork:\n  allowed: [defaults]\n---\n",
        );
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let lock = fs::read_to_string(report.lock_path.as_ref().unwrap()).unwrap();
        assert!(lock.contains("timeout-minutes: 10"), "{lock}");
    }

    #[test]
    fn strict_mode_rejects_deprecated_shapes_without_fix() {
        let mut fx = Fixture::new();
        fx.options.strict = true;
        let path = fx.write(
            ".github/workflows/old.md",
            "---\non: push\ntimeout_minutes: 10\npermissions:\n  contents: read\nnetwork:\n  allowed: [defaults]\n---\n",
        );
        let err = fx.compile(&path).expect_err("strict");
        assert!(err.to_string().contains("deprecated-field"));
    }

    #[test]
    fn imported_bodies_join_the_prompt() {
        let fx = Fixture::new();
        fx.write(".github/workflows/style.md", "---\n---\nBe terse.\n");
        let path = fx.write(
            ".github/workflows/main.md",
            "---\non: push\nimports: [style.md]\n---\nReview the diff.\n",
        );
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let lock = fs::read_to_string(report.lock_path.as_ref().unwrap()).unwrap();
        assert!(lock.contains("Review the diff."), "{lock}");
        assert!(lock.contains("Be terse."), "{lock}");
        // The header prompt block reproduces only the root body.
        let header_end = lock.find("\nname:").unwrap_or(lock.len());
        let header = &lock[..header_end];
        assert!(header.contains("#   Review the diff."), "{header}");
        assert!(!header.contains("#   Be terse."), "{header}");
    }

    #[test]
    fn threat_detection_scenario_s6() {
        let fx = Fixture::new();
        let path = fx.write(
            ".github/workflows/guarded.md",
            "---\non: push\nsafe-outputs:\n  threat-detection:\n    enabled: true\n  create-issue: {}\n---\n",
        );
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let lock = fs::read_to_string(report.lock_path.as_ref().unwrap()).unwrap();
        assert!(lock.contains("  detection:"), "{lock}");
        assert!(lock.contains("agent --> detection"), "{lock}");
        assert!(lock.contains("detection --> create_issue"), "{lock}");
        let needs_idx = lock.find("  create_issue:").expect("create_issue job");
        let tail = &lock[needs_idx..];
        assert!(tail.contains("- agent"), "{tail}");
        assert!(tail.contains("- detection"), "{tail}");
    }

    #[test]
    fn every_uses_is_pinned_to_forty_hex() {
        let fx = Fixture::new();
        let path = fx.write(
            ".github/workflows/ci.md",
            "---\non: push\nsafe-outputs:\n  create-issue: {}\njobs:\n  lint:\n    runs-on: ubuntu-latest\n    steps:\n      - uses: actions/checkout@v4\n---\n",
        );
        let FileOutcome::Compiled(report) = fx.compile(&path).expect("compile") else {
            panic!();
        };
        let lock = fs::read_to_string(report.lock_path.as_ref().unwrap()).unwrap();
        for line in lock.lines() {
            let Some(uses) = line.trim_start().strip_prefix("uses: ") else {
                continue;
            };
            let reference = uses.split(" # ").next().unwrap_or(uses);
            let (_, sha) = reference.rsplit_once('@').expect("uses has @");
            assert_eq!(sha.len(), 40, "unpinned uses line: {line}");
            assert!(sha.chars().all(|c| c.is_ascii_hexdigit()), "{line}");
        }
    }
}
