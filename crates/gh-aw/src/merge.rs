//! Field-specific merge strategies applied over the import manifest in BFS
//! order.
//!
//! The merger never reorders or deduplicates user-authored lists except
//! where a field's semantics require it (network allowlists, tool
//! allow-lists). Every contributed key is recorded in a trace so
//! diagnostics can attribute a violation to the import that introduced it.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::diag::{Category, CompileError, diagnostic};
use crate::types::ImportGraph;

/// Who contributed a merged key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// JSON-path-ish key, e.g. `tools.github` or `permissions.issues`.
    pub key: String,
    /// Manifest identity of the contributing source.
    pub source: String,
}

/// Workflow-level permission levels, ordered by privilege.
fn permission_rank(level: &str) -> u8 {
    match level {
        "none" => 0,
        "read" => 1,
        "write" => 2,
        _ => 3,
    }
}

/// Parsed `permissions:` value: either a blanket string or a map.
#[derive(Debug, Clone, Default)]
pub struct PermissionsSpec {
    /// `read-all` / `write-all` when given as a bare string.
    pub all: Option<String>,
    pub map: BTreeMap<String, String>,
}

impl PermissionsSpec {
    pub fn parse(value: &Value) -> PermissionsSpec {
        match value {
            Value::String(s) => PermissionsSpec {
                all: Some(s.clone()),
                map: BTreeMap::new(),
            },
            Value::Mapping(m) => {
                let mut map = BTreeMap::new();
                for (k, v) in m {
                    if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                        map.insert(k.to_string(), v.to_string());
                    }
                }
                PermissionsSpec {
                    all: None,
                    map,
                }
            }
            _ => PermissionsSpec::default(),
        }
    }

    /// Does this spec satisfy `scope: level`? Write satisfies read.
    pub fn satisfies(&self, scope: &str, level: &str) -> bool {
        if let Some(all) = &self.all {
            let granted = match all.as_str() {
                "read-all" => "read",
                "write-all" => "write",
                other => other,
            };
            return permission_rank(granted) >= permission_rank(level);
        }
        match self.map.get(scope) {
            Some(granted) => permission_rank(granted) >= permission_rank(level),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_none() && self.map.is_empty()
    }
}

/// Safe-output configuration after merging.
#[derive(Debug, Clone, Default)]
pub struct SafeOutputsConfig {
    /// Keyed by kind config key (`create-issue`, `add-comment`, ...).
    pub entries: BTreeMap<String, Value>,
    pub github_token: Option<String>,
    pub threat_detection: Option<Value>,
    /// User jobs that consume agent output (`safe-outputs.jobs`).
    pub jobs: BTreeMap<String, Value>,
}

impl SafeOutputsConfig {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.jobs.is_empty() && self.threat_detection.is_none()
    }

    pub fn threat_detection_enabled(&self) -> bool {
        match &self.threat_detection {
            Some(Value::Bool(b)) => *b,
            Some(Value::Mapping(m)) => m
                .get(Value::String("enabled".to_string()))
                .and_then(Value::as_bool)
                .unwrap_or(true),
            Some(_) => false,
            None => false,
        }
    }
}

/// The result of merging the import manifest.
#[derive(Debug, Clone, Default)]
pub struct MergedConfig {
    pub on: Option<Value>,
    pub permissions: PermissionsSpec,
    pub engine: Option<Value>,
    pub tools: BTreeMap<String, Value>,
    pub mcp_servers: BTreeMap<String, Value>,
    pub network_allowed: Vec<String>,
    pub safe_outputs: SafeOutputsConfig,
    pub runtimes: BTreeMap<String, Value>,
    /// Free-form user jobs (top-level `jobs:` plus YAML job libraries).
    pub jobs: BTreeMap<String, Value>,
    pub github_token: Option<String>,
    pub runs_on: Option<Value>,
    pub timeout_minutes: Option<u64>,
    pub roles: Vec<String>,
    pub trace: Vec<TraceEntry>,
}

impl MergedConfig {
    /// `on.<key>` accessor for trigger sub-fields the job builder guards on.
    pub fn on_field(&self, key: &str) -> Option<&Value> {
        self.on
            .as_ref()
            .and_then(Value::as_mapping)
            .and_then(|m| m.get(Value::String(key.to_string())))
    }

    pub fn needs_pre_activation(&self) -> bool {
        !self.roles.is_empty()
            || self.on_field("stop-after").is_some()
            || self.on_field("slash_command").is_some()
            || self.on_field("skip-if-match").is_some()
            || self.on_field("reaction").is_some()
    }

    fn record(&mut self, key: impl Into<String>, source: &str) {
        self.trace.push(TraceEntry {
            key: key.into(),
            source: source.to_string(),
        });
    }

    /// The manifest source that contributed `key`, for diagnostics.
    pub fn contributed_by(&self, key: &str) -> Option<&str> {
        self.trace
            .iter()
            .rev()
            .find(|t| t.key == key)
            .map(|t| t.source.as_str())
    }
}

fn as_string_seq(value: &Value) -> Vec<String> {
    value
        .as_sequence()
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Union two tool configurations: mapping keys from `incoming` override
/// `existing`, except `allowed` lists, which are set-unioned and sorted.
fn merge_tool_config(existing: &Value, incoming: &Value) -> Value {
    let (Some(old), Some(new)) = (existing.as_mapping(), incoming.as_mapping()) else {
        return incoming.clone();
    };
    let mut out = old.clone();
    for (k, v) in new {
        let is_allow_list = k.as_str() == Some("allowed");
        if is_allow_list {
            let mut union: Vec<String> = as_string_seq(
                old.get(k.clone()).unwrap_or(&Value::Sequence(Vec::new())),
            );
            union.extend(as_string_seq(v));
            union.sort();
            union.dedup();
            out.insert(
                k.clone(),
                Value::Sequence(union.into_iter().map(Value::String).collect()),
            );
        } else {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Mapping(out)
}

fn mapping_entries(value: Option<&Value>) -> Vec<(String, Value)> {
    value
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

/// Apply the field-specific merge strategies over the graph.
pub fn merge(graph: &ImportGraph) -> Result<MergedConfig, CompileError> {
    let root = graph.root();
    let root_fm = &root.source.frontmatter;
    let mut merged = MergedConfig::default();

    // Root-only fields.
    merged.on = root_fm.get("on").cloned();
    merged.github_token = root_fm.get_str("github-token").map(str::to_string);
    merged.runs_on = root_fm.get("runs-on").cloned();
    merged.timeout_minutes = root_fm
        .get_u64("timeout-minutes")
        .or_else(|| root_fm.get_u64("timeout_minutes"));
    merged.roles = root_fm
        .get("roles")
        .map(as_string_seq)
        .unwrap_or_default();
    merged.permissions = root_fm
        .get("permissions")
        .map(PermissionsSpec::parse)
        .unwrap_or_default();

    for node in &graph.nodes {
        let fm = &node.source.frontmatter;
        let who = node.manifest_entry.as_str();
        let is_root = node.identity == graph.root().identity;

        // engine: root wins, else nearest import.
        if merged.engine.is_none()
            && let Some(engine) = fm.get("engine")
        {
            merged.engine = Some(engine.clone());
            merged.record("engine", who);
        }

        // tools / mcp-servers: keyed merge, later entries override,
        // allow-lists union.
        for (field, target) in [("tools", 0usize), ("mcp-servers", 1usize)] {
            for (name, config) in mapping_entries(fm.get(field)) {
                let map = if target == 0 {
                    &mut merged.tools
                } else {
                    &mut merged.mcp_servers
                };
                let value = match map.get(&name) {
                    Some(existing) => merge_tool_config(existing, &config),
                    None => config,
                };
                map.insert(name.clone(), value);
                merged.record(format!("{field}.{name}"), who);
            }
        }

        // network.allowed: union + sort + dedup (applied at the end).
        if let Some(network) = fm.get("network").and_then(Value::as_mapping)
            && let Some(allowed) = network.get(Value::String("allowed".to_string()))
        {
            merged.network_allowed.extend(as_string_seq(allowed));
            merged.record("network.allowed", who);
        }

        // permissions: validated, not merged. Every permission an import
        // requires must be satisfied at the root.
        if !is_root
            && let Some(perms) = fm.get("permissions")
        {
            let required = PermissionsSpec::parse(perms);
            if let Some(all) = &required.all {
                let level = if all == "write-all" { "write" } else { "read" };
                for scope in ["contents", "issues", "pull-requests"] {
                    check_permission(&merged.permissions, scope, level, who, graph.root())?;
                }
            }
            for (scope, level) in &required.map {
                check_permission(&merged.permissions, scope, level, who, graph.root())?;
            }
        }

        // safe-outputs: root document replaces per-kind entries entirely;
        // imports only fill gaps.
        if let Some(outputs) = fm.get("safe-outputs").and_then(Value::as_mapping) {
            for (key, value) in outputs {
                let Some(key) = key.as_str() else { continue };
                match key {
                    "github-token" => {
                        if is_root || merged.safe_outputs.github_token.is_none() {
                            merged.safe_outputs.github_token =
                                value.as_str().map(str::to_string);
                            merged.record("safe-outputs.github-token", who);
                        }
                    }
                    "threat-detection" => {
                        if is_root || merged.safe_outputs.threat_detection.is_none() {
                            merged.safe_outputs.threat_detection = Some(value.clone());
                            merged.record("safe-outputs.threat-detection", who);
                        }
                    }
                    "jobs" => {
                        for (name, job) in mapping_entries(Some(value)) {
                            if is_root || !merged.safe_outputs.jobs.contains_key(&name) {
                                merged.safe_outputs.jobs.insert(name.clone(), job);
                                merged.record(format!("safe-outputs.jobs.{name}"), who);
                            }
                        }
                    }
                    kind => {
                        let occupied = merged.safe_outputs.entries.contains_key(kind);
                        if is_root || !occupied {
                            merged
                                .safe_outputs
                                .entries
                                .insert(kind.to_string(), value.clone());
                            merged.record(format!("safe-outputs.{kind}"), who);
                        }
                    }
                }
            }
        }

        // runtimes.<name>.version: root wins, else nearest import.
        for (name, config) in mapping_entries(fm.get("runtimes")) {
            match merged.runtimes.get_mut(&name) {
                None => {
                    merged.runtimes.insert(name.clone(), config);
                    merged.record(format!("runtimes.{name}"), who);
                }
                Some(existing) => {
                    // Earlier (nearer) sources already set it; fill only
                    // missing sub-keys.
                    if let (Some(old), Some(new)) =
                        (existing.as_mapping().cloned(), config.as_mapping())
                    {
                        let mut out = old;
                        for (k, v) in new {
                            if !out.contains_key(k.clone()) {
                                out.insert(k.clone(), v.clone());
                            }
                        }
                        *existing = Value::Mapping(out);
                    }
                }
            }
        }

        // jobs: keyed merge, later entries override earlier.
        for (name, job) in mapping_entries(fm.get("jobs")) {
            merged.jobs.insert(name.clone(), job);
            merged.record(format!("jobs.{name}"), who);
        }
    }

    merged.network_allowed.sort();
    merged.network_allowed.dedup();

    Ok(merged)
}

fn check_permission(
    root_perms: &PermissionsSpec,
    scope: &str,
    level: &str,
    import_identity: &str,
    root: &crate::types::ResolvedImport,
) -> Result<(), CompileError> {
    if root_perms.satisfies(scope, level) {
        return Ok(());
    }
    Err(CompileError::Merge(
        diagnostic(
            Category::Merge,
            &root.source.path,
            format!(
                "import `{import_identity}` requires permission `{scope}: {level}` which is not granted at the root"
            ),
        )
        .at(format!("permissions.{scope}"))
        .suggest(format!("add `{scope}: {level}` to the root `permissions:` block")),
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::frontmatter::parse_bytes;
    use crate::types::{ImportGraph, ResolvedImport, WorkflowSource};

    fn source(name: &str, content: &str) -> WorkflowSource {
        parse_bytes(&PathBuf::from(name), content, false).expect("parse")
    }

    fn graph(sources: Vec<WorkflowSource>) -> ImportGraph {
        let nodes = sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| ResolvedImport {
                identity: format!("node-{i}"),
                manifest_entry: format!("entry-{i}"),
                commit: None,
                reference: None,
                is_agent: false,
                source,
            })
            .collect();
        ImportGraph { nodes }
    }

    #[test]
    fn root_fields_pass_through() {
        let g = graph(vec![source(
            "wf.md",
            "---\non: push\nengine: copilot\npermissions:\n  contents: read\ntimeout-minutes: 30\n---\n",
        )]);
        let merged = merge(&g).expect("merge");
        assert!(merged.on.is_some());
        assert_eq!(merged.timeout_minutes, Some(30));
        assert!(merged.permissions.satisfies("contents", "read"));
        assert!(!merged.permissions.satisfies("contents", "write"));
    }

    #[test]
    fn deprecated_timeout_spelling_still_reads() {
        let g = graph(vec![source("wf.md", "---\non: push\ntimeout_minutes: 10\n---\n")]);
        let merged = merge(&g).expect("merge");
        assert_eq!(merged.timeout_minutes, Some(10));
    }

    #[test]
    fn tools_merge_by_key_with_later_override() {
        let g = graph(vec![
            source(
                "wf.md",
                "---\non: push\ntools:\n  github:\n    version: v1\n---\n",
            ),
            source(
                "import.md",
                "---\ntools:\n  github:\n    version: v2\n  extra:\n    version: v1\n---\n",
            ),
        ]);
        let merged = merge(&g).expect("merge");
        assert_eq!(merged.tools.len(), 2);
        let github = merged.tools.get("github").and_then(Value::as_mapping).unwrap();
        assert_eq!(
            github
                .get(Value::String("version".to_string()))
                .and_then(Value::as_str),
            Some("v2"),
            "later-encountered entry overrides"
        );
    }

    #[test]
    fn tool_allow_lists_are_unioned_and_deduped() {
        let g = graph(vec![
            source(
                "wf.md",
                "---\non: push\ntools:\n  bash:\n    allowed: [ls, cat]\n---\n",
            ),
            source("import.md", "---\ntools:\n  bash:\n    allowed: [cat, rm]\n---\n"),
        ]);
        let merged = merge(&g).expect("merge");
        let bash = merged.tools.get("bash").and_then(Value::as_mapping).unwrap();
        let allowed: Vec<&str> = bash
            .get(Value::String("allowed".to_string()))
            .and_then(Value::as_sequence)
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(allowed, vec!["cat", "ls", "rm"]);
    }

    #[test]
    fn network_allowed_is_union_sorted_deduped() {
        let g = graph(vec![
            source(
                "wf.md",
                "---\non: push\nnetwork:\n  allowed: [example.com, api.example.com]\n---\n",
            ),
            source(
                "import.md",
                "---\nnetwork:\n  allowed: [example.com, cdn.example.com]\n---\n",
            ),
        ]);
        let merged = merge(&g).expect("merge");
        assert_eq!(
            merged.network_allowed,
            vec!["api.example.com", "cdn.example.com", "example.com"]
        );
    }

    #[test]
    fn import_permission_not_granted_at_root_is_a_conflict() {
        let g = graph(vec![
            source("wf.md", "---\non: push\npermissions:\n  contents: read\n---\n"),
            source("import.md", "---\npermissions:\n  issues: write\n---\n"),
        ]);
        let err = merge(&g).expect_err("conflict");
        let msg = err.to_string();
        assert!(msg.contains("issues: write"), "{msg}");
        assert!(msg.contains("entry-1"), "blames the import: {msg}");
    }

    #[test]
    fn root_write_satisfies_import_read() {
        let g = graph(vec![
            source("wf.md", "---\non: push\npermissions:\n  contents: write\n---\n"),
            source("import.md", "---\npermissions:\n  contents: read\n---\n"),
        ]);
        assert!(merge(&g).is_ok());
    }

    #[test]
    fn safe_outputs_root_replaces_import_entirely() {
        let g = graph(vec![
            source(
                "wf.md",
                "---\non: push\nsafe-outputs:\n  create-issue:\n    max: 3\n---\n",
            ),
            source(
                "import.md",
                "---\nsafe-outputs:\n  create-issue:\n    max: 9\n    labels: [x]\n  add-comment: {}\n---\n",
            ),
        ]);
        let merged = merge(&g).expect("merge");
        let issue = merged
            .safe_outputs
            .entries
            .get("create-issue")
            .and_then(Value::as_mapping)
            .unwrap();
        assert_eq!(
            issue.get(Value::String("max".to_string())).and_then(Value::as_u64),
            Some(3),
            "root config is taken verbatim"
        );
        assert!(
            !issue.contains_key(Value::String("labels".to_string())),
            "no field-level mixing with the import"
        );
        assert!(merged.safe_outputs.entries.contains_key("add-comment"));
    }

    #[test]
    fn runtime_version_root_wins_else_nearest() {
        let g = graph(vec![
            source("wf.md", "---\non: push\nruntimes:\n  node:\n    version: '20'\n---\n"),
            source("a.md", "---\nruntimes:\n  node:\n    version: '18'\n  python:\n    version: '3.12'\n---\n"),
            source("b.md", "---\nruntimes:\n  python:\n    version: '3.10'\n---\n"),
        ]);
        let merged = merge(&g).expect("merge");
        let version = |name: &str| {
            merged
                .runtimes
                .get(name)
                .and_then(Value::as_mapping)
                .and_then(|m| m.get(Value::String("version".to_string())))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        assert_eq!(version("node").as_deref(), Some("20"));
        assert_eq!(version("python").as_deref(), Some("3.12"), "nearest import wins");
    }

    #[test]
    fn user_jobs_merge_with_later_override() {
        let g = graph(vec![
            source("wf.md", "---\non: push\njobs:\n  lint:\n    runs-on: ubuntu-latest\n---\n"),
            source("lib.yml", "---\njobs:\n  lint:\n    runs-on: macos-latest\n  test:\n    runs-on: ubuntu-latest\n---\n"),
        ]);
        let merged = merge(&g).expect("merge");
        assert_eq!(merged.jobs.len(), 2);
        let lint = merged.jobs.get("lint").and_then(Value::as_mapping).unwrap();
        assert_eq!(
            lint.get(Value::String("runs-on".to_string())).and_then(Value::as_str),
            Some("macos-latest")
        );
    }

    #[test]
    fn trace_attributes_contributions() {
        let g = graph(vec![
            source("wf.md", "---\non: push\n---\n"),
            source("import.md", "---\ntools:\n  github: {}\n---\n"),
        ]);
        let merged = merge(&g).expect("merge");
        assert_eq!(merged.contributed_by("tools.github"), Some("entry-1"));
    }

    #[test]
    fn pre_activation_triggers() {
        let none = graph(vec![source("wf.md", "---\non: push\n---\n")]);
        assert!(!merge(&none).unwrap().needs_pre_activation());

        let roles = graph(vec![source("wf.md", "---\non: push\nroles: [admin]\n---\n")]);
        assert!(merge(&roles).unwrap().needs_pre_activation());

        let slash = graph(vec![source(
            "wf.md",
            "---\non:\n  slash_command: review\n---\n",
        )]);
        assert!(merge(&slash).unwrap().needs_pre_activation());
    }

    #[test]
    fn threat_detection_enabled_forms() {
        let explicit = graph(vec![source(
            "wf.md",
            "---\non: push\nsafe-outputs:\n  threat-detection:\n    enabled: true\n---\n",
        )]);
        assert!(merge(&explicit).unwrap().safe_outputs.threat_detection_enabled());

        let disabled = graph(vec![source(
            "wf.md",
            "---\non: push\nsafe-outputs:\n  threat-detection:\n    enabled: false\n---\n",
        )]);
        assert!(!merge(&disabled).unwrap().safe_outputs.threat_detection_enabled());

        let boolean = graph(vec![source(
            "wf.md",
            "---\non: push\nsafe-outputs:\n  threat-detection: true\n---\n",
        )]);
        assert!(merge(&boolean).unwrap().safe_outputs.threat_detection_enabled());
    }
}
