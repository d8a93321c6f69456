//! The closed set of safe-output kinds and their per-kind contracts.
//!
//! A safe output is a typed write operation performed in its own job with
//! the minimum permissions for that operation, instead of granting write
//! access to the agent job. Each kind carries: its frontmatter config key,
//! the synthesized job name, the permissions that job receives, the token
//! precedence sources, and the set of accepted configuration fields.
//!
//! At runtime the handler consumes JSONL entries of the form
//! `{"type": "<kind>", ...}` (plus an optional `temporary_id` for
//! cross-referencing create-class outputs); the compiler only ships the
//! handler its configuration via `GH_AW_SAFE_OUTPUTS_HANDLER_CONFIG`.

use serde_json::json;
use serde_yaml::Value as Yaml;

/// Closed variant set; one synthesized job per enabled kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SafeOutputKind {
    CreateIssue,
    AddComment,
    CreatePullRequest,
    CreatePullRequestReviewComment,
    CreateDiscussion,
    AddLabels,
    AssignToAgent,
    AssignMilestone,
    UpdateIssue,
    UpdateRelease,
    PushToPullRequestBranch,
    UploadAsset,
    UpdateProject,
    CreateProjectStatusUpdate,
    DispatchWorkflow,
    MissingTool,
    MissingData,
    Noop,
}

pub const ALL_KINDS: &[SafeOutputKind] = &[
    SafeOutputKind::CreateIssue,
    SafeOutputKind::AddComment,
    SafeOutputKind::CreatePullRequest,
    SafeOutputKind::CreatePullRequestReviewComment,
    SafeOutputKind::CreateDiscussion,
    SafeOutputKind::AddLabels,
    SafeOutputKind::AssignToAgent,
    SafeOutputKind::AssignMilestone,
    SafeOutputKind::UpdateIssue,
    SafeOutputKind::UpdateRelease,
    SafeOutputKind::PushToPullRequestBranch,
    SafeOutputKind::UploadAsset,
    SafeOutputKind::UpdateProject,
    SafeOutputKind::CreateProjectStatusUpdate,
    SafeOutputKind::DispatchWorkflow,
    SafeOutputKind::MissingTool,
    SafeOutputKind::MissingData,
    SafeOutputKind::Noop,
];

/// Config fields accepted on every kind.
const COMMON_FIELDS: &[&str] = &["max", "expires", "github-token", "target-repo"];

impl SafeOutputKind {
    /// The `safe-outputs.<key>` frontmatter key.
    pub fn config_key(&self) -> &'static str {
        match self {
            SafeOutputKind::CreateIssue => "create-issue",
            SafeOutputKind::AddComment => "add-comment",
            SafeOutputKind::CreatePullRequest => "create-pull-request",
            SafeOutputKind::CreatePullRequestReviewComment => {
                "create-pull-request-review-comment"
            }
            SafeOutputKind::CreateDiscussion => "create-discussion",
            SafeOutputKind::AddLabels => "add-labels",
            SafeOutputKind::AssignToAgent => "assign-to-agent",
            SafeOutputKind::AssignMilestone => "assign-milestone",
            SafeOutputKind::UpdateIssue => "update-issue",
            SafeOutputKind::UpdateRelease => "update-release",
            SafeOutputKind::PushToPullRequestBranch => "push-to-pull-request-branch",
            SafeOutputKind::UploadAsset => "upload-asset",
            SafeOutputKind::UpdateProject => "update-project",
            SafeOutputKind::CreateProjectStatusUpdate => "create-project-status-update",
            SafeOutputKind::DispatchWorkflow => "dispatch-workflow",
            SafeOutputKind::MissingTool => "missing-tool",
            SafeOutputKind::MissingData => "missing-data",
            SafeOutputKind::Noop => "noop",
        }
    }

    pub fn from_config_key(key: &str) -> Option<SafeOutputKind> {
        ALL_KINDS.iter().copied().find(|k| k.config_key() == key)
    }

    /// The synthesized job name: the config key with `-` mapped to `_`.
    pub fn job_name(&self) -> String {
        self.config_key().replace('-', "_")
    }

    /// Minimal permissions the synthesized job declares.
    pub fn permissions(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            SafeOutputKind::CreateIssue
            | SafeOutputKind::UpdateIssue
            | SafeOutputKind::AssignMilestone
            | SafeOutputKind::AssignToAgent => &[("contents", "read"), ("issues", "write")],
            SafeOutputKind::AddComment | SafeOutputKind::AddLabels => &[
                ("contents", "read"),
                ("issues", "write"),
                ("pull-requests", "write"),
            ],
            SafeOutputKind::CreatePullRequest => {
                &[("contents", "write"), ("pull-requests", "write")]
            }
            SafeOutputKind::CreatePullRequestReviewComment => {
                &[("contents", "read"), ("pull-requests", "write")]
            }
            SafeOutputKind::CreateDiscussion => {
                &[("contents", "read"), ("discussions", "write")]
            }
            SafeOutputKind::UpdateRelease | SafeOutputKind::UploadAsset => {
                &[("contents", "write")]
            }
            SafeOutputKind::PushToPullRequestBranch => {
                &[("contents", "write"), ("pull-requests", "read")]
            }
            SafeOutputKind::UpdateProject | SafeOutputKind::CreateProjectStatusUpdate => {
                &[("contents", "read"), ("repository-projects", "write")]
            }
            SafeOutputKind::DispatchWorkflow => &[("actions", "write"), ("contents", "read")],
            SafeOutputKind::MissingTool | SafeOutputKind::MissingData | SafeOutputKind::Noop => {
                &[("contents", "read")]
            }
        }
    }

    /// Kind-specific config fields, in addition to [`COMMON_FIELDS`].
    pub fn specific_fields(&self) -> &'static [&'static str] {
        match self {
            SafeOutputKind::CreateIssue => &["labels", "title-prefix", "assignees"],
            SafeOutputKind::AddComment => &["target"],
            SafeOutputKind::CreatePullRequest => {
                &["labels", "title-prefix", "draft", "base-branch"]
            }
            SafeOutputKind::CreatePullRequestReviewComment => &["side"],
            SafeOutputKind::CreateDiscussion => &["category", "title-prefix"],
            SafeOutputKind::AddLabels => &["allowed", "target"],
            SafeOutputKind::AssignToAgent => &["agent"],
            SafeOutputKind::AssignMilestone => &["target"],
            SafeOutputKind::UpdateIssue => &["target", "status", "title", "body"],
            SafeOutputKind::UpdateRelease => &["target"],
            SafeOutputKind::PushToPullRequestBranch => &["branch", "if-no-changes"],
            SafeOutputKind::UploadAsset => &["max-size", "branch"],
            SafeOutputKind::UpdateProject => &["project-url"],
            SafeOutputKind::CreateProjectStatusUpdate => &["project-url"],
            SafeOutputKind::DispatchWorkflow => &["workflow", "inputs"],
            SafeOutputKind::MissingTool | SafeOutputKind::MissingData | SafeOutputKind::Noop => {
                &[]
            }
        }
    }

    pub fn accepts_field(&self, field: &str) -> bool {
        COMMON_FIELDS.contains(&field) || self.specific_fields().contains(&field)
    }

    /// Projects-v2 kinds carry a second handler-config env variable and
    /// never fall back to the auto-provided token.
    pub fn is_project_kind(&self) -> bool {
        matches!(
            self,
            SafeOutputKind::UpdateProject | SafeOutputKind::CreateProjectStatusUpdate
        )
    }

    /// The designated secret consulted after the explicit token chain.
    pub fn designated_secret(&self) -> &'static str {
        if self.is_project_kind() {
            "GH_AW_PROJECT_GITHUB_TOKEN"
        } else if matches!(self, SafeOutputKind::AssignToAgent) {
            "GH_AW_AGENT_TOKEN"
        } else if matches!(self, SafeOutputKind::DispatchWorkflow) {
            "COPILOT_GITHUB_TOKEN"
        } else {
            "GH_AW_GITHUB_TOKEN"
        }
    }

    /// Whether the auto-provided `GITHUB_TOKEN` is an acceptable last
    /// resort. Agent assignment and Projects-v2 must not fall back to it.
    pub fn allows_default_token(&self) -> bool {
        !self.is_project_kind() && !matches!(self, SafeOutputKind::AssignToAgent)
    }

    /// The ordered token sources for this kind, as GitHub Actions
    /// expressions (without the `${{ }}` wrapper). The first non-empty one
    /// wins at runtime.
    pub fn token_sources(
        &self,
        per_output_token: Option<&str>,
        safe_outputs_token: Option<&str>,
        workflow_token: Option<&str>,
    ) -> Vec<String> {
        let mut sources = Vec::new();
        for configured in [per_output_token, safe_outputs_token, workflow_token]
            .into_iter()
            .flatten()
        {
            // Configured values are `${{ ... }}` expressions; strip the
            // wrapper so the chain can be re-wrapped once.
            sources.push(strip_expression_wrapper(configured));
        }
        sources.push(format!("secrets.{}", self.designated_secret()));
        if self.allows_default_token() {
            sources.push("github.token".to_string());
        }
        sources
    }
}

fn strip_expression_wrapper(value: &str) -> String {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Render the token precedence chain as one GitHub Actions expression.
/// `a || b || c` picks the first non-empty value at runtime.
pub fn token_expression(sources: &[String]) -> String {
    format!("${{{{ {} }}}}", sources.join(" || "))
}

/// Convert user-authored YAML config to JSON, preserving values verbatim.
pub fn yaml_to_json(value: &Yaml) -> serde_json::Value {
    match value {
        Yaml::Null => serde_json::Value::Null,
        Yaml::Bool(b) => json!(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!(i)
            } else if let Some(u) = n.as_u64() {
                json!(u)
            } else {
                json!(n.as_f64())
            }
        }
        Yaml::String(s) => json!(s),
        Yaml::Sequence(seq) => {
            serde_json::Value::Array(seq.iter().map(yaml_to_json).collect())
        }
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    Yaml::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        Yaml::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

/// Build the handler configuration JSON for one kind (§ handler contract):
/// keys are normalized to snake_case, values are the user's configuration
/// verbatim.
pub fn handler_config(kind: SafeOutputKind, config: &Yaml) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    if let Yaml::Mapping(map) = config {
        for (k, v) in map {
            if let Some(key) = k.as_str() {
                object.insert(key.replace('-', "_"), yaml_to_json(v));
            }
        }
    }
    let mut wrapper = serde_json::Map::new();
    wrapper.insert(
        kind.config_key().replace('-', "_"),
        serde_json::Value::Object(object),
    );
    serde_json::Value::Object(wrapper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_set_is_closed_and_complete() {
        assert_eq!(ALL_KINDS.len(), 18);
        for kind in ALL_KINDS {
            assert_eq!(SafeOutputKind::from_config_key(kind.config_key()), Some(*kind));
        }
        assert_eq!(SafeOutputKind::from_config_key("create-widget"), None);
    }

    #[test]
    fn job_names_are_snake_case() {
        assert_eq!(SafeOutputKind::CreateIssue.job_name(), "create_issue");
        assert_eq!(
            SafeOutputKind::PushToPullRequestBranch.job_name(),
            "push_to_pull_request_branch"
        );
    }

    #[test]
    fn create_issue_permissions_are_minimal() {
        let perms = SafeOutputKind::CreateIssue.permissions();
        assert!(perms.contains(&("issues", "write")));
        assert!(perms.contains(&("contents", "read")));
        assert!(!perms.iter().any(|(scope, _)| *scope == "pull-requests"));
    }

    #[test]
    fn project_and_agent_kinds_never_fall_back_to_default_token() {
        assert!(!SafeOutputKind::UpdateProject.allows_default_token());
        assert!(!SafeOutputKind::CreateProjectStatusUpdate.allows_default_token());
        assert!(!SafeOutputKind::AssignToAgent.allows_default_token());
        assert!(SafeOutputKind::CreateIssue.allows_default_token());
    }

    #[test]
    fn token_chain_precedence_order() {
        let sources = SafeOutputKind::CreateIssue.token_sources(
            Some("${{ secrets.PER_OUTPUT }}"),
            Some("${{ secrets.GLOBAL }}"),
            Some("${{ secrets.WORKFLOW }}"),
        );
        assert_eq!(
            sources,
            vec![
                "secrets.PER_OUTPUT",
                "secrets.GLOBAL",
                "secrets.WORKFLOW",
                "secrets.GH_AW_GITHUB_TOKEN",
                "github.token",
            ]
        );
    }

    #[test]
    fn agent_assignment_chain_ends_at_designated_secret() {
        let sources = SafeOutputKind::AssignToAgent.token_sources(None, None, None);
        assert_eq!(sources, vec!["secrets.GH_AW_AGENT_TOKEN"]);
    }

    #[test]
    fn project_kind_uses_project_secret() {
        let sources = SafeOutputKind::UpdateProject.token_sources(None, None, None);
        assert_eq!(sources, vec!["secrets.GH_AW_PROJECT_GITHUB_TOKEN"]);
    }

    #[test]
    fn token_expression_renders_fallback_chain() {
        let expr = token_expression(&[
            "secrets.A".to_string(),
            "github.token".to_string(),
        ]);
        assert_eq!(expr, "${{ secrets.A || github.token }}");
    }

    #[test]
    fn field_acceptance() {
        assert!(SafeOutputKind::CreateIssue.accepts_field("max"));
        assert!(SafeOutputKind::CreateIssue.accepts_field("title-prefix"));
        assert!(SafeOutputKind::CreateIssue.accepts_field("target-repo"));
        assert!(!SafeOutputKind::CreateIssue.accepts_field("branch"));
        assert!(SafeOutputKind::UploadAsset.accepts_field("max-size"));
    }

    #[test]
    fn handler_config_normalizes_keys_to_snake_case() {
        let config: Yaml = serde_yaml::from_str(
            "target-repo: other/repo\nmax: 3\ntitle-prefix: '[bot] '\n",
        )
        .expect("yaml");
        let json = handler_config(SafeOutputKind::CreateIssue, &config);
        let inner = json.get("create_issue").expect("wrapper key");
        assert_eq!(inner.get("target_repo"), Some(&serde_json::json!("other/repo")));
        assert_eq!(inner.get("max"), Some(&serde_json::json!(3)));
        assert_eq!(inner.get("title_prefix"), Some(&serde_json::json!("[bot] ")));
    }

    #[test]
    fn yaml_to_json_preserves_scalars() {
        let yaml: Yaml = serde_yaml::from_str("a: [1, two, true]\n").expect("yaml");
        let json = yaml_to_json(&yaml);
        assert_eq!(json, serde_json::json!({"a": [1, "two", true]}));
    }
}
