//! Job synthesis: the fixed pipeline of compiler-generated jobs plus
//! user-defined jobs, lowered to emit-ready nodes.
//!
//! Pipeline: `pre_activation` (cheap guards) → `activation` (sanitized
//! context) → `agent` (engine execution) → `detection` (output scanning)
//! → one job per enabled safe-output kind → `conclusion` (summary). User
//! jobs hang off `activation` unless they declare their own `needs:`.

use serde_yaml::Value;

use crate::diag::CompileError;
use crate::emit::{Node, sort_job_keys};
use crate::graph::{JobNode, layer};
use crate::merge::MergedConfig;
use crate::pins::Pinner;
use crate::safe_outputs::{SafeOutputKind, handler_config, token_expression};
use crate::security::expand_allowlist;
use crate::types::WorkflowSource;

const DEFAULT_RUNNER: &str = "ubuntu-latest";
const DEFAULT_TIMEOUT_MINUTES: u64 = 15;
const SAFE_OUTPUTS_PATH: &str = "/tmp/gh-aw/safe-outputs.jsonl";

/// One synthesized or user job, ready for ordering and emission.
#[derive(Debug, Clone)]
pub struct BuiltJob {
    pub node: JobNode,
    pub rendered: Node,
}

pub struct JobBuilder<'a, 'p> {
    pub source: &'a WorkflowSource,
    pub merged: &'a MergedConfig,
    pub pinner: &'a mut Pinner<'p>,
    /// Display path recorded in `GH_AW_WORKFLOW_FILE`.
    pub source_display: String,
    /// The effective agent prompt: the root body followed by imported
    /// bodies, in manifest order.
    pub prompt: String,
}

impl JobBuilder<'_, '_> {
    /// Build every job for this workflow.
    pub fn build(&mut self) -> Result<Vec<BuiltJob>, CompileError> {
        let merged = self.merged;
        let mut jobs: Vec<BuiltJob> = Vec::new();

        let has_pre_activation = merged.needs_pre_activation();
        let gate = has_pre_activation
            .then(|| "needs.pre_activation.outputs.activated == 'true'".to_string());

        if has_pre_activation {
            jobs.push(self.pre_activation_job()?);
        }
        jobs.push(self.activation_job(has_pre_activation, gate.as_deref())?);
        jobs.push(self.agent_job(gate.as_deref())?);

        let detection = merged.safe_outputs.threat_detection_enabled();
        if detection {
            jobs.push(self.detection_job(gate.as_deref())?);
        }

        let mut safe_output_names: Vec<String> = Vec::new();
        for (key, config) in &merged.safe_outputs.entries {
            let Some(kind) = SafeOutputKind::from_config_key(key) else {
                continue; // schema validation already rejected unknown kinds
            };
            let job = self.safe_output_job(kind, config, detection, gate.as_deref())?;
            safe_output_names.push(job.node.name.clone());
            jobs.push(job);
        }

        // safe-outputs.jobs: user consumers of agent output.
        for (name, config) in &merged.safe_outputs.jobs {
            jobs.push(self.user_job(name, config, "agent")?);
            safe_output_names.push(name.clone());
        }

        if !safe_output_names.is_empty() {
            jobs.push(self.conclusion_job(&safe_output_names)?);
        }

        for (name, config) in &merged.jobs {
            jobs.push(self.user_job(name, config, "activation")?);
        }

        Ok(jobs)
    }

    fn runs_on(&self) -> Node {
        match &self.merged.runs_on {
            Some(value) => Node::from_yaml(value),
            None => Node::str(DEFAULT_RUNNER),
        }
    }

    fn timeout(&self) -> i64 {
        self.merged
            .timeout_minutes
            .unwrap_or(DEFAULT_TIMEOUT_MINUTES) as i64
    }

    fn permissions_node(entries: &[(&str, &str)]) -> Node {
        Node::Map(
            entries
                .iter()
                .map(|(scope, level)| (scope.to_string(), Node::str(*level)))
                .collect(),
        )
    }

    fn pinned_uses(&mut self, reference: &str) -> Result<Node, CompileError> {
        let pinned = self.pinner.pin(&self.source.path, reference)?;
        let (value, comment) = pinned.uses_value();
        Ok(Node::commented(value, comment))
    }

    fn checkout_step(&mut self) -> Result<Node, CompileError> {
        Ok(Node::map(vec![
            ("name", Node::str("Checkout repository")),
            ("uses", self.pinned_uses("actions/checkout@v4")?),
            (
                "with",
                Node::map(vec![("persist-credentials", Node::Bool(false))]),
            ),
        ]))
    }

    fn github_script_step(
        &mut self,
        name: &str,
        id: Option<&str>,
        script: &str,
    ) -> Result<Node, CompileError> {
        let mut entries = vec![("name", Node::str(name))];
        if let Some(id) = id {
            entries.push(("id", Node::str(id)));
        }
        entries.push(("uses", self.pinned_uses("actions/github-script@v7")?));
        entries.push(("with", Node::map(vec![("script", Node::str(script))])));
        Ok(Node::map(entries))
    }

    fn base_job(
        &self,
        needs: &[&str],
        cond: Option<&str>,
        permissions: Node,
        timeout: i64,
    ) -> Vec<(String, Node)> {
        let mut entries: Vec<(String, Node)> = Vec::new();
        if !needs.is_empty() {
            entries.push((
                "needs".to_string(),
                Node::Seq(needs.iter().map(|n| Node::str(*n)).collect()),
            ));
        }
        if let Some(cond) = cond {
            entries.push(("if".to_string(), Node::str(cond)));
        }
        entries.push(("runs-on".to_string(), self.runs_on()));
        entries.push(("permissions".to_string(), permissions));
        entries.push(("timeout-minutes".to_string(), Node::Int(timeout)));
        entries
    }

    fn pre_activation_job(&mut self) -> Result<BuiltJob, CompileError> {
        let mut script = String::new();
        if !self.merged.roles.is_empty() {
            script.push_str(&format!(
                "const allowed = {};\nconst assoc = context.payload.comment?.author_association ?? context.payload.sender?.type ?? '';\nif (!allowed.includes(assoc.toLowerCase())) {{\n  core.setOutput('activated', 'false');\n  return;\n}}\n",
                serde_json::to_string(&self.merged.roles).unwrap_or_else(|_| "[]".to_string())
            ));
        }
        if let Some(stop_after) = self.merged.on_field("stop-after").and_then(Value::as_str) {
            script.push_str(&format!(
                "if (new Date() > new Date('{stop_after}')) {{\n  core.setOutput('activated', 'false');\n  return;\n}}\n"
            ));
        }
        if let Some(command) = self.merged.on_field("slash_command").and_then(Value::as_str) {
            script.push_str(&format!(
                "const body = context.payload.comment?.body ?? '';\nif (!body.trimStart().startsWith('/{command}')) {{\n  core.setOutput('activated', 'false');\n  return;\n}}\n"
            ));
        }
        script.push_str("core.setOutput('activated', 'true');\n");

        let mut entries = self.base_job(
            &[],
            None,
            Self::permissions_node(&[("contents", "read")]),
            5,
        );
        entries.push((
            "outputs".to_string(),
            Node::map(vec![(
                "activated",
                Node::str("${{ steps.check.outputs.activated }}"),
            )]),
        ));
        entries.push((
            "steps".to_string(),
            Node::Seq(vec![self.github_script_step(
                "Check activation conditions",
                Some("check"),
                &script,
            )?]),
        ));

        Ok(BuiltJob {
            node: JobNode {
                name: "pre_activation".to_string(),
                needs: Vec::new(),
                layer: layer::PRE_ACTIVATION,
            },
            rendered: Node::Map(entries),
        })
    }

    fn activation_job(
        &mut self,
        has_pre_activation: bool,
        gate: Option<&str>,
    ) -> Result<BuiltJob, CompileError> {
        let needs: Vec<&str> = if has_pre_activation {
            vec!["pre_activation"]
        } else {
            Vec::new()
        };

        let sanitize_script = "\
const payload = context.payload;\n\
const raw = [payload.issue?.title, payload.issue?.body, payload.comment?.body, payload.pull_request?.title, payload.pull_request?.body]\n\
  .filter(Boolean)\n\
  .join('\\n\\n');\n\
const sanitized = raw\n\
  .replace(/[\\u0000-\\u0008\\u000b-\\u001f]/g, '')\n\
  .replace(/@(?=[a-zA-Z0-9])/g, '@\\u200b')\n\
  .slice(0, 65000);\n\
core.setOutput('text', sanitized);\n";

        let freshness_script = "\
set -euo pipefail\n\
actual=\"$(sha256sum \"$GH_AW_WORKFLOW_FILE\" | cut -d' ' -f1)\"\n\
if [ \"$actual\" != \"$GH_AW_WORKFLOW_SHA\" ]; then\n\
  echo \"::warning::lock file is stale; re-run the workflow compiler\"\n\
fi\n";

        let mut steps = vec![self.checkout_step()?];
        steps.push(Node::map(vec![
            ("name", Node::str("Verify lock file freshness")),
            ("run", Node::str(freshness_script)),
            (
                "env",
                Node::map(vec![
                    ("GH_AW_WORKFLOW_FILE", Node::str(&self.source_display)),
                    ("GH_AW_WORKFLOW_SHA", Node::str(&self.source.sha)),
                ]),
            ),
        ]));
        steps.push(self.github_script_step(
            "Sanitize event context",
            Some("sanitize"),
            sanitize_script,
        )?);
        if self.merged.on_field("reaction").is_some() {
            let reaction_script = "\
if (context.payload.comment) {\n\
  await github.rest.reactions.createForIssueComment({\n\
    ...context.repo,\n\
    comment_id: context.payload.comment.id,\n\
    content: 'eyes',\n\
  });\n\
}\n";
            steps.push(self.github_script_step(
                "Acknowledge with reaction",
                None,
                reaction_script,
            )?);
        }

        let mut entries = self.base_job(
            &needs,
            gate,
            Self::permissions_node(&[("contents", "read")]),
            5,
        );
        entries.push((
            "outputs".to_string(),
            Node::map(vec![(
                "text",
                Node::str("${{ steps.sanitize.outputs.text }}"),
            )]),
        ));
        entries.push(("steps".to_string(), Node::Seq(steps)));

        Ok(BuiltJob {
            node: JobNode {
                name: "activation".to_string(),
                needs: needs.iter().map(|s| s.to_string()).collect(),
                layer: layer::ACTIVATION,
            },
            rendered: Node::Map(entries),
        })
    }

    fn engine_command(&self) -> String {
        let id = match &self.merged.engine {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Mapping(m)) => m
                .get(Value::String("id".to_string()))
                .and_then(Value::as_str)
                .unwrap_or("copilot")
                .to_string(),
            _ => "copilot".to_string(),
        };
        match id.as_str() {
            "claude" => "claude -p \"$GH_AW_PROMPT\" --output-format stream-json > \"$GH_AW_SAFE_OUTPUTS\"".to_string(),
            "codex" => "codex exec \"$GH_AW_PROMPT\" --output \"$GH_AW_SAFE_OUTPUTS\"".to_string(),
            _ => "copilot --prompt \"$GH_AW_PROMPT\" --log-dir /tmp/gh-aw/logs --output-file \"$GH_AW_SAFE_OUTPUTS\"".to_string(),
        }
    }

    fn agent_job(&mut self, gate: Option<&str>) -> Result<BuiltJob, CompileError> {
        let mut env: Vec<(String, Node)> = vec![
            ("GH_AW_PROMPT".to_string(), Node::str(&self.prompt)),
            (
                "GH_AW_SAFE_OUTPUTS".to_string(),
                Node::str(SAFE_OUTPUTS_PATH),
            ),
            (
                "GH_AW_WORKFLOW_FILE".to_string(),
                Node::str(&self.source_display),
            ),
        ];
        if !self.merged.network_allowed.is_empty() {
            env.push((
                "GH_AW_NETWORK_ALLOWED".to_string(),
                Node::str(expand_allowlist(&self.merged.network_allowed).join(" ")),
            ));
        }
        if self.merged.tools.contains_key("github") || !self.merged.mcp_servers.is_empty() {
            env.push((
                "GH_AW_GITHUB_MCP_SERVER_TOKEN".to_string(),
                Node::str("${{ secrets.GH_AW_GITHUB_MCP_SERVER_TOKEN || github.token }}"),
            ));
        }

        let mut steps = vec![self.checkout_step()?];
        if self.merged.runtimes.contains_key("node") {
            let version = self
                .merged
                .runtimes
                .get("node")
                .and_then(Value::as_mapping)
                .and_then(|m| m.get(Value::String("version".to_string())))
                .and_then(Value::as_str)
                .unwrap_or("20");
            steps.push(Node::map(vec![
                ("name", Node::str("Setup node")),
                ("uses", self.pinned_uses("actions/setup-node@v4")?),
                (
                    "with",
                    Node::map(vec![("node-version", Node::str(version))]),
                ),
            ]));
        }
        steps.push(Node::map(vec![
            ("name", Node::str("Prepare output directory")),
            ("run", Node::str("mkdir -p /tmp/gh-aw && touch \"$GH_AW_SAFE_OUTPUTS\"\n")),
        ]));
        steps.push(Node::map(vec![
            ("name", Node::str("Execute agent")),
            ("id", Node::str("agent")),
            ("run", Node::str(format!("{}\n", self.engine_command()))),
        ]));
        steps.push(Node::map(vec![
            ("name", Node::str("Upload agent output")),
            ("uses", self.pinned_uses("actions/upload-artifact@v4")?),
            (
                "with",
                Node::map(vec![
                    ("name", Node::str("safe-outputs")),
                    ("path", Node::str(SAFE_OUTPUTS_PATH)),
                    ("if-no-files-found", Node::str("ignore")),
                ]),
            ),
        ]));

        // The agent job holds the root-declared (read) permissions; write
        // operations happen in the per-kind jobs.
        let permissions = if self.merged.permissions.is_empty() {
            Self::permissions_node(&[("contents", "read")])
        } else if let Some(all) = &self.merged.permissions.all {
            Node::str(all)
        } else {
            Node::Map(
                self.merged
                    .permissions
                    .map
                    .iter()
                    .map(|(scope, level)| (scope.clone(), Node::str(level)))
                    .collect(),
            )
        };

        let mut entries = self.base_job(&["activation"], gate, permissions, self.timeout());
        entries.push(("env".to_string(), Node::Map(env)));
        entries.push(("steps".to_string(), Node::Seq(steps)));

        Ok(BuiltJob {
            node: JobNode {
                name: "agent".to_string(),
                needs: vec!["activation".to_string()],
                layer: layer::AGENT,
            },
            rendered: Node::Map(entries),
        })
    }

    fn detection_job(&mut self, gate: Option<&str>) -> Result<BuiltJob, CompileError> {
        let scan_script = "\
set -euo pipefail\n\
if grep -Eiq 'ignore (all )?previous instructions|system prompt|BEGIN PROMPT INJECTION' \"$GH_AW_SAFE_OUTPUTS\"; then\n\
  echo 'threat=detected' >> \"$GITHUB_OUTPUT\"\n\
  echo '::error::possible prompt injection detected in agent output'\n\
  exit 1\n\
fi\n\
echo 'threat=clean' >> \"$GITHUB_OUTPUT\"\n";

        let mut steps = vec![Node::map(vec![
            ("name", Node::str("Download agent output")),
            ("uses", self.pinned_uses("actions/download-artifact@v4")?),
            (
                "with",
                Node::map(vec![
                    ("name", Node::str("safe-outputs")),
                    ("path", Node::str("/tmp/gh-aw")),
                ]),
            ),
        ])];
        steps.push(Node::map(vec![
            ("name", Node::str("Scan for malicious content")),
            ("id", Node::str("scan")),
            ("run", Node::str(scan_script)),
            (
                "env",
                Node::map(vec![("GH_AW_SAFE_OUTPUTS", Node::str(SAFE_OUTPUTS_PATH))]),
            ),
        ]));

        let mut entries = self.base_job(
            &["agent"],
            gate,
            Self::permissions_node(&[("contents", "read")]),
            10,
        );
        entries.push((
            "outputs".to_string(),
            Node::map(vec![("threat", Node::str("${{ steps.scan.outputs.threat }}"))]),
        ));
        entries.push(("steps".to_string(), Node::Seq(steps)));

        Ok(BuiltJob {
            node: JobNode {
                name: "detection".to_string(),
                needs: vec!["agent".to_string()],
                layer: layer::DETECTION,
            },
            rendered: Node::Map(entries),
        })
    }

    fn safe_output_job(
        &mut self,
        kind: SafeOutputKind,
        config: &Value,
        detection: bool,
        gate: Option<&str>,
    ) -> Result<BuiltJob, CompileError> {
        let mut needs = vec!["agent".to_string()];
        if detection {
            needs.push("detection".to_string());
        }
        let needs_refs: Vec<&str> = needs.iter().map(String::as_str).collect();

        let per_output_token = config
            .as_mapping()
            .and_then(|m| m.get(Value::String("github-token".to_string())))
            .and_then(Value::as_str);
        let token = token_expression(&kind.token_sources(
            per_output_token,
            self.merged.safe_outputs.github_token.as_deref(),
            self.merged.github_token.as_deref(),
        ));

        let handler_json = serde_json::to_string(&handler_config(kind, config))
            .unwrap_or_else(|_| "{}".to_string());

        let mut env: Vec<(String, Node)> = vec![
            (
                "GH_AW_SAFE_OUTPUTS_HANDLER_CONFIG".to_string(),
                Node::str(&handler_json),
            ),
            (
                "GH_AW_SAFE_OUTPUTS".to_string(),
                Node::str(SAFE_OUTPUTS_PATH),
            ),
        ];
        if kind.is_project_kind() {
            env.push((
                "GH_AW_SAFE_OUTPUTS_PROJECT_HANDLER_CONFIG".to_string(),
                Node::str(&handler_json),
            ));
            if let Some(url) = config
                .as_mapping()
                .and_then(|m| m.get(Value::String("project-url".to_string())))
                .and_then(Value::as_str)
            {
                env.push(("GH_AW_PROJECT_URL".to_string(), Node::str(url)));
            }
        }

        let apply_script = format!(
            "const fs = require('fs');\n\
const lines = fs.existsSync(process.env.GH_AW_SAFE_OUTPUTS)\n\
  ? fs.readFileSync(process.env.GH_AW_SAFE_OUTPUTS, 'utf8').split('\\n').filter(Boolean)\n\
  : [];\n\
const config = JSON.parse(process.env.GH_AW_SAFE_OUTPUTS_HANDLER_CONFIG);\n\
const entries = lines.map((l) => JSON.parse(l)).filter((e) => e.type === '{kind}');\n\
await applySafeOutputs(github, context, config, entries);\n",
            kind = kind.config_key()
        );

        // Steps inherit the job-level env (handler config + outputs path).
        let steps = vec![
            Node::map(vec![
                ("name", Node::str("Download agent output")),
                ("uses", self.pinned_uses("actions/download-artifact@v4")?),
                (
                    "with",
                    Node::map(vec![
                        ("name", Node::str("safe-outputs")),
                        ("path", Node::str("/tmp/gh-aw")),
                    ]),
                ),
            ]),
            Node::map(vec![
                ("name", Node::str(format!("Apply {}", kind.config_key()))),
                ("uses", self.pinned_uses("actions/github-script@v7")?),
                (
                    "with",
                    Node::map(vec![
                        ("github-token", Node::str(&token)),
                        ("script", Node::str(&apply_script)),
                    ]),
                ),
            ]),
        ];

        let mut entries = self.base_job(
            &needs_refs,
            gate,
            Self::permissions_node(kind.permissions()),
            10,
        );
        entries.push(("env".to_string(), Node::Map(env)));
        entries.push(("steps".to_string(), Node::Seq(steps)));

        Ok(BuiltJob {
            node: JobNode {
                name: kind.job_name(),
                needs,
                layer: layer::SAFE_OUTPUT,
            },
            rendered: Node::Map(entries),
        })
    }

    fn conclusion_job(&mut self, safe_output_jobs: &[String]) -> Result<BuiltJob, CompileError> {
        let mut needs: Vec<String> = safe_output_jobs.to_vec();
        needs.sort();
        needs.dedup();
        let needs_refs: Vec<&str> = needs.iter().map(String::as_str).collect();

        let summary_script = "\
set -euo pipefail\n\
{\n\
  echo \"## Agentic workflow run\"\n\
  echo \"campaign: ${GH_AW_CAMPAIGN_ID}\"\n\
  echo \"tracker: ${GH_AW_TRACKER_LABEL}\"\n\
} >> \"$GITHUB_STEP_SUMMARY\"\n";

        let mut entries = self.base_job(
            &needs_refs,
            Some("always()"),
            Self::permissions_node(&[("contents", "read")]),
            5,
        );
        entries.push((
            "env".to_string(),
            Node::map(vec![
                (
                    "GH_AW_CAMPAIGN_ID",
                    Node::str("${{ github.workflow }}-${{ github.run_id }}"),
                ),
                ("GH_AW_TRACKER_LABEL", Node::str("gh-aw")),
            ]),
        ));
        entries.push((
            "steps".to_string(),
            Node::Seq(vec![Node::map(vec![
                ("name", Node::str("Render run summary")),
                ("run", Node::str(summary_script)),
            ])]),
        ));

        Ok(BuiltJob {
            node: JobNode {
                name: "conclusion".to_string(),
                needs,
                layer: layer::CONCLUSION,
            },
            rendered: Node::Map(entries),
        })
    }

    /// Lower a user-authored job: pin its actions, canonicalize key order,
    /// and add the implicit dependency when it declares none.
    fn user_job(
        &mut self,
        name: &str,
        config: &Value,
        implicit_need: &str,
    ) -> Result<BuiltJob, CompileError> {
        let src_path = self.source.path.clone();
        let mut needs: Vec<String> = config
            .as_mapping()
            .and_then(|m| m.get(Value::String("needs".to_string())))
            .map(|v| match v {
                Value::String(s) => vec![s.clone()],
                Value::Sequence(seq) => seq
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();
        if needs.is_empty() {
            needs.push(implicit_need.to_string());
        }

        let mut rendered = Node::from_yaml(config);
        if let Node::Map(entries) = &mut rendered {
            // Reflect the implicit dependency in the emitted YAML.
            if !entries.iter().any(|(k, _)| k == "needs") {
                entries.insert(
                    0,
                    (
                        "needs".to_string(),
                        Node::Seq(needs.iter().map(|n| Node::str(n.clone())).collect()),
                    ),
                );
            }
            // Pin every `uses:` in the job's steps.
            for (key, value) in entries.iter_mut() {
                if key != "steps" {
                    continue;
                }
                let Node::Seq(steps) = value else { continue };
                for step in steps {
                    let Node::Map(step_entries) = step else { continue };
                    for (step_key, step_value) in step_entries.iter_mut() {
                        if step_key != "uses" {
                            continue;
                        }
                        if let Node::Str { value: uses, .. } = step_value {
                            let pinned = self.pinner.pin(&src_path, uses)?;
                            let (new_value, comment) = pinned.uses_value();
                            *step_value = Node::commented(new_value, comment);
                        }
                    }
                }
            }
        }

        Ok(BuiltJob {
            node: JobNode {
                name: name.to_string(),
                needs,
                layer: layer::USER,
            },
            rendered: sort_job_keys(rendered),
        })
    }
}
