//! Strict-mode security policies over the merged configuration.
//!
//! Policies are named; a violation surfaces as a `SecurityError` carrying
//! the policy name. Outside strict mode, deprecated-field findings degrade
//! to warnings and the remaining policies are not enforced, except that a
//! present-but-malformed network allowlist is always an error.

use std::collections::BTreeSet;

use serde_yaml::Value;

use crate::codemod;
use crate::diag::{Category, CompileError, Warning, diagnostic};
use crate::merge::MergedConfig;
use crate::types::{ImportGraph, WorkflowSource};

/// Symbolic allowlist groups, expanded to concrete domains at validation
/// time.
const DOMAIN_GROUPS: &[(&str, &[&str])] = &[
    (
        "defaults",
        &[
            "api.github.com",
            "github.com",
            "objects.githubusercontent.com",
            "raw.githubusercontent.com",
        ],
    ),
    (
        "github",
        &[
            "api.github.com",
            "codeload.github.com",
            "github.com",
            "objects.githubusercontent.com",
            "raw.githubusercontent.com",
            "uploads.github.com",
        ],
    ),
    ("node", &["nodejs.org", "registry.npmjs.org"]),
    ("python", &["files.pythonhosted.org", "pypi.org"]),
];

fn security_error(
    source: &WorkflowSource,
    policy: &str,
    json_path: &str,
    message: impl Into<String>,
) -> CompileError {
    CompileError::Security(
        diagnostic(
            Category::Security,
            &source.path,
            format!("{policy}: {}", message.into()),
        )
        .at(json_path),
    )
}

/// Is `label` a valid DNS label: alphanumeric ends, hyphens inside, 1-63
/// chars, no underscores.
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let ok_inner = |b: &u8| b.is_ascii_alphanumeric() || *b == b'-';
    bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes.iter().all(ok_inner)
}

/// Validate one allowlist entry: a symbolic group, a domain, or a
/// single-label wildcard (`*.example.com`).
pub fn valid_allowlist_entry(entry: &str) -> bool {
    if DOMAIN_GROUPS.iter().any(|(name, _)| *name == entry) {
        return true;
    }
    let domain = match entry.strip_prefix("*.") {
        // A wildcard may stand for one label only; the remainder must be a
        // real multi-label domain.
        Some(rest) => {
            if rest.split('.').count() < 2 {
                return false;
            }
            rest
        }
        None => entry,
    };
    if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    domain.split('.').all(valid_label)
}

/// Expand symbolic groups into concrete domains; sort and dedup.
pub fn expand_allowlist(entries: &[String]) -> Vec<String> {
    let mut out: BTreeSet<String> = BTreeSet::new();
    for entry in entries {
        match DOMAIN_GROUPS.iter().find(|(name, _)| name == entry) {
            Some((_, domains)) => out.extend(domains.iter().map(|d| d.to_string())),
            None => {
                out.insert(entry.clone());
            }
        }
    }
    out.into_iter().collect()
}

/// A syntactically plausible action reference: `owner/repo@ref` with an
/// optional subdirectory.
pub fn valid_action_reference(uses: &str) -> bool {
    if uses.starts_with("./") || uses.starts_with("docker://") {
        // Local and docker references are not pinnable; strict mode
        // rejects them in user jobs.
        return false;
    }
    let Some((location, reference)) = uses.split_once('@') else {
        return false;
    };
    let mut parts = location.splitn(3, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    let name_ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    };
    name_ok(owner) && name_ok(repo) && !reference.is_empty()
}

/// Run the security validator.
///
/// Returns warnings (deprecated fields outside strict mode); fails with the
/// first policy violation in strict mode.
pub fn validate(
    source: &WorkflowSource,
    merged: &MergedConfig,
    graph: &ImportGraph,
    strict: bool,
) -> Result<Vec<Warning>, CompileError> {
    let mut warnings = Vec::new();

    // Deprecated fields: fatal in strict mode, warnings otherwise.
    let deprecations = codemod::detect_all(source.frontmatter.mapping());
    if let Some(first) = deprecations.first() {
        if strict {
            return Err(security_error(
                source,
                "deprecated-field",
                &first.json_path,
                first.message(),
            ));
        }
        for proposal in &deprecations {
            warnings.push(Warning {
                path: source.path.clone(),
                json_path: Some(proposal.json_path.clone()),
                message: proposal.message(),
            });
        }
    }

    // Malformed allowlist entries are an error in every mode.
    for entry in &merged.network_allowed {
        if !valid_allowlist_entry(entry) {
            return Err(security_error(
                source,
                "network-allowlist",
                "network.allowed",
                format!("invalid allowlist entry `{entry}`"),
            ));
        }
    }

    if !strict {
        return Ok(warnings);
    }

    // permissions: write-all (or any shorthand) is rejected; each
    // permission must be individually declared.
    if let Some(all) = &merged.permissions.all {
        return Err(security_error(
            source,
            "permissions-shorthand",
            "permissions",
            format!("`permissions: {all}` is not allowed; declare each permission individually"),
        ));
    }

    // Write-category operations must be expressed through safe-outputs,
    // never through raw write permissions handed to the agent job.
    for (scope, level) in &merged.permissions.map {
        if level == "write" {
            return Err(security_error(
                source,
                "agent-write-permission",
                &format!("permissions.{scope}"),
                format!(
                    "`{scope}: write` grants the agent job write access; use a `safe-outputs` entry instead"
                ),
            ));
        }
    }

    // The merged allowlist must be non-empty.
    if merged.network_allowed.is_empty() {
        return Err(security_error(
            source,
            "network-allowlist",
            "network.allowed",
            "strict mode requires a non-empty `network.allowed` egress allowlist",
        ));
    }

    // All remote imports must be tag- or commit-pinned.
    for node in &graph.nodes {
        if let Some(reference) = &node.reference
            && !reference.is_strict_acceptable()
        {
            return Err(security_error(
                source,
                "unpinned-import",
                "imports",
                format!(
                    "remote import `{}` uses branch reference `{}`; pin to a tag or commit",
                    node.manifest_entry,
                    reference.as_str()
                ),
            ));
        }
    }

    // Action references in user jobs must be pinnable.
    for (job_name, job) in merged.jobs.iter().chain(&merged.safe_outputs.jobs) {
        let Some(steps) = job
            .as_mapping()
            .and_then(|m| m.get(Value::String("steps".to_string())))
            .and_then(Value::as_sequence)
        else {
            continue;
        };
        for (idx, step) in steps.iter().enumerate() {
            let Some(uses) = step
                .as_mapping()
                .and_then(|m| m.get(Value::String("uses".to_string())))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !valid_action_reference(uses) {
                return Err(security_error(
                    source,
                    "unpinnable-action",
                    &format!("jobs.{job_name}.steps[{idx}].uses"),
                    format!("`{uses}` cannot be pinned to a commit identifier"),
                ));
            }
        }
    }

    Ok(warnings)
}
