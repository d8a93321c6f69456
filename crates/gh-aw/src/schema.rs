//! Schema validation for merged workflow configuration.
//!
//! Field checks are explicit and typed rather than driven by a generic
//! schema engine; every failure carries the JSON path of the offending
//! field. Custom MCP server configurations that name a `schema-url` are
//! checked against the fetched schema (required keys and primitive types),
//! using the same HTTPS-only fetch and cache layer as remote imports.

use std::path::Path;

use serde_yaml::Value;

use crate::diag::{Category, CompileError, diagnostic};
use crate::fetch::{Fetcher, ImportsCache};
use crate::merge::MergedConfig;
use crate::safe_outputs::SafeOutputKind;
use crate::types::{WorkflowSource, sha256_hex};

/// Top-level keys accepted in workflow frontmatter.
const TOP_LEVEL_KEYS: &[&str] = &[
    "on",
    "name",
    "description",
    "engine",
    "permissions",
    "network",
    "tools",
    "mcp-servers",
    "safe-outputs",
    "runtimes",
    "jobs",
    "imports",
    "github-token",
    "runs-on",
    "timeout-minutes",
    "timeout_minutes",
    "roles",
    "env",
    "concurrency",
    "sandbox",
];

const ENGINES: &[&str] = &["copilot", "claude", "codex", "custom"];

const PERMISSION_SCOPES: &[&str] = &[
    "actions",
    "attestations",
    "checks",
    "contents",
    "deployments",
    "discussions",
    "id-token",
    "issues",
    "models",
    "packages",
    "pages",
    "pull-requests",
    "repository-projects",
    "security-events",
    "statuses",
];

const PERMISSION_LEVELS: &[&str] = &["read", "write", "none"];

fn schema_error(
    path: &Path,
    json_path: impl Into<String>,
    message: impl Into<String>,
) -> CompileError {
    CompileError::Schema(diagnostic(Category::Schema, path, message).at(json_path))
}

/// Validate a source's own frontmatter shape. Shared components (no `on`)
/// validate under the same key set; compilable workflows additionally
/// require `on`.
pub fn validate_source(source: &WorkflowSource, shared: bool) -> Result<(), CompileError> {
    let path = source.path.as_path();
    for key in source.frontmatter.keys() {
        if !TOP_LEVEL_KEYS.contains(&key) {
            return Err(schema_error(
                path,
                key,
                format!("unknown field `{key}`"),
            ));
        }
    }
    if !shared && !source.frontmatter.contains("on") {
        return Err(schema_error(path, "on", "missing required field `on`"));
    }
    Ok(())
}

/// Validate the merged configuration.
pub fn validate_merged(
    source: &WorkflowSource,
    merged: &MergedConfig,
    fetcher: &Fetcher,
    cache: &ImportsCache,
) -> Result<(), CompileError> {
    let path = source.path.as_path();

    validate_on(path, merged)?;
    validate_engine(path, merged)?;
    validate_permissions(path, source)?;
    validate_network(path, source)?;
    validate_safe_outputs(path, merged)?;
    validate_user_jobs(path, merged)?;
    validate_runtimes(path, merged)?;
    validate_mcp_servers(path, merged, fetcher, cache)?;
    Ok(())
}

fn validate_on(path: &Path, merged: &MergedConfig) -> Result<(), CompileError> {
    match &merged.on {
        Some(Value::String(_)) | Some(Value::Sequence(_)) | Some(Value::Mapping(_)) => Ok(()),
        Some(_) => Err(schema_error(
            path,
            "on",
            "`on` must be an event name, a list of events, or a trigger mapping",
        )),
        None => Ok(()), // shared components; the driver never compiles them
    }
}

fn validate_engine(path: &Path, merged: &MergedConfig) -> Result<(), CompileError> {
    let Some(engine) = &merged.engine else {
        return Ok(());
    };
    let id = match engine {
        Value::String(s) => Some(s.as_str()),
        Value::Mapping(m) => m
            .get(Value::String("id".to_string()))
            .and_then(Value::as_str),
        _ => None,
    };
    match id {
        Some(id) if ENGINES.contains(&id) => Ok(()),
        Some(id) => Err(schema_error(
            path,
            "engine",
            format!("unknown engine `{id}` (expected one of: {})", ENGINES.join(", ")),
        )),
        None => Err(schema_error(
            path,
            "engine",
            "`engine` must be an engine name or a mapping with an `id` field",
        )),
    }
}

fn validate_permissions(path: &Path, source: &WorkflowSource) -> Result<(), CompileError> {
    let Some(perms) = source.frontmatter.get("permissions") else {
        return Ok(());
    };
    match perms {
        Value::String(s) if s == "read-all" || s == "write-all" => Ok(()),
        Value::String(s) => Err(schema_error(
            path,
            "permissions",
            format!("unknown permissions shorthand `{s}`"),
        )),
        Value::Mapping(map) => {
            for (k, v) in map {
                let scope = k.as_str().unwrap_or_default();
                if !PERMISSION_SCOPES.contains(&scope) {
                    return Err(schema_error(
                        path,
                        format!("permissions.{scope}"),
                        format!("unknown permission scope `{scope}`"),
                    ));
                }
                let level = v.as_str().unwrap_or_default();
                if !PERMISSION_LEVELS.contains(&level) {
                    return Err(schema_error(
                        path,
                        format!("permissions.{scope}"),
                        format!("invalid permission level `{level}`"),
                    ));
                }
            }
            Ok(())
        }
        _ => Err(schema_error(
            path,
            "permissions",
            "`permissions` must be a mapping or `read-all`/`write-all`",
        )),
    }
}

fn validate_network(path: &Path, source: &WorkflowSource) -> Result<(), CompileError> {
    let Some(network) = source.frontmatter.get("network") else {
        return Ok(());
    };
    let Some(map) = network.as_mapping() else {
        return Err(schema_error(path, "network", "`network` must be a mapping"));
    };
    for (k, v) in map {
        match k.as_str() {
            Some("allowed") => {
                let ok = v
                    .as_sequence()
                    .is_some_and(|seq| seq.iter().all(|item| item.as_str().is_some()));
                if !ok {
                    return Err(schema_error(
                        path,
                        "network.allowed",
                        "`network.allowed` must be a list of domain strings",
                    ));
                }
            }
            Some(other) => {
                return Err(schema_error(
                    path,
                    format!("network.{other}"),
                    format!("unknown field `network.{other}`"),
                ));
            }
            None => {
                return Err(schema_error(path, "network", "keys must be strings"));
            }
        }
    }
    Ok(())
}

fn validate_safe_outputs(path: &Path, merged: &MergedConfig) -> Result<(), CompileError> {
    for (key, config) in &merged.safe_outputs.entries {
        let json_path = format!("safe-outputs.{key}");
        let Some(kind) = SafeOutputKind::from_config_key(key) else {
            let source = merged
                .contributed_by(&json_path)
                .map(|s| format!(" (from {s})"))
                .unwrap_or_default();
            return Err(schema_error(
                path,
                json_path,
                format!("unknown safe-output type `{key}`{source}"),
            ));
        };

        match config {
            Value::Null => continue, // bare `create-issue:` enables with defaults
            Value::Mapping(map) => {
                for (k, v) in map {
                    let Some(field) = k.as_str() else {
                        return Err(schema_error(path, json_path, "keys must be strings"));
                    };
                    let field_path = format!("{json_path}.{field}");
                    if !kind.accepts_field(field) {
                        return Err(schema_error(
                            path,
                            field_path,
                            format!("`{key}` does not accept field `{field}`"),
                        ));
                    }
                    if field == "max" {
                        match v.as_u64() {
                            Some(n) if (1..=1000).contains(&n) => {}
                            _ => {
                                return Err(schema_error(
                                    path,
                                    field_path,
                                    "`max` must be an integer between 1 and 1000",
                                ));
                            }
                        }
                    }
                    if field == "github-token" || field == "target-repo" {
                        if v.as_str().is_none() {
                            return Err(schema_error(
                                path,
                                field_path,
                                format!("`{field}` must be a string"),
                            ));
                        }
                    }
                }
            }
            _ => {
                return Err(schema_error(
                    path,
                    json_path,
                    format!("`{key}` configuration must be a mapping"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_user_jobs(path: &Path, merged: &MergedConfig) -> Result<(), CompileError> {
    for (name, job) in merged.jobs.iter().chain(&merged.safe_outputs.jobs) {
        if job.as_mapping().is_none() {
            return Err(schema_error(
                path,
                format!("jobs.{name}"),
                format!("job `{name}` must be a mapping"),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            || name.is_empty()
        {
            return Err(schema_error(
                path,
                format!("jobs.{name}"),
                format!("invalid job name `{name}`"),
            ));
        }
        if reserved_job_name(name) {
            return Err(schema_error(
                path,
                format!("jobs.{name}"),
                format!("job name `{name}` is reserved for a synthesized job"),
            ));
        }
    }
    Ok(())
}

/// Names in the synthesized-job namespace.
fn reserved_job_name(name: &str) -> bool {
    matches!(
        name,
        "pre_activation" | "activation" | "agent" | "detection" | "conclusion"
    ) || crate::safe_outputs::ALL_KINDS
        .iter()
        .any(|kind| kind.job_name() == name)
}

fn validate_runtimes(path: &Path, merged: &MergedConfig) -> Result<(), CompileError> {
    for (name, config) in &merged.runtimes {
        let Some(map) = config.as_mapping() else {
            return Err(schema_error(
                path,
                format!("runtimes.{name}"),
                format!("runtime `{name}` must be a mapping"),
            ));
        };
        if let Some(version) = map.get(Value::String("version".to_string()))
            && version.as_str().is_none()
            && version.as_u64().is_none()
        {
            return Err(schema_error(
                path,
                format!("runtimes.{name}.version"),
                "`version` must be a string or number",
            ));
        }
    }
    Ok(())
}

/// Validate MCP server configurations; servers naming a `schema-url` are
/// checked against the fetched schema.
fn validate_mcp_servers(
    path: &Path,
    merged: &MergedConfig,
    fetcher: &Fetcher,
    cache: &ImportsCache,
) -> Result<(), CompileError> {
    for (name, config) in &merged.mcp_servers {
        let json_path = format!("mcp-servers.{name}");
        let Some(map) = config.as_mapping() else {
            return Err(schema_error(
                path,
                json_path,
                format!("server `{name}` must be a mapping"),
            ));
        };

        let Some(url) = map
            .get(Value::String("schema-url".to_string()))
            .and_then(Value::as_str)
        else {
            continue;
        };

        let schema = fetch_schema_cached(fetcher, cache, url).map_err(|e| {
            CompileError::Import(
                diagnostic(
                    Category::Import,
                    path,
                    format!("schema fetch failed for `{name}`: {e}"),
                )
                .at(format!("{json_path}.schema-url")),
            )
        })?;

        validate_against_schema(path, &json_path, map, &schema)?;
    }
    Ok(())
}

/// Fetch a JSON schema, caching by URL digest alongside imported content.
fn fetch_schema_cached(
    fetcher: &Fetcher,
    cache: &ImportsCache,
    url: &str,
) -> anyhow::Result<serde_json::Value> {
    let digest = sha256_hex(url.as_bytes());
    let cache_path = cache.root().join("_schemas").join(format!("{digest}.json"));
    if let Ok(raw) = std::fs::read_to_string(&cache_path)
        && let Ok(parsed) = serde_json::from_str(&raw)
    {
        return Ok(parsed);
    }
    let schema = fetcher.fetch_schema(url)?;
    crate::lock::write_atomic(&cache_path, serde_json::to_string_pretty(&schema)?.as_bytes())?;
    Ok(schema)
}

/// Check `config` against a JSON-schema subset: `required` keys must be
/// present, and `properties.<key>.type` must match for present keys.
fn validate_against_schema(
    path: &Path,
    json_path: &str,
    config: &serde_yaml::Mapping,
    schema: &serde_json::Value,
) -> Result<(), CompileError> {
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if !config.contains_key(Value::String(key.to_string())) {
                return Err(schema_error(
                    path,
                    format!("{json_path}.{key}"),
                    format!("missing required field `{key}`"),
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in config {
            let Some(key) = key.as_str() else { continue };
            if key == "schema-url" {
                continue;
            }
            let Some(expected) = properties.get(key) else {
                return Err(schema_error(
                    path,
                    format!("{json_path}.{key}"),
                    format!("unexpected field `{key}`"),
                ));
            };
            let Some(expected_type) = expected.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let matches = match expected_type {
                "string" => value.as_str().is_some(),
                "number" | "integer" => value.as_u64().is_some() || value.as_f64().is_some(),
                "boolean" => value.as_bool().is_some(),
                "array" => value.as_sequence().is_some(),
                "object" => value.as_mapping().is_some(),
                _ => true,
            };
            if !matches {
                return Err(schema_error(
                    path,
                    format!("{json_path}.{key}"),
                    format!("`{key}` must be of type {expected_type}"),
                ));
            }
        }
    }
    Ok(())
}
