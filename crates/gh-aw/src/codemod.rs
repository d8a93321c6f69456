//! Registry of named, pure frontmatter rewrites from deprecated shapes to
//! current ones.
//!
//! Each codemod is a two-pass transformation: `detect` lists the JSON paths
//! and replacement values it would touch, `apply` performs the rewrite.
//! Rewrites are shape-only; values pass through unchanged, so a codemod can
//! never widen permissions or relax a network allowlist.

use serde_yaml::{Mapping, Value};

/// A proposed (or applied) rewrite at one JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub codemod: &'static str,
    pub json_path: String,
    pub before: String,
    pub after: String,
}

impl Proposal {
    /// Human-readable finding, also used as the non-strict warning text.
    pub fn message(&self) -> String {
        format!("{} deprecated; use {}", self.before, self.after)
    }
}

/// One registered codemod.
pub struct Codemod {
    pub name: &'static str,
    pub detect: fn(&Mapping) -> Vec<Proposal>,
    pub apply: fn(&mut Mapping),
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

/// Rename a top-level key, preserving its value.
fn rename_top_level(mapping: &mut Mapping, from: &str, to: &str) {
    if let Some(value) = mapping.remove(key(from))
        && !mapping.contains_key(key(to))
    {
        mapping.insert(key(to), value);
    }
}

// timeout_minutes -> timeout-minutes

fn detect_timeout(mapping: &Mapping) -> Vec<Proposal> {
    if mapping.contains_key(key("timeout_minutes")) {
        vec![Proposal {
            codemod: "timeout-minutes",
            json_path: "timeout_minutes".to_string(),
            before: "timeout_minutes".to_string(),
            after: "timeout-minutes".to_string(),
        }]
    } else {
        Vec::new()
    }
}

fn apply_timeout(mapping: &mut Mapping) {
    rename_top_level(mapping, "timeout_minutes", "timeout-minutes");
}

// network.firewall -> sandbox.agent

fn detect_firewall(mapping: &Mapping) -> Vec<Proposal> {
    let has = mapping
        .get(key("network"))
        .and_then(Value::as_mapping)
        .is_some_and(|n| n.contains_key(key("firewall")));
    if has {
        vec![Proposal {
            codemod: "sandbox-agent",
            json_path: "network.firewall".to_string(),
            before: "network.firewall".to_string(),
            after: "sandbox.agent".to_string(),
        }]
    } else {
        Vec::new()
    }
}

fn apply_firewall(mapping: &mut Mapping) {
    let Some(network) = mapping.get_mut(key("network")).and_then(Value::as_mapping_mut) else {
        return;
    };
    let Some(firewall) = network.remove(key("firewall")) else {
        return;
    };
    let empty_network = network.is_empty();
    if empty_network {
        mapping.remove(key("network"));
    }

    let sandbox = mapping
        .entry(key("sandbox"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if let Some(sandbox) = sandbox.as_mapping_mut()
        && !sandbox.contains_key(key("agent"))
    {
        sandbox.insert(key("agent"), firewall);
    }
}

// on.command -> on.slash_command

fn detect_command(mapping: &Mapping) -> Vec<Proposal> {
    let has = mapping
        .get(key("on"))
        .and_then(Value::as_mapping)
        .is_some_and(|on| on.contains_key(key("command")));
    if has {
        vec![Proposal {
            codemod: "slash-command",
            json_path: "on.command".to_string(),
            before: "on.command".to_string(),
            after: "on.slash_command".to_string(),
        }]
    } else {
        Vec::new()
    }
}

fn apply_command(mapping: &mut Mapping) {
    let Some(on) = mapping.get_mut(key("on")).and_then(Value::as_mapping_mut) else {
        return;
    };
    if let Some(value) = on.remove(key("command"))
        && !on.contains_key(key("slash_command"))
    {
        on.insert(key("slash_command"), value);
    }
}

/// The full codemod registry, in application order.
pub fn registry() -> &'static [Codemod] {
    const REGISTRY: &[Codemod] = &[
        Codemod {
            name: "timeout-minutes",
            detect: detect_timeout,
            apply: apply_timeout,
        },
        Codemod {
            name: "sandbox-agent",
            detect: detect_firewall,
            apply: apply_firewall,
        },
        Codemod {
            name: "slash-command",
            detect: detect_command,
            apply: apply_command,
        },
    ];
    REGISTRY
}

/// Dry-run pass: every proposal across the registry.
pub fn detect_all(mapping: &Mapping) -> Vec<Proposal> {
    registry()
        .iter()
        .flat_map(|codemod| (codemod.detect)(mapping))
        .collect()
}

/// Apply every codemod whose detect pass fires. Returns what was applied.
pub fn apply_all(mapping: &mut Mapping) -> Vec<Proposal> {
    let proposals = detect_all(mapping);
    for codemod in registry() {
        if proposals.iter().any(|p| p.codemod == codemod.name) {
            (codemod.apply)(mapping);
        }
    }
    proposals
}
