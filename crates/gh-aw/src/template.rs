//! Compile-time validation of `${{ ... }}` expressions.
//!
//! There is no interpreter here: substitution happens at runtime inside
//! GitHub Actions. The compiler walks the Markdown body and every string
//! value in the frontmatter and proves each embedded expression is
//! well-formed and drawn from the safe subset (see `gh-aw-expr`).

use std::path::Path;

use gh_aw_expr::ExprError;
use serde_yaml::Value;

use crate::diag::{Category, CompileError, diagnostic};
use crate::types::WorkflowSource;

fn expression_error(path: &Path, json_path: Option<String>, err: &ExprError) -> CompileError {
    let mut diag = diagnostic(Category::Expression, path, err.to_string());
    if let Some(json_path) = json_path {
        diag = diag.at(json_path);
    }
    CompileError::Expression(diag.suggest(
        "only context access, literals, ==, !=, !, &&, || and the `cond && a || b` pattern are allowed",
    ))
}

/// Validate every expression in a text block.
fn check_text(path: &Path, json_path: Option<&str>, text: &str) -> Result<(), CompileError> {
    gh_aw_expr::validate_text(text)
        .map(|_| ())
        .map_err(|e| expression_error(path, json_path.map(str::to_string), &e))
}

fn walk_value(path: &Path, json_path: &str, value: &Value) -> Result<(), CompileError> {
    match value {
        Value::String(s) => check_text(path, Some(json_path), s),
        Value::Sequence(seq) => {
            for (idx, item) in seq.iter().enumerate() {
                walk_value(path, &format!("{json_path}[{idx}]"), item)?;
            }
            Ok(())
        }
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().unwrap_or("?");
                let child = if json_path.is_empty() {
                    key.to_string()
                } else {
                    format!("{json_path}.{key}")
                };
                walk_value(path, &child, v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validate all expressions in a source: frontmatter string values and the
/// Markdown body.
pub fn validate_source(source: &WorkflowSource) -> Result<(), CompileError> {
    for (k, v) in source.frontmatter.mapping() {
        let key = k.as_str().unwrap_or("?");
        walk_value(&source.path, key, v)?;
    }
    check_text(&source.path, None, &source.body)
}
