//! The restricted `${{ ... }}` expression language accepted in agentic
//! workflow frontmatter strings and Markdown bodies.
//!
//! The compiler never evaluates these expressions; GitHub Actions does that
//! at runtime. This crate only proves that every expression is well-formed
//! and drawn from the safe subset:
//!
//! - dotted access to a fixed set of context roots (`github`, `inputs`,
//!   `needs.<job>.outputs.*`, `env`, `secrets`, `steps.<id>.outputs.*`),
//! - string and numeric literals,
//! - `==`, `!=`, `&&`, `||`, `!`, and parentheses (which makes the
//!   `cond && a || b` ternary pattern expressible).
//!
//! Function calls, arithmetic, indexing, and property lookup on anything
//! other than a context path are rejected. Anything the tokenizer does not
//! recognize is an [`ExprError::UnsafeExpression`].

mod parser;
mod scanner;

pub use parser::{BinaryOp, Expr, parse};
pub use scanner::{Segment, SegmentKind, segments};

use thiserror::Error;

/// Context roots reachable from workflow expressions.
pub const CONTEXT_ROOTS: &[&str] = &["github", "inputs", "needs", "env", "secrets", "steps"];

/// Failure to accept an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// The expression contains a token or construct outside the restricted
    /// grammar (function call, arithmetic, indexing, unknown operator, ...).
    #[error("unsafe expression: {reason} at offset {offset}")]
    UnsafeExpression { reason: String, offset: usize },

    /// A context path starts from a root that is not provided at runtime.
    #[error("unknown context root `{root}`")]
    UnknownContext { root: String },
}

impl ExprError {
    pub(crate) fn unsafe_at(reason: impl Into<String>, offset: usize) -> Self {
        ExprError::UnsafeExpression {
            reason: reason.into(),
            offset,
        }
    }
}

/// Validate a context path (already split into dotted segments).
///
/// `needs` and `steps` paths must address an output
/// (`needs.<job>.outputs.<name>`); the other roots only require one
/// trailing segment (`env.FOO`, `github.event_name`).
pub fn validate_path(segments: &[String]) -> Result<(), ExprError> {
    let root = segments.first().map(String::as_str).unwrap_or("");
    if !CONTEXT_ROOTS.contains(&root) {
        return Err(ExprError::UnknownContext {
            root: root.to_string(),
        });
    }

    match root {
        "needs" | "steps" => {
            // needs.<job>.outputs.<name> / steps.<id>.outputs.<name>
            let shape_ok = segments.len() >= 4 && segments[2] == "outputs";
            // needs.<job>.result is also produced by the runtime.
            let result_ok = root == "needs" && segments.len() == 3 && segments[2] == "result";
            if !shape_ok && !result_ok {
                return Err(ExprError::unsafe_at(
                    format!("`{}` paths must address an output", root),
                    0,
                ));
            }
        }
        _ => {
            if segments.len() < 2 {
                return Err(ExprError::unsafe_at(
                    format!("`{root}` requires a property access"),
                    0,
                ));
            }
        }
    }

    Ok(())
}

/// Walk a parsed expression and assert every node is in the safe subset.
///
/// Parsing already rejects unsafe syntax; this pass checks the semantic
/// constraints: context roots must be known and `needs`/`steps` paths must
/// have the output shape.
pub fn validate(expr: &Expr) -> Result<(), ExprError> {
    match expr {
        Expr::StringLit(_) | Expr::NumberLit(_) | Expr::BoolLit(_) | Expr::Null => Ok(()),
        Expr::Context(segments) => validate_path(segments),
        Expr::Not(inner) => validate(inner),
        Expr::Binary { lhs, rhs, .. } => {
            validate(lhs)?;
            validate(rhs)
        }
    }
}

/// Scan `text` for `${{ ... }}` spans, parse and validate each.
///
/// Returns the number of expressions checked, so callers can warn about
/// text that was expected to contain expressions but did not.
pub fn validate_text(text: &str) -> Result<usize, ExprError> {
    let mut checked = 0;
    for segment in segments(text) {
        if segment.kind == SegmentKind::Expression {
            let expr = parse(segment.value)?;
            validate(&expr)?;
            checked += 1;
        }
    }
    Ok(checked)
}
