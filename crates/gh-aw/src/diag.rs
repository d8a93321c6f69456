//! Error taxonomy and diagnostics surfaced to the CLI.
//!
//! Every fatal compiler failure carries a category, the source file it was
//! found in, an optional JSON path into the frontmatter, and a suggested
//! remediation. The CLI maps categories to exit codes: validation failures
//! exit 1, I/O failures exit 2, internal failures exit 3.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Broad failure category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Parse,
    Import,
    Merge,
    Schema,
    Security,
    Expression,
    Pin,
    Graph,
    Io,
    Internal,
}

impl Category {
    /// Process exit code for a failure of this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Category::Io => 2,
            Category::Internal => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Parse => "parse",
            Category::Import => "import",
            Category::Merge => "merge",
            Category::Schema => "schema",
            Category::Security => "security",
            Category::Expression => "expression",
            Category::Pin => "pin",
            Category::Graph => "graph",
            Category::Io => "io",
            Category::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A structured, machine-readable diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub category: Category,
    /// Source file the failure was found in.
    pub path: PathBuf,
    /// JSON path into the frontmatter, where meaningful (e.g.
    /// `safe-outputs.create-issue.max`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)?;
        if let Some(json_path) = &self.json_path {
            write!(f, " (at {json_path})")?;
        }
        if let Some(remediation) = &self.remediation {
            write!(f, "; {remediation}")?;
        }
        Ok(())
    }
}

/// Fatal compiler error for one source file.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Parse(Diagnostic),

    /// `CycleDetected`, `ImportNotFound`, `ForbiddenImport`, `AgentConflict`,
    /// or `SchemaFetchFailed`; the diagnostic message names which.
    #[error("{0}")]
    Import(Diagnostic),

    /// A permission required by an import is missing at the root.
    #[error("{0}")]
    Merge(Diagnostic),

    #[error("{0}")]
    Schema(Diagnostic),

    /// Strict-mode policy violation; the diagnostic message names the policy.
    #[error("{0}")]
    Security(Diagnostic),

    /// `UnsafeExpression` or `UnknownContext`.
    #[error("{0}")]
    Expression(Diagnostic),

    /// Action resolution failed and the pin cache could not satisfy it.
    #[error("{0}")]
    Pin(Diagnostic),

    /// `CycleDetected` or `UnknownDependency` among jobs.
    #[error("{0}")]
    Graph(Diagnostic),

    #[error("{}: {message}", path.display())]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl CompileError {
    pub fn category(&self) -> Category {
        match self {
            CompileError::Parse(_) => Category::Parse,
            CompileError::Import(_) => Category::Import,
            CompileError::Merge(_) => Category::Merge,
            CompileError::Schema(_) => Category::Schema,
            CompileError::Security(_) => Category::Security,
            CompileError::Expression(_) => Category::Expression,
            CompileError::Pin(_) => Category::Pin,
            CompileError::Graph(_) => Category::Graph,
            CompileError::Io { .. } => Category::Io,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            CompileError::Parse(d)
            | CompileError::Import(d)
            | CompileError::Merge(d)
            | CompileError::Schema(d)
            | CompileError::Security(d)
            | CompileError::Expression(d)
            | CompileError::Pin(d)
            | CompileError::Graph(d) => d.clone(),
            CompileError::Io { path, message, .. } => Diagnostic {
                category: Category::Io,
                path: path.clone(),
                json_path: None,
                message: message.clone(),
                remediation: None,
            },
        }
    }

    pub fn io(path: &Path, message: impl Into<String>, source: std::io::Error) -> Self {
        CompileError::Io {
            path: path.to_path_buf(),
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Builder-style constructor used throughout the pipeline stages.
pub fn diagnostic(category: Category, path: &Path, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        category,
        path: path.to_path_buf(),
        json_path: None,
        message: message.into(),
        remediation: None,
    }
}

impl Diagnostic {
    pub fn at(mut self, json_path: impl Into<String>) -> Self {
        self.json_path = Some(json_path.into());
        self
    }

    pub fn suggest(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// Non-fatal finding reported alongside a successful compilation.
#[derive(Debug, Clone, Serialize)]
pub struct Warning {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)?;
        if let Some(json_path) = &self.json_path {
            write!(f, " (at {json_path})")?;
        }
        Ok(())
    }
}
