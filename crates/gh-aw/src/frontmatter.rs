//! Frontmatter parsing: YAML head plus Markdown body.
//!
//! A workflow source opens with a line containing exactly `---`, an ordered
//! YAML mapping, and a closing `---` line. Everything after the closing
//! delimiter is the body. Mapping order is preserved so diagnostics and
//! emission stay deterministic.

use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::diag::{Category, CompileError, diagnostic};
use crate::types::{WorkflowSource, sha256_hex};

/// Ordered frontmatter mapping with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Frontmatter {
    mapping: Mapping,
}

impl Frontmatter {
    pub fn new(mapping: Mapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn into_mapping(self) -> Mapping {
        self.mapping
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.mapping.get(Value::String(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_mapping(&self, key: &str) -> Option<&Mapping> {
        self.get(key).and_then(Value::as_mapping)
    }

    pub fn get_sequence(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key).and_then(Value::as_sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().filter_map(Value::as_str)
    }
}

const DELIMITER: &str = "---";

/// Split raw file content into (frontmatter text, body, head offset).
///
/// Returns `None` when the file does not open with a frontmatter fence.
fn split(content: &str) -> Option<(&str, &str, usize)> {
    let rest = content.strip_prefix('\u{feff}').unwrap_or(content);
    let bom_len = content.len() - rest.len();

    let mut lines = rest.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim_end_matches(['\r', '\n']) != DELIMITER {
        return None;
    }

    let head_start = bom_len + first.len();
    let mut offset = head_start;
    for line in lines {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            let head = &content[head_start..offset];
            let body = &content[offset + line.len()..];
            return Some((head, body, head_start));
        }
        offset += line.len();
    }
    None
}

/// Parse in-memory bytes into a [`WorkflowSource`].
///
/// `allow_bare` admits files without any frontmatter fence, used for
/// imports pulled in solely for body inclusion.
pub fn parse_bytes(
    path: &Path,
    content: &str,
    allow_bare: bool,
) -> Result<WorkflowSource, CompileError> {
    let sha = sha256_hex(content.as_bytes());

    let Some((head, body, head_offset)) = split(content) else {
        if allow_bare {
            return Ok(WorkflowSource {
                path: path.to_path_buf(),
                frontmatter: Frontmatter::default(),
                body: content.to_string(),
                sha,
            });
        }
        return Err(CompileError::Parse(
            diagnostic(Category::Parse, path, "invalid source: missing frontmatter")
                .suggest("open the file with a `---` fenced YAML block"),
        ));
    };

    let mapping: Mapping = if head.trim().is_empty() {
        Mapping::new()
    } else {
        serde_yaml::from_str(head).map_err(|e| {
            let offset = e
                .location()
                .map(|loc| head_offset + loc.index())
                .unwrap_or(head_offset);
            CompileError::Parse(diagnostic(
                Category::Parse,
                path,
                format!("malformed frontmatter at byte {offset}: {e}"),
            ))
        })?
    };

    Ok(WorkflowSource {
        path: path.to_path_buf(),
        frontmatter: Frontmatter::new(mapping),
        body: body.to_string(),
        sha,
    })
}

/// Parse a source file from disk.
pub fn parse_file(path: &Path, allow_bare: bool) -> Result<WorkflowSource, CompileError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CompileError::io(path, format!("failed to read {}", path.display()), e))?;
    parse_bytes(path, &content, allow_bare)
}
