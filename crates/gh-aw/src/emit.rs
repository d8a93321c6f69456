//! Deterministic, comment-annotated YAML emission.
//!
//! The corpus serializers cannot attach the inline ` # original-reference`
//! comments the lock format requires, so the writer here is hand-rolled
//! over a small node tree. Rules: canonical key order per job object (the
//! builder constructs maps in order; [`sort_job_keys`]/[`sort_step_keys`]
//! reorder user-authored maps), scalars quoted only when the YAML grammar
//! demands it, LF endings, no trailing whitespace.

use std::fmt::Write as _;
use std::path::Path;

use serde_yaml::Value;

use crate::lock::write_atomic;

/// Canonical key order for job objects.
const JOB_KEY_ORDER: &[&str] = &[
    "name",
    "needs",
    "if",
    "runs-on",
    "permissions",
    "environment",
    "concurrency",
    "env",
    "services",
    "timeout-minutes",
    "outputs",
    "steps",
];

/// Canonical key order for step objects.
const STEP_KEY_ORDER: &[&str] = &[
    "name",
    "id",
    "if",
    "uses",
    "run",
    "shell",
    "with",
    "env",
    "continue-on-error",
    "timeout-minutes",
];

/// A value to be emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Str {
        value: String,
        comment: Option<String>,
    },
    Bool(bool),
    Int(i64),
    /// Pre-formatted scalar emitted verbatim (numbers from user YAML, so
    /// no floating-point reformatting happens).
    Raw(String),
    Seq(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub fn str(value: impl Into<String>) -> Node {
        Node::Str {
            value: value.into(),
            comment: None,
        }
    }

    /// A string scalar with an inline comment, e.g. a pinned `uses:`.
    pub fn commented(value: impl Into<String>, comment: impl Into<String>) -> Node {
        Node::Str {
            value: value.into(),
            comment: Some(comment.into()),
        }
    }

    pub fn map(entries: Vec<(&str, Node)>) -> Node {
        Node::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Convert parsed YAML (user-authored jobs) into the emit tree,
    /// preserving mapping order.
    pub fn from_yaml(value: &Value) -> Node {
        match value {
            Value::Null => Node::Raw("null".to_string()),
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Raw(n.to_string()),
            Value::String(s) => Node::str(s),
            Value::Sequence(seq) => Node::Seq(seq.iter().map(Node::from_yaml).collect()),
            Value::Mapping(map) => Node::Map(
                map.iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::String(s) => s.clone(),
                            other => serde_yaml::to_string(other)
                                .unwrap_or_default()
                                .trim()
                                .to_string(),
                        };
                        (key, Node::from_yaml(v))
                    })
                    .collect(),
            ),
            Value::Tagged(tagged) => Node::from_yaml(&tagged.value),
        }
    }
}

fn sort_by_order(entries: Vec<(String, Node)>, order: &[&str]) -> Vec<(String, Node)> {
    let mut known: Vec<(String, Node)> = Vec::new();
    let mut unknown: Vec<(String, Node)> = Vec::new();
    let mut remaining = entries;
    for key in order {
        if let Some(pos) = remaining.iter().position(|(k, _)| k == key) {
            known.push(remaining.remove(pos));
        }
    }
    unknown.extend(remaining);
    known.extend(unknown);
    known
}

/// Reorder a job mapping into canonical key order (unknown keys keep their
/// relative order after the known ones).
pub fn sort_job_keys(node: Node) -> Node {
    match node {
        Node::Map(entries) => {
            let mut sorted = sort_by_order(entries, JOB_KEY_ORDER);
            for (key, value) in sorted.iter_mut() {
                if key == "steps"
                    && let Node::Seq(steps) = value
                {
                    for step in steps.iter_mut() {
                        let owned = std::mem::replace(step, Node::Seq(Vec::new()));
                        *step = sort_step_keys(owned);
                    }
                }
            }
            Node::Map(sorted)
        }
        other => other,
    }
}

/// Reorder a step mapping into canonical key order.
pub fn sort_step_keys(node: Node) -> Node {
    match node {
        Node::Map(entries) => Node::Map(sort_by_order(entries, STEP_KEY_ORDER)),
        other => other,
    }
}

const YAML_WORDS: &[&str] = &[
    "true", "false", "null", "~", "True", "False", "Null", "TRUE", "FALSE", "NULL",
];

fn looks_numeric(s: &str) -> bool {
    let t = s.strip_prefix(['-', '+']).unwrap_or(s);
    if matches!(
        t,
        ".inf" | ".Inf" | ".INF" | ".nan" | ".NaN" | ".NAN"
    ) {
        return true;
    }
    !t.is_empty()
        && (t.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '_')
            && t.chars().any(|c| c.is_ascii_digit())
            || t.starts_with("0x")
            || t.starts_with("0o")
            // Exponent forms like `1e3` resolve as floats. Over-quoting a
            // plain word that happens to parse is harmless.
            || t.parse::<f64>().is_ok())
}

/// Does this string need quoting as a YAML block-context scalar?
fn needs_quotes(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.starts_with(char::is_whitespace) || s.ends_with(char::is_whitespace) {
        return true;
    }
    let first = s.chars().next().unwrap_or(' ');
    if matches!(
        first,
        '!' | '&' | '*' | '?' | '|' | '>' | '%' | '@' | '`' | '"' | '\'' | '#' | '-' | ':'
            | ',' | '[' | ']' | '{' | '}'
    ) {
        // `- ` / `: ` / `? ` only matter when followed by space, but
        // quoting them unconditionally keeps the rule simple and stable.
        if s.len() == 1 || s[1..].starts_with(' ') || matches!(first, '!' | '&' | '*' | '%' | '@' | '`' | '"' | '\'' | '#' | '[' | ']' | '{' | '}' | ',' | '|' | '>') {
            return true;
        }
    }
    if s.contains(": ") || s.ends_with(':') || s.contains(" #") {
        return true;
    }
    if s.contains('\t')
        || s.chars()
            .any(|c| c.is_control() || matches!(c, '\u{85}' | '\u{2028}' | '\u{2029}'))
    {
        return true;
    }
    if YAML_WORDS.contains(&s) || looks_numeric(s) {
        return true;
    }
    false
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() || matches!(c, '\u{85}' | '\u{2028}' | '\u{2029}') => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Block scalars cannot open with an indented line without an explicit
/// indentation indicator, and lines with trailing whitespace would leak it
/// into the output; such values fall back to quoted form.
fn block_scalar_safe(value: &str) -> bool {
    !value.starts_with(' ')
        && !value.starts_with('\t')
        && !value
            .lines()
            .any(|line| line.ends_with(' ') || line.ends_with('\t'))
}

fn scalar_repr(s: &str) -> String {
    if needs_quotes(s) {
        quote(s)
    } else {
        s.to_string()
    }
}

struct Writer {
    out: String,
}

impl Writer {
    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }

    fn write_scalar_line(&mut self, prefix: &str, depth: usize, node: &Node) {
        self.indent(depth);
        self.out.push_str(prefix);
        match node {
            Node::Str { value, comment } => {
                self.out.push_str(&scalar_repr(value));
                if let Some(comment) = comment {
                    self.out.push_str(" # ");
                    self.out.push_str(comment);
                }
            }
            Node::Bool(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Node::Int(i) => {
                let _ = write!(self.out, "{i}");
            }
            Node::Raw(raw) => self.out.push_str(raw),
            Node::Seq(_) | Node::Map(_) => unreachable!("scalar expected"),
        }
        self.out.push('\n');
    }

    fn write_block_scalar(&mut self, key_prefix: &str, depth: usize, value: &str) {
        self.indent(depth);
        self.out.push_str(key_prefix);
        if value.ends_with('\n') {
            self.out.push_str("|\n");
        } else {
            self.out.push_str("|-\n");
        }
        for line in value.lines() {
            if line.is_empty() {
                self.out.push('\n');
            } else {
                self.indent(depth + 1);
                self.out.push_str(line);
                self.out.push('\n');
            }
        }
    }

    fn write_entry(&mut self, key: &str, node: &Node, depth: usize) {
        let key_repr = scalar_repr(key);
        match node {
            Node::Map(entries) if entries.is_empty() => {
                self.write_raw_line(&format!("{key_repr}: {{}}"), depth);
            }
            Node::Seq(items) if items.is_empty() => {
                self.write_raw_line(&format!("{key_repr}: []"), depth);
            }
            Node::Map(entries) => {
                self.write_raw_line(&format!("{key_repr}:"), depth);
                for (k, v) in entries {
                    self.write_entry(k, v, depth + 1);
                }
            }
            Node::Seq(items) => {
                self.write_raw_line(&format!("{key_repr}:"), depth);
                for item in items {
                    self.write_seq_item(item, depth + 1);
                }
            }
            Node::Str { value, comment }
                if value.contains('\n') && comment.is_none() && block_scalar_safe(value) =>
            {
                self.write_block_scalar(&format!("{key_repr}: "), depth, value);
            }
            scalar => {
                self.write_scalar_line(&format!("{key_repr}: "), depth, scalar);
            }
        }
    }

    fn write_seq_item(&mut self, node: &Node, depth: usize) {
        match node {
            Node::Map(entries) if entries.is_empty() => {
                self.write_raw_line("- {}", depth);
            }
            Node::Map(entries) => {
                // First entry shares the dash line.
                let mut iter = entries.iter();
                if let Some((first_key, first_value)) = iter.next() {
                    match first_value {
                        Node::Map(_) | Node::Seq(_) => {
                            self.write_raw_line("-", depth);
                            self.write_entry(first_key, first_value, depth + 1);
                        }
                        Node::Str { value, comment }
                            if value.contains('\n')
                                && comment.is_none()
                                && block_scalar_safe(value) =>
                        {
                            self.indent(depth);
                            self.out.push_str("- ");
                            // Re-emit without the already-written indent.
                            let mut inner = Writer { out: String::new() };
                            inner.write_block_scalar(
                                &format!("{}: ", scalar_repr(first_key)),
                                0,
                                value,
                            );
                            self.push_hanging(&inner.out, depth + 1);
                        }
                        scalar => {
                            self.write_scalar_line(
                                &format!("- {}: ", scalar_repr(first_key)),
                                depth,
                                scalar,
                            );
                        }
                    }
                    for (k, v) in iter {
                        self.write_entry(k, v, depth + 1);
                    }
                }
            }
            Node::Seq(items) if items.is_empty() => {
                self.write_raw_line("- []", depth);
            }
            Node::Seq(items) => {
                self.write_raw_line("-", depth);
                for item in items {
                    self.write_seq_item(item, depth + 1);
                }
            }
            Node::Str { value, comment }
                if value.contains('\n') && comment.is_none() && block_scalar_safe(value) =>
            {
                self.write_block_scalar("- ", depth, value);
            }
            scalar => {
                self.write_scalar_line("- ", depth, scalar);
            }
        }
    }

    /// Append pre-rendered text whose first line continues the current
    /// line and whose remaining lines are re-indented.
    fn push_hanging(&mut self, rendered: &str, depth: usize) {
        let mut lines = rendered.lines();
        if let Some(first) = lines.next() {
            self.out.push_str(first);
            self.out.push('\n');
        }
        for line in lines {
            if line.is_empty() {
                self.out.push('\n');
            } else {
                self.indent(depth);
                self.out.push_str(line);
                self.out.push('\n');
            }
        }
    }

    fn write_raw_line(&mut self, line: &str, depth: usize) {
        self.indent(depth);
        self.out.push_str(line);
        self.out.push('\n');
    }
}

/// Render a top-level mapping as a YAML document body.
pub fn render_document(root: &Node) -> String {
    let mut writer = Writer { out: String::new() };
    match root {
        Node::Map(entries) => {
            for (k, v) in entries {
                writer.write_entry(k, v, 0);
            }
        }
        other => writer.write_seq_item(other, 0),
    }
    writer.out
}

/// Everything that goes into one lock file.
pub struct LockFileParts<'a> {
    pub source_display: &'a str,
    pub source_sha: &'a str,
    /// Import manifest lines in BFS order (root excluded).
    pub manifest: &'a [String],
    /// Mermaid graph lines, starting with `graph LR`.
    pub mermaid: &'a [String],
    /// The original Markdown body, reproduced verbatim in the header.
    pub prompt: &'a str,
    pub workflow: &'a Node,
}

/// Render the complete lock file: header comment block plus workflow YAML.
pub fn render_lock_file(parts: &LockFileParts<'_>) -> String {
    let mut out = String::new();
    out.push_str("# gh-aw compiled workflow\n");
    let _ = writeln!(
        out,
        "# source: {}  sha: {}",
        parts.source_display, parts.source_sha
    );
    out.push_str("# imports:\n");
    for entry in parts.manifest {
        let _ = writeln!(out, "#   - {entry}");
    }
    out.push_str("# dependency graph (mermaid):\n");
    for line in parts.mermaid {
        let _ = writeln!(out, "#   {line}");
    }
    out.push_str("# prompt:\n");
    for line in parts.prompt.lines() {
        if line.is_empty() {
            out.push_str("#\n");
        } else {
            let _ = writeln!(out, "#   {line}");
        }
    }
    out.push('\n');
    out.push_str(&render_document(parts.workflow));
    out
}

/// Write a lock file atomically (temp file + rename); no partial artifact
/// is ever visible.
pub fn write_lock_file(path: &Path, content: &str) -> anyhow::Result<()> {
    write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_mapping_renders_plainly() {
        let doc = Node::map(vec![
            ("name", Node::str("ci")),
            ("timeout-minutes", Node::Int(15)),
            ("enabled", Node::Bool(true)),
        ]);
        assert_eq!(
            render_document(&doc),
            "name: ci\ntimeout-minutes: 15\nenabled: true\n"
        );
    }

    #[test]
    fn strings_are_quoted_only_when_required() {
        for (input, expected) in [
            ("plain", "plain"),
            ("with spaces", "with spaces"),
            ("${{ secrets.A || github.token }}", "${{ secrets.A || github.token }}"),
            ("true", "\"true\""),
            ("125", "\"125\""),
            ("1.5", "\"1.5\""),
            ("", "\"\""),
            ("a: b", "\"a: b\""),
            ("ends with colon:", "\"ends with colon:\""),
            ("# leading hash", "\"# leading hash\""),
            ("has # inline", "\"has # inline\""),
            ("*glob", "\"*glob\""),
            ("[main]", "\"[main]\""),
            (" leading space", "\" leading space\""),
        ] {
            assert_eq!(scalar_repr(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn inline_comment_is_attached_to_scalar() {
        let doc = Node::map(vec![(
            "uses",
            Node::commented(
                format!("actions/checkout@{}", "a".repeat(40)),
                "actions/checkout@v4",
            ),
        )]);
        assert_eq!(
            render_document(&doc),
            format!(
                "uses: actions/checkout@{} # actions/checkout@v4\n",
                "a".repeat(40)
            )
        );
    }

    #[test]
    fn nested_maps_and_sequences_indent_two_spaces() {
        let doc = Node::map(vec![(
            "jobs",
            Node::map(vec![(
                "agent",
                Node::map(vec![
                    ("runs-on", Node::str("ubuntu-latest")),
                    (
                        "steps",
                        Node::Seq(vec![Node::map(vec![
                            ("name", Node::str("Checkout")),
                            ("uses", Node::str("actions/checkout@abc")),
                        ])]),
                    ),
                ]),
            )]),
        )]);
        let expected = "jobs:\n  agent:\n    runs-on: ubuntu-latest\n    steps:\n      - name: Checkout\n        uses: actions/checkout@abc\n";
        assert_eq!(render_document(&doc), expected);
    }

    #[test]
    fn multiline_strings_use_block_scalars() {
        let doc = Node::map(vec![("run", Node::str("echo one\necho two\n"))]);
        assert_eq!(render_document(&doc), "run: |\n  echo one\n  echo two\n");

        let doc = Node::map(vec![("run", Node::str("echo one\necho two"))]);
        assert_eq!(render_document(&doc), "run: |-\n  echo one\n  echo two\n");
    }

    #[test]
    fn indented_first_line_falls_back_to_quoted() {
        let doc = Node::map(vec![("run", Node::str("  indented first\nsecond\n"))]);
        let rendered = render_document(&doc);
        assert!(rendered.starts_with("run: \""), "{rendered}");
        let parsed: serde_yaml::Mapping = serde_yaml::from_str(&rendered).expect("parses");
        assert_eq!(
            parsed
                .get(Value::String("run".to_string()))
                .and_then(Value::as_str),
            Some("  indented first\nsecond\n")
        );
    }

    #[test]
    fn empty_collections_render_flow_style() {
        let doc = Node::map(vec![
            ("with", Node::Map(Vec::new())),
            ("needs", Node::Seq(Vec::new())),
        ]);
        assert_eq!(render_document(&doc), "with: {}\nneeds: []\n");
    }

    #[test]
    fn no_trailing_whitespace_anywhere() {
        let doc = Node::map(vec![
            ("a", Node::map(vec![("b", Node::str("x"))])),
            ("run", Node::str("line\n\nafter blank\n")),
        ]);
        let text = render_document(&doc);
        for line in text.lines() {
            assert_eq!(line.trim_end(), line, "trailing whitespace in {line:?}");
        }
    }

    #[test]
    fn from_yaml_preserves_order_and_numbers() {
        let value: Value = serde_yaml::from_str("zeta: 1\nalpha: 2.50\nlist: [a, true]\n")
            .expect("yaml");
        let node = Node::from_yaml(&value);
        let Node::Map(entries) = &node else {
            panic!("expected map");
        };
        assert_eq!(entries[0].0, "zeta");
        assert_eq!(entries[1].0, "alpha");
        let rendered = render_document(&node);
        assert!(rendered.starts_with("zeta: 1\nalpha: 2.5"), "{rendered}");
    }

    #[test]
    fn sort_job_keys_applies_canonical_order() {
        let job = Node::map(vec![
            ("steps", Node::Seq(vec![Node::map(vec![
                ("run", Node::str("make")),
                ("name", Node::str("Build")),
            ])])),
            ("runs-on", Node::str("ubuntu-latest")),
            ("custom-key", Node::str("x")),
            ("needs", Node::Seq(vec![Node::str("activation")])),
        ]);
        let Node::Map(sorted) = sort_job_keys(job) else {
            panic!("expected map");
        };
        let keys: Vec<&str> = sorted.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["needs", "runs-on", "steps", "custom-key"]);

        // Step keys were canonicalized too.
        let steps = &sorted.iter().find(|(k, _)| k == "steps").unwrap().1;
        let Node::Seq(items) = steps else { panic!() };
        let Node::Map(step) = &items[0] else { panic!() };
        let step_keys: Vec<&str> = step.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(step_keys, vec!["name", "run"]);
    }

    #[test]
    fn lock_file_header_shape() {
        let workflow = Node::map(vec![("name", Node::str("ci"))]);
        let manifest = vec![format!("acme/shared/wf.md@{}", "b".repeat(40))];
        let mermaid = vec![
            "graph LR".to_string(),
            "activation --> agent".to_string(),
        ];
        let rendered = render_lock_file(&LockFileParts {
            source_display: ".github/workflows/ci.md",
            source_sha: "deadbeef",
            manifest: &manifest,
            mermaid: &mermaid,
            prompt: "Do the thing.\n\nCarefully.\n",
            workflow: &workflow,
        });

        let expected_head = "\
# gh-aw compiled workflow
# source: .github/workflows/ci.md  sha: deadbeef
# imports:
#   - acme/shared/wf.md@bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
# dependency graph (mermaid):
#   graph LR
#   activation --> agent
# prompt:
#   Do the thing.
#
#   Carefully.

name: ci
";
        assert_eq!(rendered, expected_head);
    }

    #[test]
    fn canonical_job_rendering_snapshot() {
        let job = sort_job_keys(Node::map(vec![
            ("steps", Node::Seq(vec![Node::map(vec![
                ("uses", Node::commented(
                    format!("actions/checkout@{}", "1".repeat(40)),
                    "actions/checkout@v4",
                )),
                ("name", Node::str("Checkout repository")),
            ])])),
            ("timeout-minutes", Node::Int(15)),
            ("permissions", Node::map(vec![("contents", Node::str("read"))])),
            ("runs-on", Node::str("ubuntu-latest")),
            ("needs", Node::Seq(vec![Node::str("activation")])),
            ("if", Node::str("needs.pre_activation.outputs.activated == 'true'")),
        ]));
        let doc = Node::map(vec![("agent", job)]);
        insta::assert_snapshot!(render_document(&doc), @r"
        agent:
          needs:
            - activation
          if: needs.pre_activation.outputs.activated == 'true'
          runs-on: ubuntu-latest
          permissions:
            contents: read
          timeout-minutes: 15
          steps:
            - name: Checkout repository
              uses: actions/checkout@1111111111111111111111111111111111111111 # actions/checkout@v4
        ");
    }

    #[test]
    fn determinism_byte_for_byte() {
        let doc = Node::map(vec![
            ("on", Node::map(vec![("workflow_dispatch", Node::Map(Vec::new()))])),
            ("jobs", Node::map(vec![("agent", Node::map(vec![
                ("runs-on", Node::str("ubuntu-latest")),
            ]))])),
        ]);
        assert_eq!(render_document(&doc), render_document(&doc));
    }
}
