//! Split text into literal runs and `${{ ... }}` expression spans.

/// The kind of scanned segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal text outside of any expression.
    Text,
    /// The inside of a `${{ ... }}` span (delimiters stripped).
    Expression,
}

/// A scanned segment with its byte offset into the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub kind: SegmentKind,
    pub value: &'a str,
    /// Byte offset of `value` within the scanned text.
    pub offset: usize,
}

/// Scan `text` into alternating text and expression segments.
///
/// An unterminated `${{` swallows the remainder of the text as one
/// expression segment; the parser then rejects it, which surfaces a better
/// error than silently treating it as literal text.
pub fn segments(text: &str) -> impl Iterator<Item = Segment<'_>> + '_ {
    let mut remainder = text;
    let mut offset = 0usize;
    let mut in_expression = false;
    let mut done = false;

    std::iter::from_fn(move || {
        if done {
            return None;
        }

        if in_expression {
            match remainder.split_once("}}") {
                Some((inner, after)) => {
                    let seg = Segment {
                        kind: SegmentKind::Expression,
                        value: inner,
                        offset,
                    };
                    offset += inner.len() + 2;
                    remainder = after;
                    in_expression = false;
                    Some(seg)
                }
                None => {
                    let seg = Segment {
                        kind: SegmentKind::Expression,
                        value: remainder,
                        offset,
                    };
                    remainder = "";
                    done = true;
                    Some(seg)
                }
            }
        } else {
            match remainder.split_once("${{") {
                Some((before, after)) => {
                    let seg = Segment {
                        kind: SegmentKind::Text,
                        value: before,
                        offset,
                    };
                    offset += before.len() + 3;
                    remainder = after;
                    in_expression = true;
                    Some(seg)
                }
                None => {
                    let seg = Segment {
                        kind: SegmentKind::Text,
                        value: remainder,
                        offset,
                    };
                    remainder = "";
                    done = true;
                    Some(seg)
                }
            }
        }
    })
}
