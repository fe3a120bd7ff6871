//! # Environment Path Grammar
//!
//! Paths address values inside the gateway request environment. A path is a
//! dot-separated sequence of segments; a segment may carry one bracketed
//! subscript:
//!
//! - `requests[0].response.json.id` — literal sequence index
//! - `route.headers["Content-Type"]` — explicit (quoted) map key
//! - `constants.lookup[route.dynamic.country]` — dynamic subscript: the inner
//!   expression is itself resolved through the environment before use
//!
//! The parser is purely syntactic. Dynamic subscripts are resolved by the
//! environment at traversal time.

use crate::core::error::ReferenceError;

/// One parsed path segment: a key plus an optional bracketed subscript.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub key: String,
    pub subscript: Option<Subscript>,
}

/// The bracketed part of a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Subscript {
    /// Literal non-negative integer, e.g. `[2]`.
    Index(usize),
    /// Quoted string, e.g. `["Content-Type"]`.
    Key(String),
    /// Unquoted inner expression, resolved through the environment first.
    Expr(String),
}

/// Parse a full path into segments.
///
/// Dots inside brackets belong to the inner expression, so
/// `lookup[route.dynamic.id]` is a single segment.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, ReferenceError> {
    if path.is_empty() {
        return Err(ReferenceError::new("empty environment path"));
    }

    let mut segments = Vec::new();
    for raw in split_segments(path)? {
        segments.push(parse_segment(&raw, path)?);
    }
    Ok(segments)
}

/// Split on dots at bracket depth zero.
fn split_segments(path: &str) -> Result<Vec<String>, ReferenceError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                if depth == 0 {
                    return Err(ReferenceError::new(format!(
                        "unbalanced ']' in path '{path}'"
                    )));
                }
                depth -= 1;
                current.push(ch);
            }
            '.' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err(ReferenceError::new(format!("unclosed '[' in path '{path}'")));
    }
    parts.push(current);

    if parts.iter().any(|p| p.is_empty()) {
        return Err(ReferenceError::new(format!(
            "empty segment in path '{path}'"
        )));
    }
    Ok(parts)
}

fn parse_segment(raw: &str, full_path: &str) -> Result<Segment, ReferenceError> {
    let Some(open) = raw.find('[') else {
        return Ok(Segment {
            key: raw.to_string(),
            subscript: None,
        });
    };

    if !raw.ends_with(']') {
        return Err(ReferenceError::new(format!(
            "array notation failed for '{raw}' (from: {full_path})"
        )));
    }
    let key = &raw[..open];
    let inner = &raw[open + 1..raw.len() - 1];
    if key.is_empty() || inner.is_empty() || inner.contains('[') {
        return Err(ReferenceError::new(format!(
            "array notation failed for '{raw}' (from: {full_path})"
        )));
    }

    let subscript = if let Ok(index) = inner.parse::<usize>() {
        Subscript::Index(index)
    } else if (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
        || (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
    {
        Subscript::Key(inner[1..inner.len() - 1].to_string())
    } else {
        Subscript::Expr(inner.to_string())
    };

    Ok(Segment {
        key: key.to_string(),
        subscript: Some(subscript),
    })
}
