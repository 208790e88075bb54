//! JSONPath subset used for version listing and probe validation:
//! dotted paths, bracketed indices, and a terminal `[*]` that collects
//! array elements. Anything else is rejected up front.

use serde_json::Value;

use crate::error::{OpsdeckError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

fn parse(path: &str) -> Result<Vec<Segment>> {
    let trimmed = path.trim();
    let rest = trimmed
        .strip_prefix('$')
        .ok_or_else(|| OpsdeckError::Validation(format!("json path must start with '$': {path}")))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.peek().copied() {
        match c {
            '.' => {
                chars.next();
                let mut key = String::new();
                while let Some(&k) = chars.peek() {
                    if k == '.' || k == '[' {
                        break;
                    }
                    key.push(k);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(OpsdeckError::Validation(format!(
                        "empty key segment in json path: {path}"
                    )));
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                chars.next();
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(k) => inner.push(k),
                        None => {
                            return Err(OpsdeckError::Validation(format!(
                                "unterminated bracket in json path: {path}"
                            )))
                        }
                    }
                }
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    let index = inner.parse::<usize>().map_err(|_| {
                        OpsdeckError::Validation(format!(
                            "bracket segment must be an index or '*': [{inner}]"
                        ))
                    })?;
                    segments.push(Segment::Index(index));
                }
            }
            other => {
                return Err(OpsdeckError::Validation(format!(
                    "unexpected character '{other}' in json path: {path}"
                )))
            }
        }
    }

    // `[*]` collects an array and must therefore be last.
    if let Some(pos) = segments.iter().position(|s| *s == Segment::Wildcard) {
        if pos != segments.len() - 1 {
            return Err(OpsdeckError::Validation(format!(
                "'[*]' is only supported as the final segment: {path}"
            )));
        }
    }

    Ok(segments)
}

/// Evaluate `path` against `root`. A terminal `[*]` yields every element of
/// the addressed array in order; otherwise at most one value is returned.
pub fn evaluate<'a>(root: &'a Value, path: &str) -> Result<Vec<&'a Value>> {
    let segments = parse(path)?;
    let mut current = root;

    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Key(key) => match current.get(key.as_str()) {
                Some(next) => current = next,
                None => return Ok(Vec::new()),
            },
            Segment::Index(index) => match current.get(index) {
                Some(next) => current = next,
                None => return Ok(Vec::new()),
            },
            Segment::Wildcard => {
                debug_assert_eq!(i, segments.len() - 1);
                return match current.as_array() {
                    Some(items) => Ok(items.iter().collect()),
                    None => Ok(Vec::new()),
                };
            }
        }
    }

    Ok(vec![current])
}

/// Evaluate and render each result as a string, preserving server order.
pub fn evaluate_strings(root: &Value, path: &str) -> Result<Vec<String>> {
    Ok(evaluate(root, path)?
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}
