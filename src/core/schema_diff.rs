//! Structural diff over JSON-like trees with ignored paths.
//!
//! Maps compare independent of key order, sequences compare position by
//! position. Paths are dotted (`attributes.title.required`); a `*` segment
//! matches any single key or index. An ignored path drops its whole subtree
//! from the comparison.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Any,
}

/// Set of path patterns excluded from comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoredPaths {
    patterns: Vec<Vec<Segment>>,
}

impl IgnoredPaths {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse dotted path patterns. Returns the first malformed pattern as the
    /// error (empty input or an empty segment).
    pub fn parse<I, S>(paths: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let segments: Vec<Segment> = path
                .split('.')
                .map(|s| match s {
                    "*" => Segment::Any,
                    other => Segment::Key(other.to_string()),
                })
                .collect();
            if segments
                .iter()
                .any(|s| matches!(s, Segment::Key(k) if k.is_empty()))
            {
                return Err(path.to_string());
            }
            patterns.push(segments);
        }
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn matches(&self, path: &[String]) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern.len() == path.len()
                && pattern.iter().zip(path).all(|(seg, part)| match seg {
                    Segment::Any => true,
                    Segment::Key(k) => k == part,
                })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceKind {
    /// Present on the right only.
    Added,
    /// Present on the left only.
    Removed,
    /// Present on both sides with different values or shapes.
    Changed,
}

/// First structural difference between two trees.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub path: String,
    pub kind: DifferenceKind,
    pub left: Option<Value>,
    pub right: Option<Value>,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "<root>"
        } else {
            &self.path
        };
        match (self.kind, &self.left, &self.right) {
            (DifferenceKind::Added, _, Some(right)) => {
                write!(f, "'{}' only present in destination ({})", path, right)
            }
            (DifferenceKind::Removed, Some(left), _) => {
                write!(f, "'{}' only present in source ({})", path, left)
            }
            (_, Some(left), Some(right)) => {
                write!(f, "'{}' differs: {} != {}", path, left, right)
            }
            _ => write!(f, "'{}' differs", path),
        }
    }
}

/// Compare two trees and return the first difference, if any.
pub fn diff(left: &Value, right: &Value, ignored: &IgnoredPaths) -> Option<Difference> {
    let mut path = Vec::new();
    diff_at(left, right, ignored, &mut path)
}

fn diff_at(
    left: &Value,
    right: &Value,
    ignored: &IgnoredPaths,
    path: &mut Vec<String>,
) -> Option<Difference> {
    if !path.is_empty() && ignored.matches(path) {
        return None;
    }

    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
            for key in keys {
                path.push(key.clone());
                let found = match (l.get(key), r.get(key)) {
                    (Some(lv), Some(rv)) => diff_at(lv, rv, ignored, path),
                    (lv, rv) => one_sided(lv, rv, ignored, path),
                };
                path.pop();
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        (Value::Array(l), Value::Array(r)) => {
            for index in 0..l.len().max(r.len()) {
                path.push(index.to_string());
                let found = match (l.get(index), r.get(index)) {
                    (Some(lv), Some(rv)) => diff_at(lv, rv, ignored, path),
                    (lv, rv) => one_sided(lv, rv, ignored, path),
                };
                path.pop();
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        _ if left == right => None,
        _ => Some(Difference {
            path: path.join("."),
            kind: DifferenceKind::Changed,
            left: Some(left.clone()),
            right: Some(right.clone()),
        }),
    }
}

fn one_sided(
    left: Option<&Value>,
    right: Option<&Value>,
    ignored: &IgnoredPaths,
    path: &[String],
) -> Option<Difference> {
    if ignored.matches(path) {
        return None;
    }
    let kind = if left.is_some() {
        DifferenceKind::Removed
    } else {
        DifferenceKind::Added
    };
    Some(Difference {
        path: path.join("."),
        kind,
        left: left.cloned(),
        right: right.cloned(),
    })
}
