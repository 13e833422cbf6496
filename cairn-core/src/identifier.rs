//! Hierarchical record addressing.
//!
//! An [`Identifier`] is an ordered list of path segments (the group/type
//! hierarchy) plus a leaf id. It is the cache key of every engine and the
//! coordinate of every event.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered path segments plus a leaf id.
///
/// The derived ordering compares `path` lexicographically segment by segment,
/// then `id`, which is the order replay delivers records in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub path: Vec<String>,
    pub id: String,
}

impl Identifier {
    /// Create an identifier from path segments and a leaf id.
    pub fn new<I, S>(path: I, id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            id: id.into(),
        }
    }

    /// Parse a slash-separated location; the last segment becomes the id.
    ///
    /// Empty segments are ignored, so `"/a//b/"` parses like `"a/b"`.
    /// Returns `None` when no segment is left.
    pub fn parse(location: &str) -> Option<Self> {
        let mut segments: Vec<String> = location
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let id = segments.pop()?;
        Some(Self { path: segments, id })
    }

    /// Render as `path/…/id`.
    pub fn as_path(&self) -> String {
        if self.path.is_empty() {
            return self.id.clone();
        }
        format!("{}/{}", self.path.join("/"), self.id)
    }

    /// Render without the first path segment (the entity type).
    pub fn as_path_no_type(&self) -> String {
        match self.path.split_first() {
            Some((_, rest)) if !rest.is_empty() => format!("{}/{}", rest.join("/"), self.id),
            _ => self.id.clone(),
        }
    }

    /// The first path segment, which names the entity type.
    pub fn entity_type(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// The path joined by `/`, without the id.
    pub fn joined_path(&self) -> String {
        self.path.join("/")
    }

    /// Identifier of a record one level below this one.
    pub fn child(&self, id: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(self.id.clone());
        Self {
            path,
            id: id.into(),
        }
    }

    /// Identifier of the record owning this one, if any.
    pub fn parent(&self) -> Option<Self> {
        let (last, rest) = self.path.split_last()?;
        Some(Self {
            path: rest.to_vec(),
            id: last.clone(),
        })
    }

    /// Whether this identifier's path starts with `prefix`.
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.path.len() >= prefix.len() && self.path[..prefix.len()] == *prefix
    }

    /// Prepend `prefix` to the path.
    pub fn prefixed(&self, prefix: &[String]) -> Self {
        let mut path = prefix.to_vec();
        path.extend(self.path.iter().cloned());
        Self {
            path,
            id: self.id.clone(),
        }
    }

    /// Strip `prefix` from the path, if it is one.
    pub fn strip_prefix(&self, prefix: &[String]) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            path: self.path[prefix.len()..].to_vec(),
            id: self.id.clone(),
        })
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_path())
    }
}
