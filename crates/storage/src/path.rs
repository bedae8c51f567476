//! Structured state paths
//!
//! Whitelist and blacklist entries are parsed once, when configuration is
//! built, into an ordered list of segments. The first segment names a slice.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Path parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Path has no segments
    #[error("State path is empty")]
    Empty,

    /// A segment between separators is empty (e.g. `"ui..theme"`)
    #[error("State path {path:?} has an empty segment at position {position}")]
    EmptySegment {
        /// The offending path
        path: String,
        /// Zero-based segment index
        position: usize,
    },
}

/// A validated path into the state tree, e.g. `interview.currentSession.stream`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    segments: Vec<String>,
}

impl StatePath {
    /// Parse a dotted path
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }

        let segments = path
            .split('.')
            .enumerate()
            .map(|(position, segment)| {
                if segment.is_empty() {
                    Err(PathError::EmptySegment { path: path.to_string(), position })
                } else {
                    Ok(segment.to_string())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    /// Build a path from segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        if let Some(position) = segments.iter().position(String::is_empty) {
            return Err(PathError::EmptySegment { path: segments.join("."), position });
        }
        Ok(Self { segments })
    }

    /// Slice this path starts in
    pub fn slice(&self) -> &str {
        &self.segments[0]
    }

    /// Segments below the slice
    pub fn within_slice(&self) -> &[String] {
        &self.segments[1..]
    }

    /// Whether the path names a whole slice
    pub fn is_slice(&self) -> bool {
        self.segments.len() == 1
    }

    /// All segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Remove the value this path points to inside `slice_value`.
    ///
    /// Only the part of the path below the slice is used. Missing
    /// intermediate keys and non-object values leave the tree untouched.
    /// Returns whether anything was removed.
    pub fn remove_from(&self, slice_value: &mut Value) -> bool {
        remove_at(self.within_slice(), slice_value)
    }

    /// Remove the value at the full path, treating `value` as the root
    pub fn remove_within(&self, value: &mut Value) -> bool {
        remove_at(&self.segments, value)
    }
}

fn remove_at(segments: &[String], value: &mut Value) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = value;
    for segment in parents {
        match current.get_mut(segment.as_str()) {
            Some(next) => current = next,
            None => return false,
        }
    }

    current
        .as_object_mut()
        .map(|map| map.remove(last.as_str()).is_some())
        .unwrap_or(false)
}

impl FromStr for StatePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}
