//! Tree path parsing and broadcast key matching.
//!
//! Tree paths are slash-separated strings like "/Network/Service/en0".
//! Empty segments are discarded, so "//Network/" and "/Network" name the
//! same node. A path with no segments left is rejected.
//!
//! Broadcast keys are colon-separated ("Prefs:commit:/var/db/prefs.json")
//! and watchers may register glob patterns over them.

use crate::error::{PrefsError, Result};

/// A normalized tree path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreePath {
    /// Segments with empty components removed
    segments: Vec<String>,
}

impl TreePath {
    /// Parse and normalize a path string.
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        if segments.is_empty() {
            return Err(PrefsError::BadArgument(format!("empty path {path:?}")));
        }

        Ok(Self { segments })
    }

    /// Build a path from already-split segments.
    pub fn from_segments(segments: Vec<String>) -> Result<Self> {
        let path = Self {
            segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
        };
        if path.segments.is_empty() {
            return Err(PrefsError::BadArgument("empty path".to_string()));
        }
        Ok(path)
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment.
    pub fn leaf(&self) -> &str {
        // parse() guarantees at least one segment
        &self.segments[self.segments.len() - 1]
    }

    /// Append a child segment.
    pub fn child(&self, name: &str) -> Result<Self> {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self::from_segments(segments)
    }

    /// Check if this path starts with a given prefix.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        if prefix.segments.len() > self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(prefix.segments.iter())
            .all(|(a, b)| a == b)
    }
}

impl std::fmt::Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for TreePath {
    type Err = PrefsError;

    fn from_str(s: &str) -> Result<Self> {
        TreePath::parse(s)
    }
}

/// A segment in a key pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    /// Exact literal match for this segment
    Literal(String),
    /// Single wildcard (*) - matches exactly one segment when mid-key,
    /// or any suffix when at the end
    Wildcard,
}

/// A watch pattern over colon-separated broadcast keys.
///
/// Supported patterns:
/// - Exact: "Prefs:commit:/var/db/prefs.json"
/// - Suffix wildcard: "Prefs:commit:*"
/// - Mid-key wildcard: "Prefs:*:/var/db/prefs.json"
/// - Full wildcard: "*"
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    /// True if the pattern ends with a wildcard (matches any suffix)
    trailing_wildcard: bool,
}

impl KeyPattern {
    /// Create a new key pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(PrefsError::BadArgument("empty key pattern".to_string()));
        }

        let parts: Vec<&str> = pattern.split(':').collect();
        let trailing_wildcard = parts.last() == Some(&"*");

        let segments = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw: pattern.to_string(),
            segments,
            trailing_wildcard,
        })
    }

    /// Check if a key matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        let key_parts: Vec<&str> = key.split(':').collect();

        if self.segments.len() == 1 && self.segments[0] == PatternSegment::Wildcard {
            return true;
        }

        if self.trailing_wildcard {
            if key_parts.len() < self.segments.len() {
                return false;
            }
        } else if key_parts.len() != self.segments.len() {
            return false;
        }

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(lit) => {
                    if key_parts[i] != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    if self.trailing_wildcard && i == self.segments.len() - 1 {
                        return true;
                    }
                    if key_parts[i].is_empty() {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
