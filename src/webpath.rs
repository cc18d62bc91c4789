//! Canonicalized lock paths and the hierarchical comparator (spec.md §4.A).
//!
//! A virtual base URL `http://localhost/` is conceptually prepended to every
//! path so that two `LockPath`s always compare as absolute URLs; we never
//! materialize that URL, since only path-segment comparison is needed.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode, percent_encode};

const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// A canonicalized absolute path used as a lock scope.
///
/// Invariant: always starts with `/`; ends with `/` iff the target is known
/// to be a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockPath {
    segments: Vec<String>,
    collection: bool,
}

#[derive(Debug)]
pub enum PathParseError {
    InvalidPath,
    ForbiddenPath,
}

impl std::fmt::Display for PathParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for PathParseError {}

impl LockPath {
    /// Parse and normalize a raw path: merges consecutive slashes, resolves
    /// `.`/`..`, percent-decodes segments, and records whether the path was
    /// collection-shaped (trailing `/`).
    pub fn parse(raw: &str) -> Result<LockPath, PathParseError> {
        if !raw.starts_with('/') {
            return Err(PathParseError::InvalidPath);
        }
        let is_collection = raw.ends_with('/') || raw == "/";
        let mut segments: Vec<String> = Vec::new();
        for seg in raw.split('/') {
            match seg {
                "" | "." => {},
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathParseError::ForbiddenPath);
                    }
                },
                s => {
                    let decoded = percent_decode(s.as_bytes())
                        .decode_utf8()
                        .map_err(|_| PathParseError::InvalidPath)?
                        .into_owned();
                    if decoded.contains('\0') {
                        return Err(PathParseError::InvalidPath);
                    }
                    segments.push(decoded);
                },
            }
        }
        Ok(LockPath { segments, collection: is_collection })
    }

    /// A non-recursive, single-segment child of this path (used by tests and
    /// by callers building scoped requests without going through `parse`).
    pub fn child(&self, name: &str, collection: bool) -> LockPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        LockPath { segments, collection }
    }

    pub fn is_collection(&self) -> bool {
        self.collection
    }

    /// Render as a URL-encoded absolute path, e.g. `/a/b%20c/`.
    pub fn as_str(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut s = String::new();
        for seg in &self.segments {
            s.push('/');
            s.push_str(&percent_encode(seg.as_bytes(), PATH_ENCODE_SET).to_string());
        }
        if self.collection {
            s.push('/');
        }
        s
    }

    fn is_strict_prefix_of(&self, other: &LockPath) -> bool {
        self.segments.len() < other.segments.len() && self.segments == other.segments[..self.segments.len()]
    }
}

/// Outcome of comparing two scoped paths (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRelation {
    /// The two paths are byte-equal after normalization.
    Reference,
    /// `left` is a recursive ancestor of `right`.
    LeftIsParent,
    /// `right` is a recursive ancestor of `left`.
    RightIsParent,
    /// Neither relation holds.
    NoMatch,
}

/// Compare two scoped URLs per spec.md §4.A.
pub fn compare(left: &LockPath, left_recursive: bool, right: &LockPath, right_recursive: bool) -> PathRelation {
    if left == right {
        PathRelation::Reference
    } else if left_recursive && left.is_strict_prefix_of(right) {
        PathRelation::LeftIsParent
    } else if right_recursive && right.is_strict_prefix_of(left) {
        PathRelation::RightIsParent
    } else {
        PathRelation::NoMatch
    }
}
