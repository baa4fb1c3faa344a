//! Hierarchical datastore keys.

use std::fmt;

/// A hierarchical datastore key such as `/db/people/01HV...`.
///
/// Keys are normalised on construction: they always start with `/`, never
/// end with `/` (except the root key), and contain no empty segments.
/// Ordering is plain lexicographic ordering of the normalised string, which
/// is the iteration order of every [`crate::Datastore`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Creates a key from a path, normalising separators.
    #[must_use]
    pub fn new(path: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        Self(format!("/{}", segments.join("/")))
    }

    /// Returns the root key `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Returns true if this is the root key.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a child key with `name` appended.
    #[must_use]
    pub fn child(&self, name: impl AsRef<str>) -> Self {
        Self::new(format!("{}/{}", self.0, name.as_ref()))
    }

    /// Returns the last segment of the key (empty for the root).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Returns the parent key, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Returns the segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Returns true if `other` lies strictly below this key.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Strips `prefix` from this key, returning the remainder as a key.
    ///
    /// Returns `None` if `prefix` is not an ancestor of (or equal to) this key.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Key) -> Option<Self> {
        if prefix == self {
            return Some(Self::root());
        }
        if prefix.is_ancestor_of(self) {
            if prefix.is_root() {
                return Some(self.clone());
            }
            return Some(Self(self.0[prefix.0.len()..].to_string()));
        }
        None
    }

    /// Returns true if this key is equal to or below `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &Key) -> bool {
        prefix == self || prefix.is_ancestor_of(self)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for Key {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}
