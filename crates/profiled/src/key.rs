//! Canonical identity of a profile accumulation bucket.

use std::fmt;

use serde::Serialize;

/// Identifies the bucket a set of observations accumulates into.
///
/// Tags are kept sorted by name with at most one value per name, so two keys built
/// from the same tags in any order compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowKey {
    org_id: String,
    dataset_id: String,
    tags: Vec<(String, String)>,
}

impl WindowKey {
    /// Creates a key with no segment tags.
    pub fn new(org_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            dataset_id: dataset_id.into(),
            tags: Vec::new(),
        }
    }

    /// Starts building a key with segment tags.
    pub fn builder(org_id: impl Into<String>, dataset_id: impl Into<String>) -> WindowKeyBuilder {
        WindowKeyBuilder {
            key: Self::new(org_id, dataset_id),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Segment tags, sorted by name.
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Looks up a tag value by its full (prefixed) name.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| self.tags[i].1.as_str())
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org_id, self.dataset_id)?;
        if !self.tags.is_empty() {
            f.write_str("[")?;
            for (i, (name, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{name}={value}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// Builder that canonicalises tags as they are added.
#[derive(Debug, Clone)]
pub struct WindowKeyBuilder {
    key: WindowKey,
}

impl WindowKeyBuilder {
    /// Adds a tag. A name that is already present keeps its first value.
    #[must_use]
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if let Err(pos) = self.key.tags.binary_search_by(|(n, _)| n.cmp(&name)) {
            self.key.tags.insert(pos, (name, value.into()));
        }
        self
    }

    pub fn build(self) -> WindowKey {
        self.key
    }
}
