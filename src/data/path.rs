use std::{
    fmt,
    path::{Component, Path, PathBuf},
};
use super::DataError;

// Name of the hidden subtree holding in-progress files.
pub(crate) const HIDDEN_COMPONENT: &str = ".sruth";

/// A forward-slash separated relative path naming a file in an archive.
///
/// Canonical form has no leading slash and no "." or ".." components.
/// Paths order lexicographically by component sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchivePath(Vec<String>);

impl ArchivePath {
    pub fn parse(s: &str) -> Result<Self, DataError> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Err(DataError::InvalidPath(s.to_string()));
        }
        let mut components = Vec::new();
        for component in trimmed.split('/') {
            match component {
                "" | "." | ".." => return Err(DataError::InvalidPath(s.to_string())),
                c => components.push(c.to_string()),
            }
        }
        Ok(ArchivePath(components))
    }

    pub fn from_components(components: Vec<String>) -> Result<Self, DataError> {
        if components.is_empty()
            || components
                .iter()
                .any(|c| c.is_empty() || c == "." || c == ".." || c.contains('/'))
        {
            return Err(DataError::InvalidPath(components.join("/")));
        }
        Ok(ArchivePath(components))
    }

    // Converts a relative filesystem path, e.g. one produced by a
    // directory walk, into an archive path.
    pub fn from_rel_path(path: &Path) -> Result<Self, DataError> {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(c) => match c.to_str() {
                    Some(c) => components.push(c.to_string()),
                    None => return Err(DataError::InvalidPath(path.display().to_string())),
                },
                _ => return Err(DataError::InvalidPath(path.display().to_string())),
            }
        }
        Self::from_components(components)
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    // Relative filesystem path below an archive root.
    pub fn to_rel_path(&self) -> PathBuf {
        self.0.iter().collect()
    }

    /// Prefixes the hidden component, mapping a visible path to its
    /// in-progress sibling.
    pub fn hide(&self) -> ArchivePath {
        let mut components = Vec::with_capacity(self.0.len() + 1);
        components.push(HIDDEN_COMPONENT.to_string());
        components.extend(self.0.iter().cloned());
        ArchivePath(components)
    }

    /// Strips the hidden component. Returns the path unchanged if it is
    /// not hidden.
    pub fn reveal(&self) -> ArchivePath {
        if self.is_hidden() && self.0.len() > 1 {
            ArchivePath(self.0[1..].to_vec())
        } else {
            self.clone()
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.0.first().map(String::as_str) == Some(HIDDEN_COMPONENT)
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl std::str::FromStr for ArchivePath {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
