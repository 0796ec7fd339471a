use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{FsError, FsResult};

/// A canonical, forward-slash-delimited path relative to the repository
/// root. The empty string is the root itself. Paths are value types; all
/// mutating operations return a new path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FsPath {
    inner: String,
}

impl FsPath {
    /// The repository root.
    pub fn root() -> Self {
        Self {
            inner: String::new(),
        }
    }

    /// Validates and canonicalizes `raw`. Rejects absolute prefixes, empty
    /// segments, `.`/`..` segments, backslashes and NUL.
    pub fn new(raw: &str) -> FsResult<Self> {
        if raw.is_empty() {
            return Ok(Self::root());
        }
        if raw.starts_with('/') {
            return Err(FsError::Invalid(format!("absolute path: {}", raw)));
        }
        if raw.ends_with('/') {
            return Err(FsError::Invalid(format!("trailing slash: {}", raw)));
        }
        if raw.contains('\\') || raw.contains('\0') {
            return Err(FsError::Invalid(format!("forbidden character in {:?}", raw)));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(FsError::Invalid(format!("empty segment in {}", raw)));
            }
            if segment == "." || segment == ".." {
                return Err(FsError::Invalid(format!("relative segment in {}", raw)));
            }
        }
        Ok(Self {
            inner: raw.to_string(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Appends `name` (which may itself contain multiple segments).
    pub fn join(&self, name: &str) -> FsResult<Self> {
        let suffix = Self::new(name)?;
        if suffix.is_root() {
            return Err(FsError::Invalid("joining empty name".to_string()));
        }
        if self.is_root() {
            return Ok(suffix);
        }
        Ok(Self {
            inner: format!("{}/{}", self.inner, suffix.inner),
        })
    }

    /// The parent directory. The parent of a top-level entry (and of the
    /// root itself) is the root.
    pub fn dir(&self) -> Self {
        match self.inner.rfind('/') {
            Some(i) => Self {
                inner: self.inner[..i].to_string(),
            },
            None => Self::root(),
        }
    }

    /// The final segment, empty for the root.
    pub fn name(&self) -> &str {
        match self.inner.rfind('/') {
            Some(i) => &self.inner[i + 1..],
            None => &self.inner,
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|s| !s.is_empty())
    }

    /// Maps this path under the on-disk repository root.
    pub fn to_sys_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.segments() {
            out.push(segment);
        }
        out
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.inner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert!(FsPath::new("").unwrap().is_root());
        let p = FsPath::new("a/b/c.rfile").unwrap();
        assert_eq!(p.name(), "c.rfile");
        assert_eq!(p.dir().as_str(), "a/b");
        assert_eq!(p.dir().dir().as_str(), "a");
        assert!(p.dir().dir().dir().is_root());
    }

    #[test]
    fn test_invalid_paths() {
        for raw in ["/abs", "a//b", "a/../b", "./a", "a/", "a\\b", "a\0b"] {
            assert!(FsPath::new(raw).is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_join() {
        let root = FsPath::root();
        let a = root.join("a").unwrap();
        let ab = a.join("b").unwrap();
        assert_eq!(ab.as_str(), "a/b");
        assert!(a.join("").is_err());
        assert!(a.join("../x").is_err());
    }

    #[test]
    fn test_sys_path_mapping() {
        let p = FsPath::new("a/b").unwrap();
        let sys = p.to_sys_path(Path::new("/var/renter"));
        assert_eq!(sys, PathBuf::from("/var/renter/a/b"));
        assert_eq!(FsPath::root().to_sys_path(Path::new("/var/renter")), PathBuf::from("/var/renter"));
    }
}
