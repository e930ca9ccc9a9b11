//! Virtual paths
//!
//! Every name in the HOLOFS namespace is a [`VirtualPath`]: absolute,
//! `/`-separated, with no empty, `.` or `..` segments. A trailing slash is
//! accepted on input and dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(StorageError::invalid_path(raw, "must be absolute"));
        }
        if raw.contains('\0') {
            return Err(StorageError::invalid_path(raw, "contains NUL"));
        }

        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        for segment in trimmed[1..].split('/') {
            match segment {
                "" => return Err(StorageError::invalid_path(raw, "empty segment")),
                "." | ".." => {
                    return Err(StorageError::invalid_path(raw, "relative segment"))
                }
                _ => {}
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Append a relative `a/b/c` path
    pub fn join(&self, relative: &str) -> Result<Self> {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.clone());
        }
        if self.is_root() {
            Self::parse(&format!("/{}", relative))
        } else {
            Self::parse(&format!("{}/{}", self.0, relative))
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Component-wise prefix test (`/a/bc` does not start with `/a/b`)
    pub fn starts_with(&self, base: &VirtualPath) -> bool {
        self.strip_prefix(base).is_some()
    }

    /// Remainder of `self` below `base`, `""` when equal
    pub fn strip_prefix(&self, base: &VirtualPath) -> Option<&str> {
        if base.is_root() {
            return Some(&self.0[1..]);
        }
        let rest = self.0.strip_prefix(base.as_str())?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }

    /// The entry directly below `dir` on the way to `self`, and whether that
    /// entry is an intermediate directory rather than `self` itself.
    pub fn child_of(&self, dir: &VirtualPath) -> Option<(VirtualPath, bool)> {
        let rest = self.strip_prefix(dir)?;
        if rest.is_empty() {
            return None;
        }
        match rest.split_once('/') {
            Some((first, _)) => dir.join(first).ok().map(|p| (p, true)),
            None => Some((self.clone(), false)),
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VirtualPath> for String {
    fn from(path: VirtualPath) -> Self {
        path.0
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
