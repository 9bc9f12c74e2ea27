//! Path value types for the pipeline.
//!
//! `SystemPath` is an absolute path suitable for open/stat/remove calls;
//! `InternalPath` is the same file seen from inside an archive, i.e. relative
//! to the watched root. Keeping the two as distinct types stops archive member
//! names and filesystem paths from being mixed up across the pipeline.

use std::fmt;
use std::path::{Component, Path};

use tracing::warn;

/// An absolute filesystem path, kept verbatim as handed to us by the watcher
/// or the finder. No normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemPath(String);

impl SystemPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Strips the watched-root prefix, yielding the name this file will have
    /// inside an archive. `root` must end with `/`.
    pub fn internal(&self, root: &str) -> InternalPath {
        InternalPath(self.0.strip_prefix(root).unwrap_or(&self.0).to_string())
    }
}

impl From<&Path> for SystemPath {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl fmt::Display for SystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The pathname of a data file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalPath(String);

impl InternalPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The grouping key: the first path segments, up to three levels deep. A
    /// name with no separator at all is not rejected, but it groups under the
    /// empty key.
    pub fn subdir(&self) -> String {
        let segments: Vec<&str> = self.0.split('/').collect();
        if segments.len() <= 1 {
            warn!("file {} is not in a subdirectory", self.0);
            return String::new();
        }
        let depth = (segments.len() - 1).min(3);
        segments[..depth].join("/")
    }

    /// Returns `None` if the file has a normal name, and an explanation of
    /// why the name is strange otherwise. Advisory: strange files are still
    /// archived and uploaded.
    pub fn lint(&self) -> Option<String> {
        let name = self.0.as_str();
        let cleaned = clean(name);
        if cleaned != name {
            return Some(format!(
                "the cleaned up path {cleaned:?} did not match the name of the passed-in file {name:?}"
            ));
        }
        if name.contains("..") {
            return Some(format!("too many dots in {name:?}"));
        }
        let (dir, base) = match name.rfind('/') {
            Some(i) => (&name[..i], &name[i + 1..]),
            None => ("", name),
        };
        if base.starts_with('.') {
            return Some(format!("hidden file detected: {name:?}"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !"/:._-".contains(*c))
        {
            return Some(format!("strange character {c:?} in the filename {name:?}"));
        }
        if !has_dated_prefix(dir) {
            return Some(format!(
                "directory structure does not follow <token>/YYYY/MM/DD for file {name:?}"
            ));
        }
        None
    }
}

impl fmt::Display for InternalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexical normalization used by the lint equality check: drops `.` segments,
/// duplicate separators, and any trailing separator. `..` segments are kept
/// verbatim; they are caught by their own lint rule.
fn clean(name: &str) -> String {
    let mut segments = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => segments.push(".."),
            Component::Normal(seg) => segments.push(seg.to_str().unwrap_or("")),
            Component::RootDir | Component::Prefix(_) => return name.to_string(),
        }
    }
    segments.join("/")
}

/// True when the directory portion starts with `<token>/20YY/MM/DD`.
fn has_dated_prefix(dir: &str) -> bool {
    let mut segments = dir.split('/');
    let token = match segments.next() {
        Some(t) => t,
        None => return false,
    };
    if token.is_empty()
        || !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return false;
    }
    let year = segments.next().unwrap_or("");
    if year.len() != 4 || !year.starts_with("20") || !year.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    for _ in 0..2 {
        let part = segments.next().unwrap_or("");
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    true
}
