//! Workspace containment
//!
//! Every path a tool touches is resolved through the [`Workspace`] guard so
//! that model-supplied paths can never reach outside the repository root,
//! whether through `..` traversal, absolute paths, or symlinks that point
//! elsewhere on disk.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// A canonicalized repository root plus the containment checks around it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a guard for `root`. The root must exist; it is canonicalized
    /// once so later comparisons are against a stable form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref())
            .with_context(|| format!("workspace root {} not found", root.as_ref().display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user-supplied relative path to an absolute path inside the
    /// root, or `None` when the input cannot be contained. Non-existent tail
    /// segments are fine; writes to new files must work.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        if relative.trim().is_empty() {
            return None;
        }
        if is_absolute_like(relative) {
            return None;
        }

        // Lexical normalization: `.` drops out, `..` pops. Popping past the
        // root is an escape attempt, not a path.
        let mut stack: Vec<OsString> = Vec::new();
        for component in Path::new(relative).components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if stack.pop().is_none() {
                        return None;
                    }
                }
                Component::Normal(part) => stack.push(part.to_os_string()),
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if stack.is_empty() {
            return None;
        }

        let mut candidate = self.root.clone();
        for part in stack {
            candidate.push(part);
        }

        if self.is_safe(&candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Whether an absolute path is contained in the root. Any I/O failure
    /// while checking collapses to unsafe.
    pub fn is_safe(&self, absolute: &Path) -> bool {
        self.check_contained(absolute).unwrap_or(false)
    }

    fn check_contained(&self, absolute: &Path) -> io::Result<bool> {
        if !starts_with_root(absolute, &self.root) {
            return Ok(false);
        }
        let rel = match absolute.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) => return Ok(false),
        };

        // Walk the existing segments under the root. A symlink anywhere along
        // the way must land back inside the root once fully resolved.
        let mut current = self.root.clone();
        for component in rel.components() {
            current.push(component);
            let meta = match fs::symlink_metadata(&current) {
                Ok(meta) => meta,
                // The rest of the path does not exist yet; nothing left to
                // escape through.
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(err) => return Err(err),
            };
            if meta.file_type().is_symlink() {
                let target = fs::canonicalize(&current)?;
                if !starts_with_root(&target, &self.root) {
                    return Ok(false);
                }
                current = target;
            }
        }
        Ok(true)
    }
}

/// Absolute inputs are refused outright: POSIX roots, UNC prefixes, and
/// drive-letter forms like `C:\` or `C:/` regardless of host platform.
fn is_absolute_like(path: &str) -> bool {
    if Path::new(path).is_absolute() {
        return true;
    }
    if path.starts_with('/') || path.starts_with("\\\\") {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

#[cfg(not(windows))]
fn starts_with_root(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

#[cfg(windows)]
fn starts_with_root(path: &Path, root: &Path) -> bool {
    // Windows filesystems are case-insensitive; compare folded strings but
    // keep the separator boundary that Path::starts_with would give us.
    let path = path.to_string_lossy().to_lowercase();
    let root = root.to_string_lossy().to_lowercase();
    if path == root {
        return true;
    }
    path.strip_prefix(&root)
        .map(|rest| rest.starts_with('\\') || rest.starts_with('/'))
        .unwrap_or(false)
}
