//! Filesystem utilities.
//!
//! Every write performed while assembling a bundle goes through
//! [`write_if_changed`], so a re-run over an existing output tree leaves
//! identical files untouched.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::util::hash::sha256_file;

/// Outcome of a write that may have been skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The file did not exist or had different contents.
    Written,
    /// The file already had exactly these contents.
    Unchanged,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        self == WriteOutcome::Written
    }
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Read a file to string, with nice error messages.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read file: {}", path.display()))
}

/// Write bytes to a file unless it already holds exactly these bytes.
///
/// The new content is written to a temporary sibling and renamed into place,
/// so an interrupted run never leaves a half-written file behind.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> Result<WriteOutcome> {
    if let Ok(existing) = fs::read(path) {
        if existing == contents {
            tracing::debug!("unchanged: {}", path.display());
            return Ok(WriteOutcome::Unchanged);
        }
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("failed to write file: {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to write file: {}", path.display()))?;

    Ok(WriteOutcome::Written)
}

/// String convenience over [`write_if_changed`].
pub fn write_string(path: &Path, contents: &str) -> Result<WriteOutcome> {
    write_if_changed(path, contents.as_bytes())
}

/// Set unix permission bits; a no-op elsewhere.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let current = fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .permissions()
            .mode()
            & 0o7777;
        if current != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("failed to set mode on {}", path.display()))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Join a bundle-relative path onto a base, rejecting anything that would
/// escape the base directory.
pub fn join_relative(base: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.is_absolute() {
        bail!("path must be relative: {}", relative.display());
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("path escapes its bundle directory: {}", relative.display()),
        }
    }
    Ok(base.join(relative))
}

/// Compute a stable digest of every file below `dir`.
///
/// Files are visited in sorted order and each contributes its relative path
/// and content hash, so two trees with identical contents produce the same
/// digest regardless of modification times.
pub fn tree_digest(dir: &Path) -> Result<String> {
    let mut fp = crate::util::hash::Fingerprint::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        fp.update_str(&rel.to_string_lossy());
        fp.update_str(&sha256_file(entry.path())?);
    }

    Ok(fp.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_if_changed_skips_identical() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/out.txt");

        assert_eq!(
            write_if_changed(&path, b"hello").unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            write_if_changed(&path, b"hello").unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            write_if_changed(&path, b"world").unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_join_relative_rejects_escape() {
        let base = Path::new("/out/bundle");
        assert!(join_relative(base, Path::new("etc/config.yaml")).is_ok());
        assert!(join_relative(base, Path::new("../other")).is_err());
        assert!(join_relative(base, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_tree_digest_is_content_based() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for dir in [a.path(), b.path()] {
            write_string(&dir.join("x/one.txt"), "1").unwrap();
            write_string(&dir.join("two.txt"), "2").unwrap();
        }
        assert_eq!(tree_digest(a.path()).unwrap(), tree_digest(b.path()).unwrap());

        write_string(&b.path().join("two.txt"), "changed").unwrap();
        assert_ne!(tree_digest(a.path()).unwrap(), tree_digest(b.path()).unwrap());
    }
}
