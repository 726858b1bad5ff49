//! Filesystem helpers used by the cache backends and the build action.
//!
//! These are small, focused wrappers rather than a general-purpose
//! filesystem abstraction: each function exists because some cache backend
//! or another needed exactly this behaviour more than once.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::Builder as TempBuilder;

/// Errors surfaced by the filesystem helpers. Kept narrow and specific so
/// callers (cache backends in particular) can decide for themselves
/// whether a given failure should degrade to a cache miss or propagate.
#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("path `{0}` escapes its base directory")]
    Escapes(PathBuf),
    #[error("io error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, PathError>;

fn io_err(path: &Path, source: io::Error) -> PathError {
    PathError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Checks that `candidate`, once lexically normalised, stays within `base`.
///
/// This is the guard behind the build target invariant that declared
/// output paths are relative and never escape the target's out-directory:
/// it rejects `../` components that would walk out of `base` without
/// touching the filesystem (the path need not exist yet).
pub fn ensure_within(base: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.is_absolute() {
        return Err(PathError::Escapes(candidate.to_path_buf()));
    }
    let mut depth: i64 = 0;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(PathError::Escapes(candidate.to_path_buf()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Escapes(candidate.to_path_buf()));
            }
        }
    }
    Ok(base.join(candidate))
}

/// Removes `path` if it exists, tolerating the case where it's already
/// gone. Handles both files (including read-only ones, as produced by some
/// HTTP cache extractions) and directories.
pub fn remove_existing(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|e| io_err(path, e))
    } else {
        // A previously-cached output may have been written read-only (binaries
        // get 0555, non-binaries 0444); clear that before unlinking so
        // replacement never fails on permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = meta.permissions();
            if perms.mode() & 0o200 == 0 {
                perms.set_mode(perms.mode() | 0o200);
                let _ = fs::set_permissions(path, perms);
            }
        }
        fs::remove_file(path).map_err(|e| io_err(path, e))
    }
}

/// Materialises `src` at `dst`, preferring a hardlink (cheap, and what the
/// uncompressed directory cache wants so a build and its cache entry share
/// inode storage) and falling back to a copy when the hardlink can't be
/// made (e.g. `src` and `dst` live on different filesystems).
///
/// If `dst` already happens to be the same file as `src` (same device and
/// inode), this is a no-op rather than an unlink-then-relink: `dst` may be
/// a target's own running binary, and dropping it out from under a reader
/// even briefly risks ETXTBSY or a torn read.
pub fn hardlink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    if same_file::is_same_file(src, dst).unwrap_or(false) {
        return Ok(());
    }
    remove_existing(dst)?;
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(src, dst).map(|_| ()).map_err(|e| io_err(dst, e)),
    }
}

/// Writes `contents` to a temporary sibling of `dst` and atomically renames
/// it into place, so concurrent readers of `dst` only ever observe "absent"
/// or "fully written" — never a partial file. Used by the directory cache's
/// store protocol (§4.8: write pending, then rename).
pub fn write_atomic(dst: &Path, contents: &[u8]) -> Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let mut tmp = TempBuilder::new()
        .prefix(".pending-")
        .tempfile_in(parent)
        .map_err(|e| io_err(parent, e))?;
    use std::io::Write;
    tmp.write_all(contents).map_err(|e| io_err(dst, e))?;
    tmp.flush().map_err(|e| io_err(dst, e))?;
    tmp.persist(dst)
        .map_err(|e| io_err(dst, e.error))?;
    Ok(())
}

/// Sets the file mode expected of a cache-materialised output: binaries get
/// 0555 (read+execute, no write), everything else gets 0444 (read-only).
/// A no-op outside unix, where file modes don't carry this meaning.
pub fn set_cache_output_mode(path: &Path, is_binary: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if is_binary { 0o555 } else { 0o444 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, is_binary);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_paths() {
        let base = Path::new("/tmp/base");
        assert!(ensure_within(base, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn rejects_parent_escape() {
        let base = Path::new("/tmp/base");
        assert!(ensure_within(base, Path::new("../../etc/passwd")).is_err());
    }

    #[test]
    fn allows_descendant_after_reentering() {
        let base = Path::new("/tmp/base");
        // net depth never goes negative, so this stays inside `base`.
        assert!(ensure_within(base, Path::new("a/../b")).is_ok());
    }

    #[test]
    fn joins_simple_relative_paths() {
        let base = Path::new("/tmp/base");
        let joined = ensure_within(base, Path::new("out/bin.out")).unwrap();
        assert_eq!(joined, Path::new("/tmp/base/out/bin.out"));
    }

    #[test]
    fn write_atomic_then_hardlink_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("entry");
        write_atomic(&dst, b"hello").unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"hello");

        let linked = dir.path().join("linked");
        hardlink_or_copy(&dst, &linked).unwrap();
        assert_eq!(fs::read(&linked).unwrap(), b"hello");
    }

    #[test]
    fn remove_existing_tolerates_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(remove_existing(&missing).is_ok());
    }
}
