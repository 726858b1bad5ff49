//! The directory cache backend (§4.8): a content-addressed tree under a
//! configured root, with optional background eviction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use please_util::Digest256;
use rustc_hash::FxHashSet;

use crate::cache::{tarball, ArtifactMetadata, Cache, RetrieveOutcome, RetrieveRequest, StoreRequest};
use crate::label::Label;

/// Grace window inside which an entry's atime is never trusted for
/// eviction ordering, to avoid an eviction sweep oscillating with the
/// builds that keep re-touching the same hot entries (§4.8).
const EVICTION_GRACE: Duration = Duration::from_secs(10 * 60);

/// Sentinel dropped into each `<package-path>/<target-name>` directory the
/// first time a key is stored under it. Marks that directory as the parent
/// of cache keys rather than more package-path scaffolding, so the eviction
/// walk (whose depth varies with how many segments the package path has)
/// knows where to stop descending without guessing a fixed depth.
const NAME_MARKER: &str = ".please-cache-entries";

/// `<root>/<package-path>/<target-name>/<base64url(fingerprint)>[.marker]`
fn key_path(root: &Path, label: &Label, key: &Digest256, compress: bool) -> PathBuf {
    let pkg = label.package_key().trim_start_matches("//").replace("//", "/");
    let mut p = root.join(pkg).join(label.name()).join(key.to_base64url());
    if compress {
        p.set_extension("tar.gz");
    }
    p
}

pub struct DirectoryCache {
    root: PathBuf,
    compress: bool,
    high_water_mark: Option<u64>,
    low_water_mark: Option<u64>,
    /// Entries written during this process's lifetime; never evicted while
    /// the process that wrote them is still running a build (§8: "Eviction
    /// safety").
    marked: Mutex<FxHashSet<PathBuf>>,
}

impl DirectoryCache {
    pub fn new(
        root: PathBuf,
        compress: bool,
        high_water_mark: Option<u64>,
        low_water_mark: Option<u64>,
    ) -> DirectoryCache {
        DirectoryCache {
            root,
            compress,
            high_water_mark,
            low_water_mark,
            marked: Mutex::new(FxHashSet::default()),
        }
    }

    fn mark(&self, path: &Path) {
        self.marked.lock().unwrap().insert(path.to_path_buf());
    }

    /// Walks the root, evicting atime-oldest entries (ties broken by size,
    /// descending) until the tree is under `low_water_mark`, if the tree
    /// currently exceeds `high_water_mark`. A no-op if either watermark is
    /// unconfigured.
    pub fn run_eviction_sweep(&self) -> std::io::Result<()> {
        let (Some(high), Some(low)) = (self.high_water_mark, self.low_water_mark) else {
            return Ok(());
        };

        let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total: u64 = 0;

        // Package paths contribute a variable number of directory segments
        // (root package: none; `//a:x`: one; `//a/b:x`: two; ...), so a
        // fixed depth can't tell a cache key apart from the scaffolding
        // above it. Instead, stop descending the moment we reach a
        // directory carrying `NAME_MARKER`: everything directly inside it
        // is one atomic, evictable key, whether that key is itself a file
        // (compressed mode) or a directory (uncompressed mode, where it may
        // contain nested output subdirectories that must move as a unit).
        let mut walker = walkdir::WalkDir::new(&self.root).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                continue;
            }
            if !entry.path().join(NAME_MARKER).exists() {
                continue;
            }
            walker.skip_current_dir();

            for child in fs::read_dir(entry.path())? {
                let child = child?;
                if child.file_name() == NAME_MARKER {
                    continue;
                }
                let path = child.path();
                let meta = child.metadata()?;
                let size = if meta.is_dir() { dir_size(&path)? } else { meta.len() };
                let atime = filetime::FileTime::from_last_access_time(&meta);
                let atime = SystemTime::UNIX_EPOCH + Duration::new(atime.seconds().max(0) as u64, 0);
                total += size;
                entries.push((path, size, atime));
            }
        }

        if total < high {
            return Ok(());
        }

        let now = SystemTime::now();
        let marked = self.marked.lock().unwrap().clone();
        entries.retain(|(p, _, _)| !marked.contains(p));
        entries.sort_by(|a, b| {
            let a_recent = now.duration_since(a.2).unwrap_or_default() < EVICTION_GRACE;
            let b_recent = now.duration_since(b.2).unwrap_or_default() < EVICTION_GRACE;
            match (a_recent, b_recent) {
                (true, true) | (false, false) => a.2.cmp(&b.2).then(b.1.cmp(&a.1)),
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
            }
        });

        for (path, size, _) in entries {
            if total <= low {
                break;
            }
            let pending = sibling_pending_path(&path);
            if fs::rename(&path, &pending).is_ok() {
                let _ = please_util::remove_existing(&pending);
            } else {
                let _ = please_util::remove_existing(&path);
            }
            total = total.saturating_sub(size);
        }
        Ok(())
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn sibling_pending_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".evicting~");
    path.with_file_name(name)
}

impl Cache for DirectoryCache {
    fn store(&self, req: StoreRequest<'_>) {
        let path = key_path(&self.root, req.label, req.key, self.compress);
        let pending = sibling_pending_path(&path);
        let _ = please_util::remove_existing(&path);

        let result = if self.compress {
            store_compressed(&pending, req.out_dir, req.files, req.metadata.as_ref())
        } else {
            store_uncompressed(&pending, req.out_dir, req.files, req.metadata.as_ref())
        };

        match result {
            Ok(()) => {
                if let Err(e) = fs::rename(&pending, &path) {
                    let err = crate::error::CacheError::Io(e);
                    tracing::warn!(target = %req.label, error = %err, "directory cache store rename failed");
                    let _ = please_util::remove_existing(&pending);
                } else {
                    self.mark(&path);
                    if let Some(name_dir) = path.parent() {
                        let marker = name_dir.join(NAME_MARKER);
                        if !marker.exists() {
                            let _ = fs::write(&marker, []);
                        }
                    }
                }
            }
            Err(e) => {
                let err = crate::error::CacheError::Io(e);
                tracing::warn!(target = %req.label, error = %err, "directory cache store failed");
                let _ = please_util::remove_existing(&pending);
            }
        }
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        let path = key_path(&self.root, req.label, req.key, self.compress);
        if !path.exists() {
            return RetrieveOutcome::Miss;
        }

        for f in req.files {
            let dest = req.out_dir.join(f);
            let _ = please_util::remove_existing(&dest);
        }

        let result = if self.compress {
            retrieve_compressed(&path, req.out_dir)
        } else {
            retrieve_uncompressed(&path, req.out_dir, req.files)
        };

        match result {
            Ok(metadata) => {
                for f in req.files {
                    let _ = please_util::set_cache_output_mode(&req.out_dir.join(f), req.is_binary);
                }
                RetrieveOutcome::Hit(metadata)
            }
            Err(e) => {
                let err = crate::error::CacheError::Io(e);
                tracing::warn!(target = %req.label, error = %err, "directory cache retrieve failed, treating as miss");
                RetrieveOutcome::Miss
            }
        }
    }

    fn clean(&self, label: &Label) {
        let pkg = label.package_key().trim_start_matches("//").replace("//", "/");
        let dir = self.root.join(pkg).join(label.name());
        let _ = please_util::remove_existing(&dir);
    }

    fn clean_all(&self) {
        let _ = please_util::remove_existing(&self.root);
    }

    fn shutdown(&self) {}
}

const METADATA_FILE: &str = ".please-metadata";

fn store_uncompressed(
    dest: &Path,
    out_dir: &Path,
    files: &[PathBuf],
    metadata: Option<&ArtifactMetadata>,
) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for f in files {
        please_util::hardlink_or_copy(&out_dir.join(f), &dest.join(f))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    if let Some(m) = metadata {
        fs::write(dest.join(METADATA_FILE), &m.0)?;
    }
    Ok(())
}

fn retrieve_uncompressed(
    src: &Path,
    out_dir: &Path,
    files: &[PathBuf],
) -> std::io::Result<Option<ArtifactMetadata>> {
    for f in files {
        please_util::hardlink_or_copy(&src.join(f), &out_dir.join(f))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    match fs::read(src.join(METADATA_FILE)) {
        Ok(bytes) => Ok(Some(ArtifactMetadata(bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn store_compressed(
    dest: &Path,
    out_dir: &Path,
    files: &[PathBuf],
    metadata: Option<&ArtifactMetadata>,
) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::new();
    tarball::pack(&mut buf, out_dir, files)?;
    if let Some(m) = metadata {
        // Metadata rides alongside the tarball as a length-prefixed
        // preamble so a single file stays the unit of atomic rename.
        let mut framed = Vec::with_capacity(m.0.len() + buf.len() + 8);
        framed.extend_from_slice(&(m.0.len() as u64).to_le_bytes());
        framed.extend_from_slice(&m.0);
        framed.extend_from_slice(&buf);
        please_util::write_atomic(dest, &framed)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    } else {
        let mut framed = Vec::with_capacity(buf.len() + 8);
        framed.extend_from_slice(&0u64.to_le_bytes());
        framed.extend_from_slice(&buf);
        please_util::write_atomic(dest, &framed)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok(())
}

fn retrieve_compressed(src: &Path, out_dir: &Path) -> std::io::Result<Option<ArtifactMetadata>> {
    let framed = fs::read(src)?;
    if framed.len() < 8 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated cache entry"));
    }
    let meta_len = u64::from_le_bytes(framed[0..8].try_into().unwrap()) as usize;
    if framed.len() < 8 + meta_len {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated cache entry"));
    }
    let metadata = if meta_len > 0 {
        Some(ArtifactMetadata(framed[8..8 + meta_len].to_vec()))
    } else {
        None
    };
    tarball::unpack(&framed[8 + meta_len..], out_dir)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label() -> Label {
        Label::parse("//a/b:x", None).unwrap()
    }

    fn key(seed: &str) -> Digest256 {
        please_util::HashAlgorithm::Sha256.hash_parts([seed.as_bytes()])
    }

    #[test]
    fn uncompressed_store_then_retrieve_roundtrips() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), false, None, None);

        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"artifact").unwrap();

        let l = label();
        let k = key("fp1");
        let files = vec![PathBuf::from("out.bin")];
        cache.store(StoreRequest {
            label: &l,
            key: &k,
            metadata: Some(ArtifactMetadata(b"stdout-blob".to_vec())),
            out_dir: work.path(),
            files: &files,
        });

        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: dest.path(),
            files: &files,
            is_binary: false,
        });
        match outcome {
            RetrieveOutcome::Hit(Some(m)) => assert_eq!(m.0, b"stdout-blob"),
            _ => panic!("expected hit with metadata"),
        }
        assert_eq!(std::fs::read(dest.path().join("out.bin")).unwrap(), b"artifact");
    }

    #[test]
    fn compressed_store_then_retrieve_roundtrips() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), true, None, None);

        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"artifact-2").unwrap();

        let l = label();
        let k = key("fp2");
        let files = vec![PathBuf::from("out.bin")];
        cache.store(StoreRequest {
            label: &l,
            key: &k,
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });

        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: dest.path(),
            files: &files,
            is_binary: true,
        });
        assert!(outcome.is_hit());
        assert_eq!(std::fs::read(dest.path().join("out.bin")).unwrap(), b"artifact-2");
    }

    #[test]
    fn retrieve_miss_for_unknown_key() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), false, None, None);
        let l = label();
        let k = key("nonexistent");
        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: dest.path(),
            files: &[],
            is_binary: false,
        });
        assert!(!outcome.is_hit());
    }

    #[test]
    fn clean_removes_all_keys_for_a_target() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), false, None, None);
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"x").unwrap();
        let l = label();
        let files = vec![PathBuf::from("out.bin")];
        cache.store(StoreRequest {
            label: &l,
            key: &key("k1"),
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });
        cache.clean(&l);
        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &key("k1"),
            out_dir: dest.path(),
            files: &files,
            is_binary: false,
        });
        assert!(!outcome.is_hit());
    }

    #[test]
    fn eviction_sweep_handles_root_package_depth() {
        // pkg is the empty string for a root-package label, so the key
        // lands at `root/<name>/<key>` — depth 2, not the depth a
        // multi-segment package reaches.
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), false, Some(1), Some(0));
        let l = Label::parse("//:x", None).unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"payload").unwrap();
        let files = vec![PathBuf::from("out.bin")];
        let k = key("root-pkg");
        cache.store(StoreRequest {
            label: &l,
            key: &k,
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });

        cache.run_eviction_sweep().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: dest.path(),
            files: &files,
            is_binary: false,
        });
        assert!(!outcome.is_hit(), "sole entry should have been evicted over the watermark");
    }

    #[test]
    fn eviction_sweep_evicts_whole_keys_not_individual_files_for_multi_segment_package() {
        // `label()` here is `//a/b:x`: a two-segment package, which pushes
        // the key directory to depth 4 — the exact case the old hardcoded
        // `depth() < 3` filter mishandled (it would treat `root/a/b/x`, the
        // whole target's scaffolding, as one sweepable unit).
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(root.path().to_path_buf(), false, Some(15), Some(10));
        let l = label();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"0123456789").unwrap();
        let files = vec![PathBuf::from("out.bin")];

        let old_key = key("old");
        let new_key = key("new");
        cache.store(StoreRequest {
            label: &l,
            key: &old_key,
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });
        cache.store(StoreRequest {
            label: &l,
            key: &new_key,
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });

        // Age the first entry well outside the eviction grace window so it
        // sorts ahead of the second for eviction.
        let old_path = key_path(root.path(), &l, &old_key, false);
        let ancient = filetime::FileTime::from_unix_time(0, 0);
        filetime::set_file_atime(old_path.join("out.bin"), ancient).unwrap();
        filetime::set_file_atime(&old_path, ancient).unwrap();

        cache.run_eviction_sweep().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let old_outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &old_key,
            out_dir: dest.path(),
            files: &files,
            is_binary: false,
        });
        assert!(!old_outcome.is_hit(), "older key should have been evicted");

        let dest2 = tempfile::tempdir().unwrap();
        let new_outcome = cache.retrieve(RetrieveRequest {
            label: &l,
            key: &new_key,
            out_dir: dest2.path(),
            files: &files,
            is_binary: false,
        });
        assert!(
            new_outcome.is_hit(),
            "surviving key for the same multi-segment package must remain intact, not swept as a unit with its sibling"
        );
        assert_eq!(std::fs::read(dest2.path().join("out.bin")).unwrap(), b"0123456789");
    }
}
