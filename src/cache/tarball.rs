//! Shared gzip+tar packaging used by the directory (compressed mode) and
//! HTTP backends (§6: "Directory cache compressed entry").

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType};

/// 2000-01-01T00:00:00Z, the normalised mtime every packaged entry carries
/// so two builds with byte-identical outputs produce byte-identical
/// tarballs (§6).
const NORMALISED_MTIME: u64 = 946_684_800;

/// Packs `files` (relative to `base_dir`) into a gzip+tar stream written to
/// `out`. Regular files, directories, and symlinks are supported; entry
/// metadata is normalised per §6.
pub fn pack(out: impl Write, base_dir: &Path, files: &[std::path::PathBuf]) -> io::Result<()> {
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = Builder::new(encoder);
    for rel in files {
        append_recursive(&mut builder, base_dir, rel)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn append_recursive(
    builder: &mut Builder<GzEncoder<impl Write>>,
    base_dir: &Path,
    rel: &Path,
) -> io::Result<()> {
    let abs = base_dir.join(rel);
    let meta = std::fs::symlink_metadata(&abs)?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(&abs)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mtime(NORMALISED_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, rel, &target)?;
        return Ok(());
    }

    if meta.is_dir() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mtime(NORMALISED_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o775);
        builder.append_data(&mut header, rel, io::empty())?;
        for entry in std::fs::read_dir(&abs)? {
            let entry = entry?;
            append_recursive(builder, base_dir, &rel.join(entry.file_name()))?;
        }
        return Ok(());
    }

    let mut file = File::open(&abs)?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(meta.len());
    header.set_mtime(NORMALISED_MTIME);
    header.set_uid(0);
    header.set_gid(0);
    // §6: "file mode bits include user+group write to maximise
    // determinism", regardless of the source file's own permissions.
    header.set_mode(0o664);
    builder.append_data(&mut header, rel, &mut file)?;
    Ok(())
}

/// Unpacks a gzip+tar stream produced by [`pack`] into `dest_dir`. Absolute
/// symlink targets are rejected (§8: "absolute symlinks in cached tarballs
/// are rejected on extraction").
pub fn unpack(input: impl Read, dest_dir: &Path) -> io::Result<()> {
    let decoder = GzDecoder::new(input);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.to_path_buf();
        let dest = dest_dir.join(&rel);

        match entry.header().entry_type() {
            EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "symlink with no target"))?;
                if link.is_absolute() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("refusing to extract absolute symlink target: {}", link.display()),
                    ));
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                please_util::remove_existing(&dest).ok();
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link, &dest)?;
                #[cfg(not(unix))]
                std::fs::write(&dest, link.to_string_lossy().as_bytes())?;
            }
            EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
            }
            _ => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                please_util::remove_existing(&dest).ok();
                entry.unpack(&dest)?;
            }
        }
    }
    Ok(())
}
