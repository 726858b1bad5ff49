//! The command-driven cache backend (§4.10): a trap door for
//! site-specific caches, driving a user-supplied shell command.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::cache::{tarball, ArtifactMetadata, Cache, RetrieveOutcome, RetrieveRequest, StoreRequest};
use crate::label::Label;

pub struct CommandCache {
    store_command: String,
    retrieve_command: String,
}

impl CommandCache {
    pub fn new(store_command: String, retrieve_command: String) -> CommandCache {
        CommandCache { store_command, retrieve_command }
    }
}

impl Cache for CommandCache {
    fn store(&self, req: StoreRequest<'_>) {
        let mut body = Vec::new();
        if let Err(e) = tarball::pack(&mut body, req.out_dir, req.files) {
            tracing::warn!(target = %req.label, error = %e, "failed to package outputs for command cache store");
            return;
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.store_command)
            .env("CACHE_KEY", req.key.to_hex())
            .stdin(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(target = %req.label, error = %e, "failed to spawn command cache store command");
                return;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // Write on a scoped thread so a command that never reads its
            // stdin (or dies mid-transfer) can't deadlock us on a full pipe
            // buffer (§4.10: "drain pipes safely even when the child dies
            // mid-transfer").
            let _ = std::thread::scope(|scope| {
                scope.spawn(move || {
                    let _ = stdin.write_all(&body);
                });
            });
        }

        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(target = %req.label, status = ?status.code(), "command cache store exited non-zero"),
            Err(e) => tracing::warn!(target = %req.label, error = %e, "command cache store wait failed"),
        }
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.retrieve_command)
            .env("CACHE_KEY", req.key.to_hex())
            .stdin(Stdio::null())
            .output();

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(target = %req.label, error = %e, "failed to spawn command cache retrieve command");
                return RetrieveOutcome::Miss;
            }
        };

        if !output.status.success() {
            return RetrieveOutcome::Miss;
        }

        for f in req.files {
            let _ = please_util::remove_existing(&req.out_dir.join(f));
        }
        if let Err(e) = tarball::unpack(output.stdout.as_slice(), req.out_dir) {
            tracing::warn!(target = %req.label, error = %e, "command cache payload corrupt, treating as miss");
            return RetrieveOutcome::Miss;
        }
        for f in req.files {
            let _ = please_util::set_cache_output_mode(&req.out_dir.join(f), req.is_binary);
        }
        RetrieveOutcome::Hit(None::<ArtifactMetadata>)
    }

    fn clean(&self, _label: &Label) {}
    fn clean_all(&self) {}
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn store_then_retrieve_roundtrips_through_a_shell_pipe() {
        let backing = tempfile::tempdir().unwrap();
        let backing_file = backing.path().join("entry.tar.gz");

        let cache = CommandCache::new(
            format!("cat > {}", backing_file.display()),
            format!("cat {}", backing_file.display()),
        );

        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.txt"), b"payload").unwrap();

        let label = Label::parse("//a:b", None).unwrap();
        let key = please_util::HashAlgorithm::Sha256.hash_parts([b"k".as_slice()]);
        let files = vec![PathBuf::from("out.txt")];

        cache.store(StoreRequest {
            label: &label,
            key: &key,
            metadata: None,
            out_dir: work.path(),
            files: &files,
        });

        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &label,
            key: &key,
            out_dir: dest.path(),
            files: &files,
            is_binary: false,
        });
        assert!(outcome.is_hit());
        assert_eq!(std::fs::read(dest.path().join("out.txt")).unwrap(), b"payload");
    }

    #[test]
    fn nonzero_exit_from_retrieve_command_is_a_miss() {
        let cache = CommandCache::new("cat".to_string(), "exit 1".to_string());
        let label = Label::parse("//a:b", None).unwrap();
        let key = please_util::HashAlgorithm::Sha256.hash_parts([b"k".as_slice()]);
        let dest = tempfile::tempdir().unwrap();
        let outcome = cache.retrieve(RetrieveRequest {
            label: &label,
            key: &key,
            out_dir: dest.path(),
            files: &[],
            is_binary: false,
        });
        assert!(!outcome.is_hit());
    }
}
