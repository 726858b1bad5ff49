//! The remote-execution cache backend (§4.11): artifacts addressed by
//! content-hash digest rather than by fingerprint, with metadata persisted
//! in a fingerprint-keyed action-result record.
//!
//! A real implementation talks REAPI (gRPC) to a remote build service; that
//! transport is out of scope here (no such service is part of this core's
//! test surface), so this backend models the two stores REAPI exposes —
//! content-addressable storage and the action-result cache — as an
//! injected [`RemoteExecutionStore`] collaborator, the same seam pattern
//! the repo uses for `Process`/`Parse`.

use std::path::PathBuf;

use please_util::Digest256;

use crate::cache::{tarball, ArtifactMetadata, Cache, RetrieveOutcome, RetrieveRequest, StoreRequest};
use crate::label::Label;

/// A content-addressed blob reference: digest plus size, REAPI's own
/// addressing scheme (§4.11: "referenced by content-hash digests (size +
/// hex-hash) rather than by fingerprint").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentDigest {
    pub hash_hex: String,
    pub size_bytes: u64,
}

/// What the action-result record for a fingerprint holds: the digest of
/// the packed output blob, plus the captured-stdout metadata needed for
/// post-build callbacks.
#[derive(Clone, Debug)]
pub struct ActionResult {
    pub output_digest: ContentDigest,
    pub metadata: Option<ArtifactMetadata>,
}

/// The two REAPI stores this backend needs. A production implementation
/// backs this with gRPC calls to `ContentAddressableStorage` and
/// `ActionCache`; tests back it with an in-memory map.
pub trait RemoteExecutionStore: Send + Sync {
    fn find_action_result(&self, fingerprint: &Digest256) -> Option<ActionResult>;
    fn update_action_result(&self, fingerprint: &Digest256, result: ActionResult);
    fn download_blob(&self, digest: &ContentDigest) -> Option<Vec<u8>>;
    fn upload_blob(&self, bytes: &[u8]) -> ContentDigest;
}

pub struct RemoteExecutionCache {
    store: std::sync::Arc<dyn RemoteExecutionStore>,
    read_only: bool,
}

impl RemoteExecutionCache {
    pub fn new(store: std::sync::Arc<dyn RemoteExecutionStore>, read_only: bool) -> RemoteExecutionCache {
        RemoteExecutionCache { store, read_only }
    }
}

impl Cache for RemoteExecutionCache {
    fn store(&self, req: StoreRequest<'_>) {
        // §4.11: "Store is a no-op when the client is configured read-only."
        if self.read_only {
            return;
        }
        let mut body = Vec::new();
        if let Err(e) = tarball::pack(&mut body, req.out_dir, req.files) {
            tracing::warn!(target = %req.label, error = %e, "failed to package outputs for remote-execution store");
            return;
        }
        let digest = self.store.upload_blob(&body);
        self.store.update_action_result(
            req.key,
            ActionResult { output_digest: digest, metadata: req.metadata.clone() },
        );
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        let Some(result) = self.store.find_action_result(req.key) else {
            return RetrieveOutcome::Miss;
        };
        let Some(body) = self.store.download_blob(&result.output_digest) else {
            tracing::warn!(target = %req.label, "remote-execution action result present but blob missing, treating as miss");
            return RetrieveOutcome::Miss;
        };

        for f in req.files {
            let _ = please_util::remove_existing(&req.out_dir.join(f));
        }
        if let Err(e) = tarball::unpack(body.as_slice(), req.out_dir) {
            tracing::warn!(target = %req.label, error = %e, "remote-execution blob corrupt, treating as miss");
            return RetrieveOutcome::Miss;
        }
        for f in req.files {
            let _ = please_util::set_cache_output_mode(&req.out_dir.join(f), req.is_binary);
        }
        RetrieveOutcome::Hit(result.metadata)
    }

    fn clean(&self, _label: &Label) {}
    fn clean_all(&self) {}
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct InMemoryStore {
        blobs: Mutex<std::collections::HashMap<String, Vec<u8>>>,
        results: Mutex<std::collections::HashMap<Vec<u8>, ActionResult>>,
    }

    impl InMemoryStore {
        fn new() -> InMemoryStore {
            InMemoryStore {
                blobs: Mutex::new(std::collections::HashMap::new()),
                results: Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    impl RemoteExecutionStore for InMemoryStore {
        fn find_action_result(&self, fingerprint: &Digest256) -> Option<ActionResult> {
            self.results.lock().unwrap().get(fingerprint.as_bytes()).cloned()
        }
        fn update_action_result(&self, fingerprint: &Digest256, result: ActionResult) {
            self.results.lock().unwrap().insert(fingerprint.as_bytes().to_vec(), result);
        }
        fn download_blob(&self, digest: &ContentDigest) -> Option<Vec<u8>> {
            self.blobs.lock().unwrap().get(&digest.hash_hex).cloned()
        }
        fn upload_blob(&self, bytes: &[u8]) -> ContentDigest {
            let hash = please_util::HashAlgorithm::Sha256.hash_parts([bytes]).to_hex();
            self.blobs.lock().unwrap().insert(hash.clone(), bytes.to_vec());
            ContentDigest { hash_hex: hash, size_bytes: bytes.len() as u64 }
        }
    }

    #[test]
    fn store_then_retrieve_roundtrips() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let cache = RemoteExecutionCache::new(store, false);

        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"rex-artifact").unwrap();

        let label = Label::parse("//a:b", None).unwrap();
        let key = please_util::HashAlgorithm::Sha256.hash_parts([b"k".as_slice()]);
        let files = vec![PathBuf::from("out.bin")];

        cache.store(StoreRequest {
            label: &label,
            key: &key,
            metadata: Some(ArtifactMetadata(b"stdout".to_vec())),
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
        match outcome {
            RetrieveOutcome::Hit(Some(m)) => assert_eq!(m.0, b"stdout"),
            _ => panic!("expected hit"),
        }
        assert_eq!(std::fs::read(dest.path().join("out.bin")).unwrap(), b"rex-artifact");
    }

    #[test]
    fn read_only_client_never_stores() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let cache = RemoteExecutionCache::new(store, true);
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("out.bin"), b"x").unwrap();
        let label = Label::parse("//a:b", None).unwrap();
        let key = please_util::HashAlgorithm::Sha256.hash_parts([b"k".as_slice()]);
        cache.store(StoreRequest {
            label: &label,
            key: &key,
            metadata: None,
            out_dir: work.path(),
            files: &[PathBuf::from("out.bin")],
        });

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
