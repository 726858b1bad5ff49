//! The cache layer (§4.5-4.11): a multi-tier, content-addressed artifact
//! store sitting beside the scheduler.

pub mod async_cache;
pub mod command;
pub mod dir;
pub mod http;
pub mod rex;
pub mod tarball;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use please_util::Digest256;

use crate::label::Label;

/// An opaque blob carried alongside a cache entry — chiefly used to
/// transport a build's captured stdout so a post-build callback can run
/// identically after a cache hit as after an in-process build (§4.4).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArtifactMetadata(pub Vec<u8>);

pub struct StoreRequest<'a> {
    pub label: &'a Label,
    pub key: &'a Digest256,
    pub metadata: Option<ArtifactMetadata>,
    /// The directory the declared outputs currently live in (the target's
    /// out-directory after a successful build).
    pub out_dir: &'a Path,
    /// Declared output paths, relative to `out_dir`.
    pub files: &'a [PathBuf],
}

pub struct RetrieveRequest<'a> {
    pub label: &'a Label,
    pub key: &'a Digest256,
    /// Where a hit should materialise its files.
    pub out_dir: &'a Path,
    pub files: &'a [PathBuf],
    /// Whether this target is a binary, for output file-mode purposes
    /// (§4.5: "binary targets get 0555, others 0444").
    pub is_binary: bool,
}

pub enum RetrieveOutcome {
    Hit(Option<ArtifactMetadata>),
    Miss,
}

impl RetrieveOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, RetrieveOutcome::Hit(_))
    }
}

/// The contract every backend, and the multiplexer composing them, must
/// satisfy (§4.5).
pub trait Cache: Send + Sync {
    /// Best-effort; failures are logged and dropped, never surfaced as a
    /// build error (§7: "Cache errors ... never fatal").
    fn store(&self, req: StoreRequest<'_>);

    /// Synchronous: this blocks the build action that calls it.
    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome;

    /// Removes all cached artifacts for `label` across all known keys.
    /// Backends that cannot support this are expected to no-op.
    fn clean(&self, label: &Label);

    /// Removes everything. Backends that cannot support this no-op.
    fn clean_all(&self);

    /// Drains any asynchronous work and releases resources. Must be
    /// synchronous: on return, everything submitted has completed.
    fn shutdown(&self);
}

/// The cache used when no backend is configured (§4.6: "If zero backends
/// are configured, it collapses to a no-op cache").
pub struct NoopCache;

impl Cache for NoopCache {
    fn store(&self, _req: StoreRequest<'_>) {}
    fn retrieve(&self, _req: RetrieveRequest<'_>) -> RetrieveOutcome {
        RetrieveOutcome::Miss
    }
    fn clean(&self, _label: &Label) {}
    fn clean_all(&self) {}
    fn shutdown(&self) {}
}

/// Composes backends in priority order. Store fans out concurrently;
/// Retrieve polls sequentially and back-fills higher-priority backends on a
/// hit from a lower one (§4.6).
pub struct Multiplexer {
    backends: Vec<Arc<dyn Cache>>,
}

impl Multiplexer {
    pub fn new(backends: Vec<Arc<dyn Cache>>) -> Multiplexer {
        Multiplexer { backends }
    }
}

impl Cache for Multiplexer {
    fn store(&self, req: StoreRequest<'_>) {
        std::thread::scope(|scope| {
            for backend in &self.backends {
                let backend = Arc::clone(backend);
                let req = StoreRequest {
                    label: req.label,
                    key: req.key,
                    metadata: req.metadata.clone(),
                    out_dir: req.out_dir,
                    files: req.files,
                };
                scope.spawn(move || backend.store(req));
            }
        });
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        for (i, backend) in self.backends.iter().enumerate() {
            let outcome = backend.retrieve(RetrieveRequest {
                label: req.label,
                key: req.key,
                out_dir: req.out_dir,
                files: req.files,
                is_binary: req.is_binary,
            });
            if let RetrieveOutcome::Hit(metadata) = outcome {
                for higher in &self.backends[..i] {
                    higher.store(StoreRequest {
                        label: req.label,
                        key: req.key,
                        metadata: metadata.clone(),
                        out_dir: req.out_dir,
                        files: req.files,
                    });
                }
                return RetrieveOutcome::Hit(metadata);
            }
        }
        RetrieveOutcome::Miss
    }

    fn clean(&self, label: &Label) {
        for backend in &self.backends {
            backend.clean(label);
        }
    }

    fn clean_all(&self) {
        for backend in &self.backends {
            backend.clean_all();
        }
    }

    fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown();
        }
    }
}

/// Builds the configured cache stack, collapsing to a no-op or a bare
/// single backend when the multiplexer would add nothing (§4.6).
pub fn build_cache(backends: Vec<Arc<dyn Cache>>) -> Arc<dyn Cache> {
    match backends.len() {
        0 => Arc::new(NoopCache),
        1 => backends.into_iter().next().unwrap(),
        _ => Arc::new(Multiplexer::new(backends)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingCache {
        hit_at: Option<usize>,
        stores: Mutex<Vec<()>>,
        retrieves: AtomicUsize,
    }

    impl Cache for RecordingCache {
        fn store(&self, _req: StoreRequest<'_>) {
            self.stores.lock().unwrap().push(());
        }
        fn retrieve(&self, _req: RetrieveRequest<'_>) -> RetrieveOutcome {
            let n = self.retrieves.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.hit_at {
                RetrieveOutcome::Hit(None)
            } else {
                RetrieveOutcome::Miss
            }
        }
        fn clean(&self, _label: &Label) {}
        fn clean_all(&self) {}
        fn shutdown(&self) {}
    }

    fn label() -> Label {
        Label::parse("//a:b", None).unwrap()
    }

    fn key() -> Digest256 {
        please_util::HashAlgorithm::Sha256.hash_parts([b"k".as_slice()])
    }

    #[test]
    fn zero_backends_collapses_to_noop() {
        let c = build_cache(vec![]);
        let l = label();
        let k = key();
        let outcome = c.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: Path::new("."),
            files: &[],
            is_binary: false,
        });
        assert!(!outcome.is_hit());
    }

    #[test]
    fn single_backend_is_used_without_wrapping() {
        let backend = Arc::new(RecordingCache {
            hit_at: Some(0),
            stores: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        });
        let c = build_cache(vec![backend.clone()]);
        let l = label();
        let k = key();
        let outcome = c.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: Path::new("."),
            files: &[],
            is_binary: false,
        });
        assert!(outcome.is_hit());
        // A multiplexer around a single backend would still back-fill into
        // itself; since there's nothing above it in priority, no extra
        // store should have been issued.
        assert_eq!(backend.stores.lock().unwrap().len(), 0);
    }

    #[test]
    fn retrieve_polls_sequentially_and_backfills_higher_priority() {
        let first = Arc::new(RecordingCache {
            hit_at: None,
            stores: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        });
        let second = Arc::new(RecordingCache {
            hit_at: Some(0),
            stores: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        });
        let mux = Multiplexer::new(vec![first.clone(), second.clone()]);

        let l = label();
        let k = key();
        let outcome = mux.retrieve(RetrieveRequest {
            label: &l,
            key: &k,
            out_dir: Path::new("."),
            files: &[],
            is_binary: false,
        });
        assert!(outcome.is_hit());
        assert_eq!(first.stores.lock().unwrap().len(), 1, "hit from backend 1 must back-fill backend 0");
        assert_eq!(second.retrieves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_fans_out_to_every_backend() {
        let first = Arc::new(RecordingCache {
            hit_at: None,
            stores: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        });
        let second = Arc::new(RecordingCache {
            hit_at: None,
            stores: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        });
        let mux = Multiplexer::new(vec![first.clone(), second.clone()]);
        let l = label();
        let k = key();
        mux.store(StoreRequest {
            label: &l,
            key: &k,
            metadata: None,
            out_dir: Path::new("."),
            files: &[],
        });
        assert_eq!(first.stores.lock().unwrap().len(), 1);
        assert_eq!(second.stores.lock().unwrap().len(), 1);
    }
}
