//! The async wrapper (§4.7): Retrieve stays synchronous (it blocks the
//! action that calls it); Store is pushed onto an unbuffered channel and
//! drained by W worker threads.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use please_util::Digest256;

use crate::cache::{ArtifactMetadata, Cache, RetrieveOutcome, RetrieveRequest, StoreRequest};
use crate::label::Label;

/// An owned version of [`StoreRequest`] — the borrowed form can't cross the
/// channel to a worker thread.
struct OwnedStoreRequest {
    label: Label,
    key: Digest256,
    metadata: Option<ArtifactMetadata>,
    out_dir: PathBuf,
    files: Vec<PathBuf>,
}

enum Message {
    Store(OwnedStoreRequest),
    Shutdown,
}

pub struct AsyncCache {
    inner: Arc<dyn Cache>,
    sender: mpsc::SyncSender<Message>,
    workers: std::sync::Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl AsyncCache {
    /// Spawns `num_workers` threads draining an unbuffered (rendezvous)
    /// channel of Store requests against `inner`.
    pub fn new(inner: Arc<dyn Cache>, num_workers: usize) -> AsyncCache {
        let (sender, receiver) = mpsc::sync_channel::<Message>(0);
        let receiver = Arc::new(std::sync::Mutex::new(receiver));

        let mut workers = Vec::with_capacity(num_workers.max(1));
        for _ in 0..num_workers.max(1) {
            let inner = inner.clone();
            let receiver = receiver.clone();
            workers.push(std::thread::spawn(move || loop {
                let msg = receiver.lock().unwrap().recv();
                match msg {
                    Ok(Message::Store(req)) => {
                        inner.store(StoreRequest {
                            label: &req.label,
                            key: &req.key,
                            metadata: req.metadata,
                            out_dir: &req.out_dir,
                            files: &req.files,
                        });
                    }
                    Ok(Message::Shutdown) | Err(_) => break,
                }
            }));
        }

        AsyncCache { inner, sender, workers: std::sync::Mutex::new(workers) }
    }
}

impl Cache for AsyncCache {
    fn store(&self, req: StoreRequest<'_>) {
        let owned = OwnedStoreRequest {
            label: req.label.clone(),
            key: req.key.clone(),
            metadata: req.metadata.clone(),
            out_dir: req.out_dir.to_path_buf(),
            files: req.files.to_vec(),
        };
        // The channel is unbuffered: this blocks until a worker is free to
        // take it, which is the deliberate backpressure §5 describes.
        if self.sender.send(Message::Store(owned)).is_err() {
            tracing::warn!(target = %req.label, "async cache store attempted after shutdown");
        }
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        self.inner.retrieve(req)
    }

    fn clean(&self, label: &Label) {
        self.inner.clean(label);
    }

    fn clean_all(&self) {
        self.inner.clean_all();
    }

    /// Closes the channel and waits for every worker to drain; on return,
    /// every submitted Store has completed (§4.7).
    fn shutdown(&self) {
        for _ in 0..self.workers.lock().unwrap().len() {
            let _ = self.sender.send(Message::Shutdown);
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.inner.shutdown();
    }
}
