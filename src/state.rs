//! `BuildState` (§3, §4.1 "init on invocation"): the process-wide context
//! shared by every worker — graph, config, cache, task queue, counters,
//! result stream.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use rustc_hash::FxHashMap;

use crate::cache::Cache;
use crate::config::Configuration;
use crate::graph::BuildGraph;
use crate::label::Label;
use crate::scheduler::queue::WorkQueue;

/// A line of the progress stream a caller drains while the build runs.
#[derive(Clone, Debug)]
pub enum BuildEvent {
    Parsed { label: Label },
    Cached { label: Label },
    Built { label: Label },
    Tested { label: Label, passed: bool },
    Failed { label: Label, reason: String },
}

pub struct BuildState {
    pub graph: Arc<BuildGraph>,
    pub config: Configuration,
    pub cache: Arc<dyn Cache>,
    pub repo_root: PathBuf,
    pub queue: WorkQueue,
    pub results: mpsc::SyncSender<BuildEvent>,
    pub requested_labels: Vec<Label>,
    pub fingerprint_memo: std::sync::Mutex<FxHashMap<Label, crate::fingerprint::Fingerprint>>,
    failed: AtomicBool,
}

/// How many in-flight progress events to buffer before a slow observer
/// starts applying backpressure to workers (§3: "buffered only enough to
/// decouple workers from the progress observer").
const RESULTS_BUFFER: usize = 256;

impl BuildState {
    pub fn new(
        graph: Arc<BuildGraph>,
        config: Configuration,
        cache: Arc<dyn Cache>,
        repo_root: PathBuf,
        requested_labels: Vec<Label>,
    ) -> (Arc<BuildState>, mpsc::Receiver<BuildEvent>) {
        let (tx, rx) = mpsc::sync_channel(RESULTS_BUFFER);
        let num_workers = config.num_build_threads;
        let state = Arc::new(BuildState {
            graph,
            config,
            cache,
            repo_root,
            queue: WorkQueue::new(num_workers),
            results: tx,
            requested_labels,
            fingerprint_memo: std::sync::Mutex::new(FxHashMap::default()),
            failed: AtomicBool::new(false),
        });
        (state, rx)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether a task should actually execute, or be short-circuited
    /// because the build has already failed and keep-going is off (§4.3:
    /// "drains the queue by short-circuiting remaining tasks without
    /// executing them").
    pub fn should_skip(&self) -> bool {
        !self.config.keep_going && self.has_failed()
    }

    pub fn emit(&self, event: BuildEvent) {
        let _ = self.results.send(event);
    }

    pub fn label_allowed(&self, labels: &BTreeSet<String>) -> bool {
        self.config.label_filter_allows(labels)
    }
}
