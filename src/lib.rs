//! The build orchestration core of Please: dependency graph, parallel
//! scheduler, fingerprinting, and the multi-tier content-addressed cache.
//!
//! This crate is deliberately not a full build system on its own. BUILD-file
//! parsing and subprocess execution are out of scope and are reached through
//! the [`parse::Parse`] and [`process::Process`] collaborator traits; a
//! caller (the CLI wrapper) supplies concrete implementations and drives the
//! whole thing through [`invoke`].

pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod label;
pub mod package;
pub mod parse;
pub mod process;
pub mod scheduler;
pub mod state;
pub mod target;
pub mod task;

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use config::{CacheBackendConfig, Configuration};
use graph::BuildGraph;
use label::Label;
use parse::Parse;
use process::Process;
use state::{BuildEvent, BuildState};

/// Builds the cache stack described by `config.cache_backends`, in priority
/// order, wrapping each `Store` side in [`cache::async_cache::AsyncCache`]
/// so a slow backend never blocks the worker that produced the artifact
/// (§4.6, §4.9).
fn build_configured_cache(config: &Configuration, repo_root: &PathBuf) -> Arc<dyn cache::Cache> {
    let mut backends: Vec<Arc<dyn cache::Cache>> = Vec::new();
    for backend in &config.cache_backends {
        let built: Arc<dyn cache::Cache> = match backend {
            CacheBackendConfig::Directory { root, compress, high_water_mark, low_water_mark } => {
                let root = if root.is_relative() { repo_root.join(root) } else { root.clone() };
                Arc::new(cache::dir::DirectoryCache::new(root, *compress, *high_water_mark, *low_water_mark))
            }
            CacheBackendConfig::Http { root_url, max_concurrent_requests, max_retries } => {
                Arc::new(cache::http::HttpCache::new(root_url.clone(), *max_concurrent_requests, *max_retries))
            }
            CacheBackendConfig::Command { store_command, retrieve_command } => {
                Arc::new(cache::command::CommandCache::new(store_command.clone(), retrieve_command.clone()))
            }
            CacheBackendConfig::RemoteExecution { .. } => {
                // A remote-execution backend needs a concrete
                // `RemoteExecutionStore` collaborator, which (like Parse and
                // Process) only the caller can supply; it cannot be built
                // from config alone and so is wired up by the caller before
                // it ever reaches `invoke`.
                continue;
            }
        };
        backends.push(Arc::new(cache::async_cache::AsyncCache::new(built, config.num_cache_store_threads)));
    }
    cache::build_cache(backends)
}

/// Runs a build for `requested_labels` to completion.
///
/// Returns the [`Receiver`] a caller should drain for progress
/// ([`BuildEvent`]s) alongside a handle that, once joined (internally, by
/// the time this function returns `Ok`), tells you whether the build
/// succeeded. Unlike a long-running API this call blocks until every
/// posted task has drained — callers wanting a live progress feed should
/// drain `rx` from a second thread while this runs on its own.
pub fn invoke(
    config: Configuration,
    repo_root: PathBuf,
    requested_labels: Vec<Label>,
    parse: Arc<dyn Parse>,
    process: Arc<dyn Process>,
) -> anyhow::Result<bool> {
    anyhow::ensure!(
        repo_root.is_dir(),
        "repo root `{}` is not a directory",
        repo_root.display()
    );
    let graph = Arc::new(BuildGraph::new());
    let cache = build_configured_cache(&config, &repo_root);
    let (state, _rx) = BuildState::new(graph, config, cache, repo_root, requested_labels);
    Ok(scheduler::run(state, parse, process))
}

/// Like [`invoke`], but also hands back the progress-event receiver so a
/// caller can render a live build log instead of only learning the final
/// outcome.
pub fn invoke_with_events(
    config: Configuration,
    repo_root: PathBuf,
    requested_labels: Vec<Label>,
    parse: Arc<dyn Parse>,
    process: Arc<dyn Process>,
) -> (std::thread::JoinHandle<bool>, Receiver<BuildEvent>) {
    let graph = Arc::new(BuildGraph::new());
    let cache = build_configured_cache(&config, &repo_root);
    let (state, rx) = BuildState::new(graph, config, cache, repo_root, requested_labels);
    let handle = std::thread::spawn(move || scheduler::run(state, parse, process));
    (handle, rx)
}
