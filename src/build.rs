//! The build action (§4.4): fingerprint, consult the cache, execute on
//! miss, store on success.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::cache::{Cache, RetrieveRequest, RetrieveOutcome, StoreRequest};
use crate::error::ActionError;
use crate::fingerprint::{self, Fingerprint};
use crate::graph::BuildGraph;
use crate::label::Label;
use crate::process::{Process, ProcessRequest};
use crate::target::BuildTarget;

/// Caps the amount of a failed action's stderr carried in the error, per
/// §7: "action failures additionally include the tail of the action's
/// stderr (size-capped)".
const STDERR_TAIL_BYTES: usize = 4096;

pub enum BuildOutcome {
    Cached,
    Built,
}

/// `plz-out/bin/<pkg>/<name>` for binaries, `plz-out/gen/<pkg>/<name>`
/// otherwise (§6: "On-disk layout").
pub fn out_dir_for(repo_root: &Path, label: &Label, is_binary: bool) -> PathBuf {
    let tier = if is_binary { "bin" } else { "gen" };
    let pkg = label.package_key();
    let pkg = pkg.trim_start_matches("//").replace("//", "/");
    repo_root.join("plz-out").join(tier).join(pkg).join(label.name())
}

#[allow(clippy::too_many_arguments)]
pub fn run_build_action(
    graph: &BuildGraph,
    cache: &Arc<dyn Cache>,
    process: &dyn Process,
    repo_root: &Path,
    hash_algorithm: please_util::HashAlgorithm,
    hash_verification: bool,
    memo: &Mutex<FxHashMap<Label, Fingerprint>>,
    label: &Label,
) -> Result<BuildOutcome, ActionError> {
    let target = graph.target_or_die(label);
    // Only the memo lookup/insert needs the lock; cache and process I/O
    // below must not hold it; otherwise concurrent builds serialise on it
    // regardless of `num_build_threads`.
    let fp = {
        let mut memo = memo.lock().unwrap();
        fingerprint::compute_fingerprint(hash_algorithm, repo_root, graph, label, &mut memo).map_err(|e| {
            ActionError::NonZeroExit {
                label: label.clone(),
                status: -1,
                stderr_tail: format!("failed to hash inputs: {e}"),
            }
        })?
    };

    let out_dir = out_dir_for(repo_root, label, target.is_binary());
    let files = target.declared_outputs.clone();

    let retrieve_outcome = cache.retrieve(RetrieveRequest {
        label,
        key: fp.cache_key(),
        out_dir: &out_dir,
        files: &files,
        is_binary: target.is_binary(),
    });

    if let RetrieveOutcome::Hit(metadata) = retrieve_outcome {
        tracing::debug!(target = %label, "cache hit");
        if let (Some(callback), Some(meta)) = (&target.post_build, &metadata) {
            let effects = callback(&meta.0);
            target.add_dynamic_outputs(&effects.extra_outputs);
        }
        return Ok(BuildOutcome::Cached);
    }

    tracing::debug!(target = %label, "cache miss, executing action");
    please_util::remove_existing(&out_dir).ok();
    std::fs::create_dir_all(&out_dir).map_err(io_to_action_error(label))?;

    stage_inputs(repo_root, &out_dir, &target).map_err(io_to_action_error(label))?;

    let env = build_env(repo_root, label, &target, &files);
    let output = process
        .run(ProcessRequest {
            label,
            command: &target.build_command,
            working_dir: &out_dir,
            env: &env,
        })
        .map_err(io_to_action_error(label))?;

    if !output.success() {
        return Err(ActionError::NonZeroExit {
            label: label.clone(),
            status: output.status,
            stderr_tail: tail(&output.stderr, STDERR_TAIL_BYTES),
        });
    }

    for f in &files {
        let abs = out_dir.join(f);
        if !abs.exists() {
            return Err(ActionError::MissingOutput { label: label.clone(), path: f.clone() });
        }
        if hash_verification && !target.hash_verification_keys.is_empty() {
            // The verification keys name expected digests computed the same
            // way as the fingerprint's per-file content hash; a mismatch
            // means the action produced output inconsistent with what was
            // declared trustworthy ahead of time.
            let actual = hash_algorithm.hash_file(&abs).map_err(io_to_action_error(label))?;
            if !target.hash_verification_keys.iter().any(|k| k == &actual.to_hex()) {
                return Err(ActionError::OutputHashMismatch { label: label.clone(), path: f.clone() });
            }
        }
        let _ = please_util::set_cache_output_mode(&abs, target.is_binary());
    }

    if let Some(callback) = &target.post_build {
        let effects = callback(&output.stdout);
        target.add_dynamic_outputs(&effects.extra_outputs);
    }

    let metadata = if output.stdout.is_empty() {
        None
    } else {
        Some(crate::cache::ArtifactMetadata(output.stdout.clone()))
    };
    cache.store(StoreRequest {
        label,
        key: fp.cache_key(),
        metadata,
        out_dir: &out_dir,
        files: &files,
    });

    Ok(BuildOutcome::Built)
}

fn stage_inputs(repo_root: &Path, out_dir: &Path, target: &BuildTarget) -> std::io::Result<()> {
    for src in &target.srcs {
        let from = repo_root.join(src);
        let to = out_dir.join(src.file_name().unwrap_or(src.as_os_str()));
        please_util::hardlink_or_copy(&from, &to).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok(())
}

fn build_env(
    repo_root: &Path,
    label: &Label,
    target: &BuildTarget,
    files: &[PathBuf],
) -> std::collections::BTreeMap<String, String> {
    let outs: Vec<String> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let srcs: Vec<String> = target.srcs.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let pkg_key = label.package_key();
    let inputs = please_util::ActionEnvInputs {
        pkg: &pkg_key,
        name: label.name(),
        outs: &outs,
        srcs: &srcs,
    };
    let passthrough: std::collections::BTreeMap<String, String> = target.env.iter().cloned().collect();
    please_util::build_action_env(
        &repo_root.join("plz-out/tmp-home"),
        &std::env::var("PATH").unwrap_or_default(),
        &inputs,
        &passthrough,
    )
}

fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

fn io_to_action_error(label: &Label) -> impl Fn(std::io::Error) -> ActionError + '_ {
    move |e| ActionError::NonZeroExit {
        label: label.clone(),
        status: -1,
        stderr_tail: format!("io error: {e}"),
    }
}
