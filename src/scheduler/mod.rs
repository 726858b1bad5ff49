//! The worker pool (§4.3): N workers pulling tasks from [`queue::WorkQueue`]
//! and dispatching on kind.

pub mod queue;

use std::sync::Arc;

use crate::build::{self, BuildOutcome};
use crate::label::Label;
use crate::parse::Parse;
use crate::process::Process;
use crate::state::{BuildEvent, BuildState};
use crate::target::{Dependency, TargetState};
use crate::task::{Task, TaskKind};

/// Runs the build to completion: posts Parse tasks for the requested
/// labels, spins up the worker pool, and blocks until every task has
/// drained. Returns whether the build succeeded (no target failed, or
/// keep-going was on and every failure was already reported).
pub fn run(state: Arc<BuildState>, parse: Arc<dyn Parse>, process: Arc<dyn Process>) -> bool {
    for label in state.requested_labels.clone() {
        state.queue.post(Task::new(label.clone(), label, TaskKind::Parse));
    }

    let num_workers = state.config.num_build_threads;
    let handles: Vec<_> = (0..num_workers)
        .map(|_| {
            let state = state.clone();
            let parse = parse.clone();
            let process = process.clone();
            std::thread::spawn(move || worker_loop(state, parse, process))
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }
    state.cache.shutdown();
    !state.has_failed()
}

fn worker_loop(state: Arc<BuildState>, parse: Arc<dyn Parse>, process: Arc<dyn Process>) {
    while let Some(task) = state.queue.next() {
        if state.should_skip() {
            state.queue.mark_done();
            continue;
        }
        dispatch(&state, &parse, &process, task);
    }
}

fn dispatch(state: &Arc<BuildState>, parse: &Arc<dyn Parse>, process: &Arc<dyn Process>, task: Task) {
    match task.kind {
        TaskKind::Parse | TaskKind::SubincludeParse => do_parse(state, parse, &task.label),
        TaskKind::Build | TaskKind::SubincludeBuild => do_build(state, process, &task.label),
        TaskKind::Test => do_test(state, process, &task.label),
    }
    // Any new tasks a dispatch implies must already have been posted by
    // this point (see queue::WorkQueue's doc comment on ordering).
    state.queue.mark_done();
}

fn do_parse(state: &Arc<BuildState>, parse: &Arc<dyn Parse>, label: &Label) {
    let package_key = label.package_key();
    let subrepo = label.subrepo().map(str::to_string);
    let package_path = package_str(label);

    if !state.graph.package_exists(&package_key) {
        match parse.parse_package(&package_path, subrepo.as_deref()) {
            Ok(parsed) => {
                if state
                    .graph
                    .add_package(package_key.clone(), crate::package::Package::new(parsed.path.clone(), parsed.subrepo.clone()))
                    .is_err()
                {
                    // Lost a race with another worker parsing the same
                    // package concurrently; that worker's registration wins
                    // and this one's targets are simply not registered
                    // again below.
                    return;
                }
                for built_target in parsed.targets {
                    let target_label = built_target.label().clone();
                    let deps: Vec<Dependency> = built_target.deps.clone();
                    let flagged_labels = built_target.labels.clone();
                    if let Err(e) = state.graph.add_target(&package_key, Arc::new(built_target)) {
                        tracing::warn!(label = %target_label, error = %e, "failed to register parsed target");
                        state.mark_failed();
                        continue;
                    }
                    for dep in &deps {
                        if let Err(e) = state.graph.add_dependency(target_label.clone(), dep.label.clone()) {
                            tracing::warn!(label = %target_label, error = %e, "dependency rejected");
                            state.mark_failed();
                        }
                        if !state.graph.package_exists(&dep.label.package_key()) {
                            state.queue.post(Task::new(dep.label.clone(), target_label.clone(), TaskKind::Parse));
                        }
                    }
                    if !state.label_allowed(&flagged_labels) {
                        continue;
                    }
                    state.graph.set_state(&target_label, TargetState::Parsed);
                    state.emit(BuildEvent::Parsed { label: target_label.clone() });
                    maybe_post_build(state, &target_label);
                }
            }
            Err(e) => {
                tracing::warn!(package = %package_path, error = %e, "parse failed");
                state.mark_failed();
            }
        }
    }

    // Whether or not this worker did the parsing, `label` itself may now
    // be ready (if this Parse task was posted as a forward reference and
    // another worker already parsed its package first).
    if let Some(target) = state.graph.target(label) {
        if target.state() == TargetState::Inactive {
            state.graph.set_state(label, TargetState::Parsed);
        }
        maybe_post_build(state, label);
    }
}

fn package_str(label: &Label) -> String {
    match label.package() {
        crate::label::PackagePath::Root => String::new(),
        other => other.to_string(),
    }
}

fn maybe_post_build(state: &Arc<BuildState>, label: &Label) {
    if state.graph.try_mark_ready_for_build(label) {
        state.queue.post(Task::new(label.clone(), label.clone(), TaskKind::Build));
    }
}

fn do_build(state: &Arc<BuildState>, process: &Arc<dyn Process>, label: &Label) {
    state.graph.set_state(label, TargetState::Building);
    let result = build::run_build_action(
        &state.graph,
        &state.cache,
        process.as_ref(),
        &state.repo_root,
        state.config.hash_algorithm,
        state.config.hash_verification,
        &state.fingerprint_memo,
        label,
    );

    match result {
        Ok(outcome) => {
            state.graph.set_state(label, TargetState::Built);
            state.emit(match outcome {
                BuildOutcome::Cached => BuildEvent::Cached { label: label.clone() },
                BuildOutcome::Built => BuildEvent::Built { label: label.clone() },
            });

            let target = state.graph.target_or_die(label);
            for reverse_dep in state.graph.reverse_dependencies_of(label) {
                maybe_post_build(state, &reverse_dep);
            }
            if target.is_test() {
                state.queue.post(Task::new(label.clone(), label.clone(), TaskKind::Test));
            }
        }
        Err(e) => {
            state.graph.set_state(label, TargetState::Failed);
            state.graph.poison_transitively(label);
            state.emit(BuildEvent::Failed { label: label.clone(), reason: e.to_string() });
            if !state.config.keep_going {
                state.mark_failed();
            }
        }
    }
}

fn do_test(state: &Arc<BuildState>, process: &Arc<dyn Process>, label: &Label) {
    let target = state.graph.target_or_die(label);
    let Some(test_command) = target.test_command.clone() else {
        return;
    };
    let out_dir = build::out_dir_for(&state.repo_root, label, target.is_binary());
    let env: std::collections::BTreeMap<String, String> = target.env.iter().cloned().collect();

    let result = process.run(crate::process::ProcessRequest {
        label,
        command: &test_command,
        working_dir: &out_dir,
        env: &env,
    });

    match result {
        Ok(output) if output.success() => {
            state.graph.set_state(label, TargetState::Tested);
            state.emit(BuildEvent::Tested { label: label.clone(), passed: true });
        }
        Ok(output) => {
            state.graph.set_state(label, TargetState::Failed);
            state.emit(BuildEvent::Tested { label: label.clone(), passed: false });
            state.emit(BuildEvent::Failed {
                label: label.clone(),
                reason: format!("test exited with status {}", output.status),
            });
            if !state.config.keep_going {
                state.mark_failed();
            }
        }
        Err(e) => {
            state.graph.set_state(label, TargetState::Failed);
            state.emit(BuildEvent::Failed { label: label.clone(), reason: e.to_string() });
            if !state.config.keep_going {
                state.mark_failed();
            }
        }
    }
}
