//! `BuildGraph`: the process-wide, concurrently accessed registry of
//! packages and targets (§4.1).

use std::path::Path;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::ConfigError;
use crate::label::Label;
use crate::package::Package;
use crate::target::{BuildTarget, TargetState};

struct Inner {
    packages: FxHashMap<String, Package>,
    targets: FxHashMap<Label, Arc<BuildTarget>>,
    /// from -> [to]: "from depends on to".
    edges: FxHashMap<Label, Vec<Label>>,
    /// to -> [from]: used to propagate poisoning and readiness.
    reverse_edges: FxHashMap<Label, Vec<Label>>,
    /// Dependencies recorded against a target that hadn't been parsed yet
    /// when the edge was declared — forward references (§4.1: "AddTarget
    /// ... resolves any forward references to this target").
    pending_refs: FxHashMap<Label, Vec<Label>>,
}

/// The single source of truth for all known targets and packages during a
/// build. The graph never unregisters anything; its lifetime is the
/// lifetime of the build.
pub struct BuildGraph {
    inner: std::sync::Mutex<Inner>,
}

impl BuildGraph {
    pub fn new() -> BuildGraph {
        BuildGraph {
            inner: std::sync::Mutex::new(Inner {
                packages: FxHashMap::default(),
                targets: FxHashMap::default(),
                edges: FxHashMap::default(),
                reverse_edges: FxHashMap::default(),
                pending_refs: FxHashMap::default(),
            }),
        }
    }

    /// Registers a package. Fails if a package with the same key (path +
    /// subrepo) is already present.
    pub fn add_package(&self, key: String, pkg: Package) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.packages.contains_key(&key) {
            return Err(ConfigError::DuplicatePackage(key));
        }
        inner.packages.insert(key, pkg);
        Ok(())
    }

    /// Registers a target into an already-registered package, resolving any
    /// forward references previously recorded against its label, and
    /// running the deferred visibility check against every target that
    /// depends on it.
    pub fn add_target(
        &self,
        package_key: &str,
        target: Arc<BuildTarget>,
    ) -> Result<(), ConfigError> {
        let label = target.label().clone();

        for path in target
            .declared_outputs
            .iter()
            .chain(target.optional_outputs.iter())
            .chain(target.test_outputs.iter())
        {
            if please_util::ensure_within(Path::new("."), path).is_err() {
                return Err(ConfigError::OutputEscapesOutDir { label, path: path.clone() });
            }
        }

        let mut inner = self.inner.lock().unwrap();

        if inner.targets.contains_key(&label) {
            return Err(ConfigError::DuplicateTarget(label));
        }

        {
            let pkg = inner
                .packages
                .get_mut(package_key)
                .unwrap_or_else(|| panic!("package `{package_key}` not registered before target `{label}`"));
            pkg.add_target(target.clone())
                .map_err(|_| ConfigError::DuplicateTarget(label.clone()))?;
        }

        inner.targets.insert(label.clone(), target.clone());

        // Resolve forward references: everyone who declared a dependency on
        // `label` before it was parsed gets its visibility re-checked now
        // that the real target (and its visibility attribute) exists.
        if let Some(waiters) = inner.pending_refs.remove(&label) {
            for from in waiters {
                let from_package = from.package_key();
                let own_package = label.package_key();
                if !target.visibility.allows(&own_package, &from_package) {
                    return Err(ConfigError::VisibilityViolation {
                        from,
                        to: label.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Looks up a target by label. Safe under concurrent readers; returns
    /// `None` if unregistered (including "registered but not yet parsed
    /// enough to exist", which is simply "not yet in the map").
    pub fn target(&self, label: &Label) -> Option<Arc<BuildTarget>> {
        self.inner.lock().unwrap().targets.get(label).cloned()
    }

    pub fn package_exists(&self, key: &str) -> bool {
        self.inner.lock().unwrap().packages.contains_key(key)
    }

    /// Convenience for callers that have already established the entity
    /// must exist; aborts the build (via panic) otherwise, exactly as the
    /// name promises.
    pub fn target_or_die(&self, label: &Label) -> Arc<BuildTarget> {
        self.target(label)
            .unwrap_or_else(|| panic!("internal error: target `{label}` must exist but does not"))
    }

    pub fn package_or_die(&self, key: &str) {
        if !self.package_exists(key) {
            panic!("internal error: package `{key}` must exist but does not");
        }
    }

    /// Records a dependency edge `from -> to` ("from depends on to").
    ///
    /// If `to` is not yet registered, the edge is still recorded (so
    /// readiness / poisoning propagation works once `to` eventually
    /// parses) and a forward reference is kept so the deferred visibility
    /// check in [`Self::add_target`] can run later.
    ///
    /// Cycles are rejected here, before the edge is committed, via a
    /// colour-mark DFS from `to` looking for a path back to `from`.
    pub fn add_dependency(&self, from: Label, to: Label) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().unwrap();

        if path_exists(&inner.edges, &to, &from) {
            return Err(ConfigError::DependencyCycle(from));
        }

        if let Some(target) = inner.targets.get(&to).cloned() {
            let own_package = to.package_key();
            let from_package = from.package_key();
            if !target.visibility.allows(&own_package, &from_package) {
                return Err(ConfigError::VisibilityViolation { from, to });
            }
        } else {
            inner.pending_refs.entry(to.clone()).or_default().push(from.clone());
        }

        inner.edges.entry(from.clone()).or_default().push(to.clone());
        inner.reverse_edges.entry(to).or_default().push(from);
        Ok(())
    }

    pub fn dependencies_of(&self, label: &Label) -> Vec<Label> {
        self.inner
            .lock()
            .unwrap()
            .edges
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reverse_dependencies_of(&self, label: &Label) -> Vec<Label> {
        self.inner
            .lock()
            .unwrap()
            .reverse_edges
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    /// True once every dependency of `label` has reached `Built` (or later:
    /// `PendingTest`/`Testing`/`Tested`). Used by the scheduler to decide
    /// when a Build task may be posted (§4.3).
    pub fn dependencies_built(&self, label: &Label) -> bool {
        let deps = self.dependencies_of(label);
        deps.iter().all(|d| {
            self.target(d)
                .map(|t| t.state() >= TargetState::Built)
                .unwrap_or(false)
        })
    }

    /// True if any dependency of `label` has failed — the poisoning
    /// condition (§4.3, §7).
    pub fn has_failed_dependency(&self, label: &Label) -> bool {
        let deps = self.dependencies_of(label);
        deps.iter()
            .any(|d| self.target(d).map(|t| t.state().is_terminal_failure()).unwrap_or(false))
    }

    /// Writes `new_state` for `label`'s target under the graph's single
    /// mutex, the serialisation point §4.1/§5 describe for all state
    /// transitions.
    pub fn set_state(&self, label: &Label, new_state: TargetState) {
        let inner = self.inner.lock().unwrap();
        if let Some(t) = inner.targets.get(label) {
            t.state_cell().set(new_state);
        }
    }

    /// Atomically checks "is `label` Parsed, with every dependency Built
    /// and none Failed" and, if so, advances it to `PendingBuild` and
    /// returns `true`. This is the single serialisation point for
    /// readiness (§4.3: "performed by the worker that completes the
    /// last-required dependency") — everything happens under one lock
    /// acquisition so two workers racing on the same target's last
    /// dependency can't both observe readiness.
    pub fn try_mark_ready_for_build(&self, label: &Label) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(target) = inner.targets.get(label) else {
            return false;
        };
        if target.state() != TargetState::Parsed {
            return false;
        }
        let deps = inner.edges.get(label);
        let ready = deps.map_or(true, |deps| {
            deps.iter().all(|d| {
                inner
                    .targets
                    .get(d)
                    .map(|t| t.state() >= TargetState::Built)
                    .unwrap_or(false)
            })
        });
        if !ready {
            return false;
        }
        let poisoned = deps.map_or(false, |deps| {
            deps.iter().any(|d| {
                inner
                    .targets
                    .get(d)
                    .map(|t| t.state().is_terminal_failure())
                    .unwrap_or(false)
            })
        });
        if poisoned {
            return false;
        }
        target.state_cell().set(TargetState::PendingBuild);
        true
    }

    /// Marks `label`'s reverse-dependency closure `Failed` — the poisoning
    /// propagation of §4.3/§7 ("any target with a Failed dependency itself
    /// transitions to a pending-but-poisoned state and is never
    /// scheduled"). A single BFS under one lock acquisition, so it cannot
    /// deadlock against itself the way two nested calls through the public
    /// per-label accessors would.
    pub fn poison_transitively(&self, label: &Label) {
        let inner = self.inner.lock().unwrap();
        let mut seen: FxHashSet<Label> = FxHashSet::default();
        let mut stack: Vec<Label> = inner.reverse_edges.get(label).cloned().unwrap_or_default();
        while let Some(l) = stack.pop() {
            if !seen.insert(l.clone()) {
                continue;
            }
            if let Some(t) = inner.targets.get(&l) {
                t.state_cell().set(TargetState::Failed);
            }
            if let Some(next) = inner.reverse_edges.get(&l) {
                stack.extend(next.iter().cloned());
            }
        }
    }
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Colour-mark DFS: is there a path from `start` to `goal` using the edges
/// recorded so far?
fn path_exists(edges: &FxHashMap<Label, Vec<Label>>, start: &Label, goal: &Label) -> bool {
    if start == goal {
        return true;
    }
    let mut visited: FxHashSet<Label> = FxHashSet::default();
    let mut stack = vec![start.clone()];
    while let Some(node) = stack.pop() {
        if &node == goal {
            return true;
        }
        if !visited.insert(node.clone()) {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}
