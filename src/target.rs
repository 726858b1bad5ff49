//! `BuildTarget`: the node entity of the build graph (§3).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::label::Label;

/// The ordered sequence of states a target's build can be in (§3). Every
/// transition except into `Failed` is monotonic: a target never regresses.
/// `Failed` is terminal and can be reached from anywhere.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum TargetState {
    Inactive = 0,
    Semiactive = 1,
    Active = 2,
    Pending = 3,
    Parsing = 4,
    Parsed = 5,
    PendingBuild = 6,
    Building = 7,
    Built = 8,
    PendingTest = 9,
    Testing = 10,
    Tested = 11,
    Failed = 12,
}

impl TargetState {
    fn from_u8(v: u8) -> TargetState {
        match v {
            0 => TargetState::Inactive,
            1 => TargetState::Semiactive,
            2 => TargetState::Active,
            3 => TargetState::Pending,
            4 => TargetState::Parsing,
            5 => TargetState::Parsed,
            6 => TargetState::PendingBuild,
            7 => TargetState::Building,
            8 => TargetState::Built,
            9 => TargetState::PendingTest,
            10 => TargetState::Testing,
            11 => TargetState::Tested,
            _ => TargetState::Failed,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, TargetState::Failed)
    }
}

/// Lock-free-to-read, mutex-serialised-to-write state cell. Reads never
/// block; writes go through [`crate::graph::BuildGraph`]'s single mutex so
/// the "writes are serialised by a single graph mutex" guarantee (§4.1)
/// holds even though the field itself is an atomic for cheap reads.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    fn new(initial: TargetState) -> StateCell {
        StateCell(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> TargetState {
        TargetState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `new` unconditionally. Callers must already hold the graph
    /// mutex; this is not synchronisation on its own, only the fast-read
    /// half of it.
    pub(crate) fn set(&self, new: TargetState) {
        self.0.store(new as u8, Ordering::Release);
    }
}

/// A dependency edge, optionally tagged with the named group it was
/// declared under (e.g. `srcs`, `tools`) — §3: "a set of dependency labels
/// (each optionally with a named group)".
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Dependency {
    pub label: Label,
    pub group: Option<String>,
}

impl Dependency {
    pub fn new(label: Label, group: Option<String>) -> Dependency {
        Dependency { label, group }
    }
}

/// Boolean attributes that change how a target is scheduled and cached
/// (§3: "flags {binary, test, container, needs-transitive-deps,
/// no-test-output, …}").
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TargetFlags {
    pub binary: bool,
    pub test: bool,
    pub container: bool,
    pub needs_transitive_deps: bool,
    pub no_test_output: bool,
}

/// A post-build callback: inspects captured stdout from an action (whether
/// it ran in-process or was served from cache) and may contribute
/// additional outputs or dependencies discovered at that point (§4.4).
pub type PostBuildFn = std::sync::Arc<dyn Fn(&[u8]) -> PostBuildEffects + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct PostBuildEffects {
    pub extra_outputs: Vec<PathBuf>,
    pub extra_deps: Vec<Dependency>,
}

/// The node entity of the build graph (§3).
pub struct BuildTarget {
    label: Label,
    pub srcs: Vec<PathBuf>,
    pub deps: Vec<Dependency>,
    pub declared_outputs: Vec<PathBuf>,
    pub optional_outputs: Vec<PathBuf>,
    pub test_outputs: Vec<PathBuf>,
    pub post_build_stdout_file: Option<PathBuf>,
    pub build_command: String,
    pub test_command: Option<String>,
    pub tool_inputs: Vec<PathBuf>,
    pub visibility: Visibility,
    pub labels: BTreeSet<String>,
    pub licences: Vec<String>,
    pub hash_verification_keys: Vec<String>,
    pub flags: TargetFlags,
    pub env: Vec<(String, String)>,
    pub post_build: Option<PostBuildFn>,
    state: StateCell,
    /// Outputs discovered dynamically by a post-build callback. Registered
    /// by the owning worker only, hence the separate lock from `state`
    /// (readers of `state` must not block on this).
    dynamic_outputs: Mutex<Vec<PathBuf>>,
}

/// Which packages may depend on a target. `Public` and `Private` are the
/// common cases; `Restricted` lists exact package-path prefixes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Visibility {
    Public,
    Private,
    Restricted(Vec<String>),
}

impl Visibility {
    /// Whether a target in `from_package` may depend on a target that
    /// declares this visibility and whose own package is `own_package`.
    pub fn allows(&self, own_package: &str, from_package: &str) -> bool {
        if own_package == from_package {
            return true;
        }
        match self {
            Visibility::Public => true,
            Visibility::Private => false,
            Visibility::Restricted(prefixes) => prefixes.iter().any(|p| {
                p == from_package || from_package.starts_with(&format!("{p}/"))
            }),
        }
    }
}

impl BuildTarget {
    pub fn new(label: Label, build_command: impl Into<String>) -> BuildTarget {
        BuildTarget {
            label,
            srcs: Vec::new(),
            deps: Vec::new(),
            declared_outputs: Vec::new(),
            optional_outputs: Vec::new(),
            test_outputs: Vec::new(),
            post_build_stdout_file: None,
            build_command: build_command.into(),
            test_command: None,
            tool_inputs: Vec::new(),
            visibility: Visibility::Private,
            labels: BTreeSet::new(),
            licences: Vec::new(),
            hash_verification_keys: Vec::new(),
            flags: TargetFlags::default(),
            env: Vec::new(),
            post_build: None,
            state: StateCell::new(TargetState::Inactive),
            dynamic_outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn state(&self) -> TargetState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn is_test(&self) -> bool {
        self.flags.test
    }

    pub fn is_binary(&self) -> bool {
        self.flags.binary
    }

    /// All outputs a retrieval or build must account for: declared plus
    /// whatever a post-build callback has registered so far.
    pub fn all_outputs(&self) -> Vec<PathBuf> {
        let mut outs = self.declared_outputs.clone();
        outs.extend(self.dynamic_outputs.lock().unwrap().iter().cloned());
        outs
    }

    pub fn add_dynamic_outputs(&self, extra: &[PathBuf]) {
        self.dynamic_outputs.lock().unwrap().extend(extra.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        Label::parse(s, None).unwrap()
    }

    #[test]
    fn state_starts_inactive() {
        let t = BuildTarget::new(label("//a:b"), "true");
        assert_eq!(t.state(), TargetState::Inactive);
    }

    #[test]
    fn state_cell_set_then_get_roundtrips() {
        let t = BuildTarget::new(label("//a:b"), "true");
        t.state_cell().set(TargetState::Built);
        assert_eq!(t.state(), TargetState::Built);
    }

    #[test]
    fn state_ordering_is_monotonic_by_ordinal() {
        assert!(TargetState::Parsed < TargetState::PendingBuild);
        assert!(TargetState::Building < TargetState::Built);
        assert!(TargetState::Built < TargetState::Failed);
    }

    #[test]
    fn public_visibility_allows_any_package() {
        assert!(Visibility::Public.allows("//a", "//z"));
    }

    #[test]
    fn private_visibility_only_allows_same_package() {
        assert!(Visibility::Private.allows("//a", "//a"));
        assert!(!Visibility::Private.allows("//a", "//z"));
    }

    #[test]
    fn restricted_visibility_allows_listed_prefixes_and_subpackages() {
        let v = Visibility::Restricted(vec!["//a/b".to_string()]);
        assert!(v.allows("//a/b", "//a/b"));
        assert!(v.allows("//a/b", "//a/b/child"));
        assert!(!v.allows("//a/b", "//other"));
    }

    #[test]
    fn dynamic_outputs_are_appended_to_declared() {
        let mut t = BuildTarget::new(label("//a:b"), "true");
        t.declared_outputs.push(PathBuf::from("out.txt"));
        t.add_dynamic_outputs(&[PathBuf::from("extra.txt")]);
        assert_eq!(
            t.all_outputs(),
            vec![PathBuf::from("out.txt"), PathBuf::from("extra.txt")]
        );
    }
}
