//! The `Process` collaborator: concrete subprocess execution and sandboxing
//! are out of scope (§1); this is the seam the build action calls through.

use std::collections::BTreeMap;
use std::path::Path;

use crate::label::Label;

pub struct ProcessRequest<'a> {
    pub label: &'a Label,
    pub command: &'a str,
    pub working_dir: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

/// The outcome of running a target's build or test command. `status` is the
/// raw process exit code; a killed-by-signal process is represented by
/// whatever negative/sentinel convention the collaborator's implementation
/// chooses, since this core only ever compares it against zero.
pub struct ProcessOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a target's action. Implementations decide sandboxing, timeouts, and
/// resource limits (§4.3: "there are no per-task timeouts at the scheduler
/// layer; timeouts belong to the subprocess collaborator").
pub trait Process: Send + Sync {
    fn run(&self, request: ProcessRequest<'_>) -> std::io::Result<ProcessOutput>;
}
