//! Builds the sanitised environment a build or test action runs under
//! (§6: "Process env propagation").
//!
//! The action never inherits the invoking process's full environment.
//! Instead it gets `HOME`/`PATH`, the handful of Please-specific variables
//! the action needs to find its inputs and outputs, and whatever the
//! configuration explicitly allow-lists.

use std::collections::BTreeMap;
use std::path::Path;

/// The canonical Please-specific variables every action can rely on.
#[derive(Debug, Clone)]
pub struct ActionEnvInputs<'a> {
    pub pkg: &'a str,
    pub name: &'a str,
    pub outs: &'a [String],
    pub srcs: &'a [String],
}

/// Builds the environment map for an action, starting from `home`/`path`,
/// layering in the Please-specific variables, then the caller's allow-listed
/// passthrough variables last (so a misconfigured allow-list can't shadow
/// the canonical ones).
pub fn build_action_env(
    home: &Path,
    path_var: &str,
    inputs: &ActionEnvInputs<'_>,
    passthrough: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("HOME".to_string(), home.display().to_string());
    env.insert("PATH".to_string(), path_var.to_string());
    env.insert("PKG".to_string(), inputs.pkg.to_string());
    env.insert("NAME".to_string(), inputs.name.to_string());
    env.insert("OUTS".to_string(), inputs.outs.join(" "));
    env.insert("SRCS".to_string(), inputs.srcs.join(" "));
    for (k, v) in passthrough {
        env.entry(k.clone()).or_insert_with(|| v.clone());
    }
    env
}
