//! Content-addressed fingerprinting (§4.2): a rule hash derived from the
//! action itself, and an input hash — the actual cache key — derived from
//! the rule hash, file contents, and the transitive closure of dependency
//! fingerprints.

use std::io;
use std::path::Path;

use please_util::{Digest256, HashAlgorithm};
use rustc_hash::FxHashMap;

use crate::graph::BuildGraph;
use crate::label::Label;
use crate::target::BuildTarget;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub rule_hash: Digest256,
    pub input_hash: Digest256,
}

impl Fingerprint {
    /// The input hash is the cache key (§4.2: "The Input hash is the cache
    /// key").
    pub fn cache_key(&self) -> &Digest256 {
        &self.input_hash
    }
}

/// H(command ∥ command_env ∥ declared outputs ∥ tool list ∥ attributes that
/// influence the action). Independent of file contents and dependencies.
pub fn rule_hash(algo: HashAlgorithm, target: &BuildTarget) -> Digest256 {
    let mut parts: Vec<Vec<u8>> = Vec::new();
    parts.push(target.build_command.as_bytes().to_vec());

    let mut env: Vec<(&str, &str)> = target
        .env
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    env.sort();
    for (k, v) in env {
        parts.push(format!("{k}={v}").into_bytes());
    }

    let mut outs: Vec<String> = target
        .declared_outputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    outs.sort();
    parts.extend(outs.into_iter().map(String::into_bytes));

    let mut tools: Vec<String> = target
        .tool_inputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    tools.sort();
    parts.extend(tools.into_iter().map(String::into_bytes));

    parts.push(format!("{:?}", target.flags).into_bytes());

    let mut licences = target.licences.clone();
    licences.sort();
    parts.extend(licences.into_iter().map(String::into_bytes));

    algo.hash_parts(parts.iter().map(|v| v.as_slice()))
}

/// Recursively computes the input hash for `label`, memoising every
/// fingerprint it visits in `memo` so a diamond dependency is only hashed
/// once per call.
pub fn compute_fingerprint(
    algo: HashAlgorithm,
    repo_root: &Path,
    graph: &BuildGraph,
    label: &Label,
    memo: &mut FxHashMap<Label, Fingerprint>,
) -> io::Result<Fingerprint> {
    if let Some(fp) = memo.get(label) {
        return Ok(fp.clone());
    }

    let target = graph.target_or_die(label);
    let rule = rule_hash(algo, &target);

    let mut parts: Vec<Vec<u8>> = vec![rule.as_bytes().to_vec()];

    let mut srcs = target.srcs.clone();
    srcs.sort();
    for src in &srcs {
        let abs = repo_root.join(src);
        let content_hash = algo.hash_file(&abs)?;
        parts.push(content_hash.as_bytes().to_vec());
    }

    let mut deps = target.deps.clone();
    deps.sort_by(|a, b| a.label.cmp(&b.label));
    for dep in &deps {
        let dep_fp = compute_fingerprint(algo, repo_root, graph, &dep.label, memo)?;
        parts.push(dep_fp.input_hash.as_bytes().to_vec());
    }

    let input_hash = algo.hash_parts(parts.iter().map(|v| v.as_slice()));
    let fp = Fingerprint { rule_hash: rule, input_hash };
    memo.insert(label.clone(), fp.clone());
    Ok(fp)
}
