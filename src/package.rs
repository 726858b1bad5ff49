//! `Package`: a named collection of targets parsed from one BUILD source
//! (§3).

use indexmap::IndexMap;

use crate::target::BuildTarget;

/// Invariants: at most one target per (package, name); package identity is
/// its path. Enforced by [`Package::add_target`] and by
/// [`crate::graph::BuildGraph::add_package`] respectively.
///
/// Targets are kept in an [`IndexMap`] rather than a hash map so that
/// [`Package::targets`] enumerates them in registration order — the order
/// the Parse collaborator declared them in a BUILD file — instead of
/// whatever order a hash happens to fall in, which matters wherever that
/// enumeration feeds something that should be deterministic across runs
/// (progress output, `plz query` listings).
pub struct Package {
    path: String,
    subrepo: Option<String>,
    targets: IndexMap<String, std::sync::Arc<BuildTarget>>,
}

#[derive(thiserror::Error, Debug)]
#[error("target `{0}` already registered in package `{1}`")]
pub struct DuplicateTargetInPackage(pub String, pub String);

impl Package {
    pub fn new(path: impl Into<String>, subrepo: Option<String>) -> Package {
        Package {
            path: path.into(),
            subrepo,
            targets: IndexMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subrepo(&self) -> Option<&str> {
        self.subrepo.as_deref()
    }

    pub fn add_target(
        &mut self,
        target: std::sync::Arc<BuildTarget>,
    ) -> Result<(), DuplicateTargetInPackage> {
        let name = target.label().name().to_string();
        if self.targets.contains_key(&name) {
            return Err(DuplicateTargetInPackage(name, self.path.clone()));
        }
        self.targets.insert(name, target);
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<&std::sync::Arc<BuildTarget>> {
        self.targets.get(name)
    }

    pub fn targets(&self) -> impl Iterator<Item = &std::sync::Arc<BuildTarget>> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;

    #[test]
    fn add_target_rejects_duplicate_name() {
        let mut pkg = Package::new("a/b", None);
        let t1 = std::sync::Arc::new(BuildTarget::new(
            Label::parse("//a/b:x", None).unwrap(),
            "true",
        ));
        let t2 = std::sync::Arc::new(BuildTarget::new(
            Label::parse("//a/b:x", None).unwrap(),
            "false",
        ));
        pkg.add_target(t1).unwrap();
        assert!(pkg.add_target(t2).is_err());
    }

    #[test]
    fn lookup_by_name_finds_registered_target() {
        let mut pkg = Package::new("a/b", None);
        let t1 = std::sync::Arc::new(BuildTarget::new(
            Label::parse("//a/b:x", None).unwrap(),
            "true",
        ));
        pkg.add_target(t1).unwrap();
        assert!(pkg.target("x").is_some());
        assert!(pkg.target("y").is_none());
    }
}
