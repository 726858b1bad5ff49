//! The configuration snapshot the core reads from (§6: "Invocation
//! contract"). Parsing the on-disk `.plzconfig` is out of scope; this is
//! the shape the CLI wrapper is expected to have already produced by the
//! time it calls into this crate.

use std::collections::BTreeSet;
use std::path::PathBuf;

use please_util::HashAlgorithm;
use serde::{Deserialize, Serialize};

/// Priority-ordered cache backend configuration. Backends earlier in a
/// `Vec<CacheBackendConfig>` are higher priority (checked first on
/// Retrieve, back-filled by later hits); see §4.6.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CacheBackendConfig {
    Directory {
        root: PathBuf,
        compress: bool,
        high_water_mark: Option<u64>,
        low_water_mark: Option<u64>,
    },
    Http {
        root_url: String,
        max_concurrent_requests: usize,
        max_retries: u32,
    },
    Command {
        store_command: String,
        retrieve_command: String,
    },
    RemoteExecution {
        endpoint: String,
        instance_name: String,
        read_only: bool,
    },
}

/// The subset of `.plzconfig` this core actually consumes: cache, hashing,
/// and concurrency. Every other field of a real Please configuration is
/// the CLI wrapper's business, not ours.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    pub cache_backends: Vec<CacheBackendConfig>,
    pub hash_algorithm: HashAlgorithm,
    pub num_build_threads: usize,
    pub num_cache_store_threads: usize,
    pub keep_going: bool,
    pub hash_verification: bool,
    pub include_labels: BTreeSet<String>,
    pub exclude_labels: BTreeSet<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            cache_backends: Vec::new(),
            hash_algorithm: HashAlgorithm::Sha256,
            num_build_threads: default_num_build_threads(),
            num_cache_store_threads: 2,
            keep_going: false,
            hash_verification: false,
            include_labels: BTreeSet::new(),
            exclude_labels: BTreeSet::new(),
        }
    }
}

/// Default worker count per §4.3: logical CPU count + 2.
pub fn default_num_build_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        + 2
}

impl Configuration {
    /// Builds a `Configuration` from the JSON form the CLI wrapper
    /// serialises its parsed `.plzconfig` into before handing it to this
    /// crate.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Configuration> {
        serde_json::from_slice(bytes)
    }

    /// The inverse of [`Self::from_json`]; chiefly useful for a CLI wrapper
    /// persisting a resolved configuration (e.g. for `plz query config`).
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Whether a target whose tag set is `labels` should be included in
    /// this build, given the configured include/exclude filters. Exclude
    /// always wins over include.
    pub fn label_filter_allows(&self, labels: &BTreeSet<String>) -> bool {
        if !self.exclude_labels.is_empty() && labels.intersection(&self.exclude_labels).next().is_some() {
            return false;
        }
        if self.include_labels.is_empty() {
            return true;
        }
        labels.intersection(&self.include_labels).next().is_some()
    }
}
