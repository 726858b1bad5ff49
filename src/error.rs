//! The error taxonomy (§7): a small family of typed errors rather than one
//! monolithic enum, because the three kinds are handled completely
//! differently by their callers — `ConfigError` aborts the build,
//! `ActionError` poisons one target, `CacheError` never leaves the cache
//! layer as a hard error.

use std::path::PathBuf;

use crate::label::Label;

/// Fatal, detected-once-and-abort configuration errors (§7: "Configuration
/// errors").
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid label `{text}`: {source}")]
    InvalidLabel {
        text: String,
        #[source]
        source: crate::label::LabelParseError,
    },
    #[error("package `{0}` already registered")]
    DuplicatePackage(String),
    #[error("target `{0}` already registered in its package")]
    DuplicateTarget(Label),
    #[error("target `{from}` depends on `{to}`, which is not visible to it")]
    VisibilityViolation { from: Label, to: Label },
    #[error("dependency cycle detected, starting from `{0}`")]
    DependencyCycle(Label),
    #[error("target `{label}` declares output `{path}` which escapes its out-directory")]
    OutputEscapesOutDir { label: Label, path: PathBuf },
}

/// Target-local action failures (§7: "Action errors"). These poison the
/// target (and, under keep-going, its reverse dependencies) but never abort
/// the whole build by themselves.
#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("action for `{label}` exited with status {status}\n--- stderr (tail) ---\n{stderr_tail}")]
    NonZeroExit {
        label: Label,
        status: i32,
        stderr_tail: String,
    },
    #[error("action for `{label}` did not produce declared output `{path}`")]
    MissingOutput { label: Label, path: PathBuf },
    #[error("output `{path}` of `{label}` failed hash verification")]
    OutputHashMismatch { label: Label, path: PathBuf },
}

/// Non-fatal cache-layer failures (§7: "Cache errors"). Every call site that
/// can produce one must convert it to a miss (Retrieve) or a dropped,
/// logged store (Store); it must never propagate as a build failure. Cache
/// backends construct these to classify a failure before logging it, never
/// to return it.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("io error talking to cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache payload corrupt: {0}")]
    Corrupt(String),
    #[error("cache backend returned an unexpected response: {0}")]
    BackendError(String),
}
