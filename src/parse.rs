//! The `Parse` collaborator: the BUILD-file parser/interpreter is out of
//! scope (§1); this is the seam Parse tasks call through to obtain a
//! package's targets.

use crate::target::BuildTarget;

#[derive(thiserror::Error, Debug)]
#[error("failed to parse package `{package_path}`: {message}")]
pub struct ParseError {
    pub package_path: String,
    pub message: String,
}

/// A freshly parsed package: its targets, not yet registered into the
/// graph. The core owns registration (and posting recursive Parse tasks
/// for any newly discovered dependency labels) so the collaborator doesn't
/// need to know about graph internals at all.
pub struct ParsedPackage {
    pub path: String,
    pub subrepo: Option<String>,
    pub targets: Vec<BuildTarget>,
}

/// Parses (or otherwise produces) the package at `package_path`, fully
/// populated with its targets, their declared dependency labels, and their
/// attributes (§4.3: "Parse / SubincludeParse").
pub trait Parse: Send + Sync {
    fn parse_package(&self, package_path: &str, subrepo: Option<&str>) -> Result<ParsedPackage, ParseError>;
}
