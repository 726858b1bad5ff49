//! Labels: immutable, canonical references to build targets.
//!
//! A label identifies a target the way a fully-qualified path identifies a
//! file. Two labels are equal iff they are structurally equal — there is no
//! normalisation step at comparison time, so whatever produces a `Label`
//! (almost always [`Label::parse`]) is responsible for canonical form.

use std::fmt;

/// A package path, relative to the repository (or subrepo) root.
///
/// `Root` is the special empty path `//`: the package at the repository
/// root itself. `Wildcard` represents the `...` suffix meaning "this
/// subtree", used by the CLI wrapper to expand `//pkg/...:all`-style
/// arguments before they ever reach the graph; the core only needs to be
/// able to parse and display it, not expand it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum PackagePath {
    Root,
    Path(String),
    Wildcard(Option<String>),
}

impl PackagePath {
    pub fn as_str_prefix(&self) -> &str {
        match self {
            PackagePath::Root => "",
            PackagePath::Path(p) => p.as_str(),
            PackagePath::Wildcard(Some(p)) => p.as_str(),
            PackagePath::Wildcard(None) => "",
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, PackagePath::Wildcard(_))
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackagePath::Root => Ok(()),
            PackagePath::Path(p) => write!(f, "{p}"),
            PackagePath::Wildcard(Some(p)) => write!(f, "{p}/..."),
            PackagePath::Wildcard(None) => write!(f, "..."),
        }
    }
}

/// A canonical reference to a single buildable target.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Label {
    subrepo: Option<String>,
    package: PackagePath,
    name: String,
}

/// Why a textual label failed to parse. Surfaced to callers as a
/// [`crate::error::ConfigError::InvalidLabel`].
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum LabelParseError {
    #[error("label `{0}` is empty")]
    Empty(String),
    #[error("relative label `{0}` used with no current package")]
    NoCurrentPackage(String),
    #[error("label `{0}` has no `:name` component")]
    MissingName(String),
    #[error("label `{0}` has an empty target name")]
    EmptyName(String),
    #[error("label `{0}` contains an invalid character in `{1}`")]
    InvalidChar(String, String),
    #[error("label `{0}` has a malformed subrepo prefix")]
    MalformedSubrepo(String),
}

impl Label {
    pub fn new(subrepo: Option<String>, package: PackagePath, name: String) -> Label {
        Label {
            subrepo,
            package,
            name,
        }
    }

    /// Parses a label's textual form, resolving a leading `:name` against
    /// `current_package` (the package the label was written in). Accepted
    /// forms:
    /// - `//pkg/sub:name` — absolute, in the main repo.
    /// - `:name` — relative to `current_package`.
    /// - `///subrepo//pkg:name` — absolute, in a named subrepo.
    pub fn parse(text: &str, current_package: Option<&str>) -> Result<Label, LabelParseError> {
        if text.is_empty() {
            return Err(LabelParseError::Empty(text.to_string()));
        }

        if let Some(rest) = text.strip_prefix(":") {
            let current = current_package
                .ok_or_else(|| LabelParseError::NoCurrentPackage(text.to_string()))?;
            let name = validate_name(text, rest)?;
            return Ok(Label {
                subrepo: None,
                package: parse_package_path(current),
                name,
            });
        }

        if let Some(rest) = text.strip_prefix("///") {
            let (subrepo, pkg_and_name) = rest
                .split_once("//")
                .ok_or_else(|| LabelParseError::MalformedSubrepo(text.to_string()))?;
            if subrepo.is_empty() {
                return Err(LabelParseError::MalformedSubrepo(text.to_string()));
            }
            let (pkg, name) = split_package_and_name(text, pkg_and_name)?;
            return Ok(Label {
                subrepo: Some(subrepo.to_string()),
                package: parse_package_path(pkg),
                name,
            });
        }

        if let Some(rest) = text.strip_prefix("//") {
            let (pkg, name) = split_package_and_name(text, rest)?;
            return Ok(Label {
                subrepo: None,
                package: parse_package_path(pkg),
                name,
            });
        }

        Err(LabelParseError::MissingName(text.to_string()))
    }

    pub fn subrepo(&self) -> Option<&str> {
        self.subrepo.as_deref()
    }

    pub fn package(&self) -> &PackagePath {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The label with its name stripped, usable as a map key / directory
    /// path component for "all targets in this package".
    pub fn package_key(&self) -> String {
        match &self.subrepo {
            Some(sr) => format!("///{sr}//{}", self.package),
            None => format!("//{}", self.package),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subrepo {
            Some(sr) => write!(f, "///{sr}//{}:{}", self.package, self.name),
            None => write!(f, "//{}:{}", self.package, self.name),
        }
    }
}

fn split_package_and_name<'a>(
    whole: &str,
    rest: &'a str,
) -> Result<(&'a str, String), LabelParseError> {
    let idx = rest
        .rfind(':')
        .ok_or_else(|| LabelParseError::MissingName(whole.to_string()))?;
    let (pkg, name_with_colon) = rest.split_at(idx);
    let name = validate_name(whole, &name_with_colon[1..])?;
    Ok((pkg, name))
}

fn validate_name(whole: &str, name: &str) -> Result<String, LabelParseError> {
    if name.is_empty() {
        return Err(LabelParseError::EmptyName(whole.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-' | '@' | '#'))
    {
        return Err(LabelParseError::InvalidChar(
            whole.to_string(),
            name.to_string(),
        ));
    }
    Ok(name.to_string())
}

fn parse_package_path(pkg: &str) -> PackagePath {
    let pkg = pkg.replace('…', "...");
    if pkg.is_empty() {
        return PackagePath::Root;
    }
    if pkg == "..." {
        return PackagePath::Wildcard(None);
    }
    if let Some(prefix) = pkg.strip_suffix("/...") {
        return PackagePath::Wildcard(Some(prefix.to_string()));
    }
    PackagePath::Path(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_label() {
        let l = Label::parse("//foo/bar:baz", None).unwrap();
        assert_eq!(l.package(), &PackagePath::Path("foo/bar".to_string()));
        assert_eq!(l.name(), "baz");
        assert_eq!(l.subrepo(), None);
    }

    #[test]
    fn parses_root_package_label() {
        let l = Label::parse("//:baz", None).unwrap();
        assert_eq!(l.package(), &PackagePath::Root);
        assert_eq!(l.to_string(), "//:baz");
    }

    #[test]
    fn parses_relative_label() {
        let l = Label::parse(":baz", Some("foo/bar")).unwrap();
        assert_eq!(l.package(), &PackagePath::Path("foo/bar".to_string()));
        assert_eq!(l.name(), "baz");
    }

    #[test]
    fn relative_label_without_current_package_fails() {
        assert!(matches!(
            Label::parse(":baz", None),
            Err(LabelParseError::NoCurrentPackage(_))
        ));
    }

    #[test]
    fn parses_subrepo_label() {
        let l = Label::parse("///third_party//foo:bar", None).unwrap();
        assert_eq!(l.subrepo(), Some("third_party"));
        assert_eq!(l.package(), &PackagePath::Path("foo".to_string()));
        assert_eq!(l.name(), "bar");
        assert_eq!(l.to_string(), "///third_party//foo:bar");
    }

    #[test]
    fn parses_wildcard_subtree() {
        let l = Label::parse("//foo/...:all", None).unwrap();
        assert_eq!(
            l.package(),
            &PackagePath::Wildcard(Some("foo".to_string()))
        );
    }

    #[test]
    fn parses_bare_wildcard() {
        let l = Label::parse("//...:all", None).unwrap();
        assert_eq!(l.package(), &PackagePath::Wildcard(None));
    }

    #[test]
    fn accepts_unicode_ellipsis_as_wildcard_alias() {
        let l = Label::parse("//foo/…:all", None).unwrap();
        assert_eq!(
            l.package(),
            &PackagePath::Wildcard(Some("foo".to_string()))
        );
    }

    #[test]
    fn rejects_missing_name() {
        assert!(matches!(
            Label::parse("//foo/bar", None),
            Err(LabelParseError::MissingName(_))
        ));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            Label::parse("//foo:", None),
            Err(LabelParseError::EmptyName(_))
        ));
    }

    #[test]
    fn rejects_invalid_name_chars() {
        assert!(matches!(
            Label::parse("//foo:bar baz", None),
            Err(LabelParseError::InvalidChar(_, _))
        ));
    }

    #[test]
    fn equality_is_structural() {
        let a = Label::parse("//foo:bar", None).unwrap();
        let b = Label::parse("//foo:bar", None).unwrap();
        let c = Label::parse("//foo:baz", None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn package_key_groups_targets_in_same_package() {
        let a = Label::parse("//foo/bar:a", None).unwrap();
        let b = Label::parse("//foo/bar:b", None).unwrap();
        assert_eq!(a.package_key(), b.package_key());
    }
}
