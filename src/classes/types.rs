//! Class Types
//!
//! Core types for the class system: the class record itself, qualified
//! class references, scope, and name canonicalization.

use std::collections::BTreeSet;
use std::fmt;

/// Maximum accepted length for class and variable names. Longer names are
/// rejected with a warning and never stored.
pub const MAX_NAME_LEN: usize = 1024;

/// The default namespace. Classes and variables without an explicit
/// namespace belong here.
pub const NAMESPACE_DEFAULT: &str = "default";

/// Visibility of a soft class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextScope {
    /// Visible for the rest of the process (or until removed).
    Namespace,
    /// Local to the defining bundle frame; destroyed on frame pop.
    Bundle,
}

impl Default for ContextScope {
    fn default() -> Self {
        ContextScope::Namespace
    }
}

/// Canonicalize a class name: ASCII characters are lowercased and every
/// non-alphanumeric byte becomes `_`. Idempotent.
pub fn canonify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Split a comma-separated tag string into a tag set. Empty segments are
/// dropped, so `""` yields the empty set.
pub fn tags_from_str(tags: &str) -> BTreeSet<String> {
    tags.split(',')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// A possibly namespace-qualified class name, as written in policy:
/// `name` or `ns:name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub ns: Option<String>,
    pub name: String,
}

impl ClassRef {
    pub fn new(ns: Option<&str>, name: &str) -> Self {
        Self { ns: ns.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Parse `ns:name` or bare `name`.
    pub fn parse(expr: &str) -> Self {
        match expr.split_once(':') {
            Some((ns, name)) => Self { ns: Some(ns.to_string()), name: name.to_string() },
            None => Self { ns: None, name: expr.to_string() },
        }
    }

    pub fn is_qualified(&self) -> bool {
        self.ns.is_some()
    }

    pub fn qualify(&mut self, ns: &str) {
        self.ns = Some(ns.to_string());
    }

    /// Effective namespace: the default namespace when unqualified.
    pub fn namespace(&self) -> &str {
        self.ns.as_deref().unwrap_or(NAMESPACE_DEFAULT)
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", qualified_name(self.ns.as_deref(), &self.name))
    }
}

/// Render the qualified form of a class name. The default namespace is
/// elided, so hard classes and default-namespace soft classes print bare.
pub fn qualified_name(ns: Option<&str>, name: &str) -> String {
    match ns {
        Some(ns) if ns != NAMESPACE_DEFAULT => format!("{}:{}", ns, name),
        _ => name.to_string(),
    }
}

/// A class: a named boolean fact with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Class {
    pub ns: Option<String>,
    /// Canonical name (see [`canonify`]).
    pub name: String,
    /// Soft classes are derived by policy; hard classes are
    /// process-provided facts and always live in the default namespace.
    pub is_soft: bool,
    pub scope: ContextScope,
    /// Tag set; always present, possibly empty.
    pub tags: BTreeSet<String>,
    pub comment: Option<String>,
}

impl Class {
    /// The qualified `ns:name` form used in expressions and reports.
    pub fn expr(&self) -> String {
        qualified_name(self.ns.as_deref(), &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonify() {
        assert_eq!(canonify("simple"), "simple");
        assert_eq!(canonify("Has-Dashes.and.dots"), "has_dashes_and_dots");
        assert_eq!(canonify("UPPER case"), "upper_case");
    }

    #[test]
    fn test_canonify_idempotent() {
        let once = canonify("A strange!Name");
        assert_eq!(canonify(&once), once);
    }

    #[test]
    fn test_tags_from_str() {
        let tags = tags_from_str("a,b,c");
        assert_eq!(tags.len(), 3);
        assert!(tags.contains("b"));

        assert!(tags_from_str("").is_empty());
        assert_eq!(tags_from_str("x,,y").len(), 2);
    }

    #[test]
    fn test_class_ref_parse() {
        let bare = ClassRef::parse("linux");
        assert_eq!(bare.ns, None);
        assert_eq!(bare.name, "linux");
        assert!(!bare.is_qualified());
        assert_eq!(bare.namespace(), "default");

        let qualified = ClassRef::parse("myns:webserver");
        assert_eq!(qualified.ns.as_deref(), Some("myns"));
        assert_eq!(qualified.name, "webserver");
        assert!(qualified.is_qualified());
    }

    #[test]
    fn test_qualified_name_elides_default() {
        assert_eq!(qualified_name(None, "c"), "c");
        assert_eq!(qualified_name(Some("default"), "c"), "c");
        assert_eq!(qualified_name(Some("ops"), "c"), "ops:c");
    }
}
