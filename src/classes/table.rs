//! Class Table
//!
//! An insertion-ordered table of classes, keyed by qualified name. The
//! evaluation context keeps one global table plus one per bundle frame.
//! Enumeration order is insertion order, which makes `find_match`
//! deterministic.

use indexmap::IndexMap;
use std::collections::BTreeSet;

use crate::classes::types::{canonify, qualified_name, Class, ContextScope, MAX_NAME_LEN};

#[derive(Debug, Default)]
pub struct ClassTable {
    classes: IndexMap<String, Class>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a class. The name is canonicalized first. Returns false
    /// without inserting when the name exceeds [`MAX_NAME_LEN`], when it
    /// canonicalizes to the empty string, or when an identical
    /// (ns, name, scope) entry already exists. An entry with the same
    /// name but a different scope is replaced.
    pub fn put(
        &mut self,
        ns: Option<&str>,
        name: &str,
        is_soft: bool,
        scope: ContextScope,
        tags: BTreeSet<String>,
        comment: Option<&str>,
    ) -> bool {
        if name.len() > MAX_NAME_LEN {
            log::warn!(
                "Skipping class '{}': name is longer than {} characters",
                name,
                MAX_NAME_LEN
            );
            return false;
        }

        let canonical = canonify(name.trim());
        if canonical.is_empty() {
            return false;
        }

        let key = qualified_name(ns, &canonical);
        if let Some(existing) = self.classes.get(&key) {
            if existing.scope == scope {
                return false;
            }
        }

        self.classes.insert(
            key,
            Class {
                ns: ns.map(|s| s.to_string()),
                name: canonical,
                is_soft,
                scope,
                tags,
                comment: comment.map(|s| s.to_string()),
            },
        );
        true
    }

    pub fn get(&self, ns: Option<&str>, name: &str) -> Option<&Class> {
        self.classes.get(&qualified_name(ns, &canonify(name)))
    }

    pub fn get_mut(&mut self, ns: Option<&str>, name: &str) -> Option<&mut Class> {
        self.classes.get_mut(&qualified_name(ns, &canonify(name)))
    }

    pub fn remove(&mut self, ns: Option<&str>, name: &str) -> bool {
        self.classes
            .shift_remove(&qualified_name(ns, &canonify(name)))
            .is_some()
    }

    pub fn clear(&mut self) {
        self.classes.clear();
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// First class whose qualified name matches `regex` (anchored full
    /// match), in insertion order. A pattern that fails to compile falls
    /// back to exact string comparison.
    pub fn find_match(&self, regex: &str) -> Option<&Class> {
        let compiled = regex_lite::Regex::new(&format!("^(?:{})$", regex)).ok();
        self.classes.values().find(|cls| {
            let expr = cls.expr();
            match &compiled {
                Some(re) => re.is_match(&expr),
                None => expr == regex,
            }
        })
    }

    /// Iterate classes filtered by namespace and hard/soft inclusion.
    /// `ns == None` matches every namespace.
    pub fn iter_filtered<'a>(
        &'a self,
        ns: Option<&'a str>,
        include_hard: bool,
        include_soft: bool,
    ) -> impl Iterator<Item = &'a Class> {
        self.classes.values().filter(move |cls| {
            if let Some(want) = ns {
                if cls.ns.as_deref().unwrap_or("default") != want {
                    return false;
                }
            }
            (cls.is_soft && include_soft) || (!cls.is_soft && include_hard)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::types::tags_from_str;

    fn put_soft(table: &mut ClassTable, ns: Option<&str>, name: &str) -> bool {
        table.put(ns, name, true, ContextScope::Namespace, BTreeSet::new(), None)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut table = ClassTable::new();
        assert!(put_soft(&mut table, None, "alpha"));
        let cls = table.get(None, "alpha").unwrap();
        assert_eq!(cls.name, "alpha");
        assert!(cls.is_soft);
    }

    #[test]
    fn test_put_canonifies() {
        let mut table = ClassTable::new();
        assert!(put_soft(&mut table, None, "My-Class.Name"));
        assert!(table.get(None, "my_class_name").is_some());
        // get canonifies the query as well
        assert!(table.get(None, "My-Class.Name").is_some());
    }

    #[test]
    fn test_put_identical_is_idempotent() {
        let mut table = ClassTable::new();
        assert!(put_soft(&mut table, None, "repeat"));
        assert!(!put_soft(&mut table, None, "repeat"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_put_length_cap() {
        let mut table = ClassTable::new();
        let at_cap = "x".repeat(MAX_NAME_LEN);
        let over_cap = "x".repeat(MAX_NAME_LEN + 1);
        assert!(put_soft(&mut table, None, &at_cap));
        assert!(!put_soft(&mut table, None, &over_cap));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let mut table = ClassTable::new();
        assert!(put_soft(&mut table, None, "shared"));
        assert!(put_soft(&mut table, Some("other"), "shared"));
        assert_eq!(table.len(), 2);
        assert!(table.get(Some("other"), "shared").is_some());
    }

    #[test]
    fn test_remove() {
        let mut table = ClassTable::new();
        put_soft(&mut table, None, "doomed");
        assert!(table.remove(None, "doomed"));
        assert!(!table.remove(None, "doomed"));
        assert!(table.get(None, "doomed").is_none());
    }

    #[test]
    fn test_find_match_first_in_insertion_order() {
        let mut table = ClassTable::new();
        put_soft(&mut table, None, "web_1");
        put_soft(&mut table, None, "web_2");
        let found = table.find_match("web_.*").unwrap();
        assert_eq!(found.name, "web_1");
        assert!(table.find_match("db_.*").is_none());
    }

    #[test]
    fn test_find_match_is_anchored() {
        let mut table = ClassTable::new();
        put_soft(&mut table, None, "webserver");
        assert!(table.find_match("web").is_none());
        assert!(table.find_match("web.*").is_some());
    }

    #[test]
    fn test_iter_filtered() {
        let mut table = ClassTable::new();
        table.put(None, "hardfact", false, ContextScope::Namespace, BTreeSet::new(), None);
        table.put(None, "softfact", true, ContextScope::Namespace, tags_from_str("t=1"), None);

        let hard: Vec<_> = table.iter_filtered(None, true, false).collect();
        assert_eq!(hard.len(), 1);
        assert_eq!(hard[0].name, "hardfact");

        let soft: Vec<_> = table.iter_filtered(None, false, true).collect();
        assert_eq!(soft.len(), 1);
        assert_eq!(soft[0].name, "softfact");
    }
}
