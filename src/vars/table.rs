//! Variable Table
//!
//! A ref-keyed, insertion-ordered table of variables. The context keeps
//! one for global variables, one for match captures, and one per
//! bundle/body/promise frame.

use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::policy::types::Promise;
use crate::value::{DataType, Value};
use crate::vars::types::{VarRef, Variable};

#[derive(Debug, Default)]
pub struct VariableTable {
    vars: IndexMap<String, Variable>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &VarRef) -> Option<&Variable> {
        self.vars.get(&reference.key())
    }

    /// Insert or replace. Values are never mutated in place after
    /// storage; re-assignment goes through here.
    pub fn put(
        &mut self,
        reference: VarRef,
        value: Value,
        dtype: DataType,
        tags: BTreeSet<String>,
        comment: Option<String>,
        promise: Option<Rc<Promise>>,
    ) {
        let key = reference.key();
        self.vars
            .insert(key, Variable::new(reference, value, dtype, tags, comment, promise));
    }

    /// Replace the stored value of an existing entry, keeping its type,
    /// tags and provenance. Used for in-place re-expansion on bundle
    /// entry.
    pub fn set_value(&mut self, reference: &VarRef, value: Value) -> bool {
        match self.vars.get_mut(&reference.key()) {
            Some(var) => {
                var.set_value(value);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, reference: &VarRef) -> bool {
        self.vars.shift_remove(&reference.key()).is_some()
    }

    /// Remove every entry matching the given filters; a `None` filter
    /// matches everything. Returns whether anything was removed.
    pub fn clear(
        &mut self,
        ns: Option<&str>,
        scope: Option<&str>,
        lval: Option<&str>,
    ) -> bool {
        let before = self.vars.len();
        self.vars.retain(|_, var| !matches_filters(var, ns, scope, lval));
        before != self.vars.len()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// Iterate entries matching the given filters, in insertion order.
    pub fn iter_filtered<'a>(
        &'a self,
        ns: Option<&'a str>,
        scope: Option<&'a str>,
        lval: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Variable> {
        self.vars
            .values()
            .filter(move |var| matches_filters(var, ns, scope, lval))
    }
}

fn matches_filters(var: &Variable, ns: Option<&str>, scope: Option<&str>, lval: Option<&str>) -> bool {
    let reference = var.reference();
    if let Some(want) = ns {
        if reference.ns.as_deref().unwrap_or("default") != want {
            return false;
        }
    }
    if let Some(want) = scope {
        if reference.scope.as_deref() != Some(want) {
            return false;
        }
    }
    if let Some(want) = lval {
        if reference.lval != want {
            return false;
        }
    }
    true
}
