//! Variable References and Records
//!
//! A `VarRef` is the parsed form of `[ns:][scope.]name[index]...`. A
//! `Variable` is a stored value with its type, tags and the promise that
//! assigned it.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::policy::types::Promise;
use crate::value::{DataType, Value};

/// Separator used when a scoped name is mangled into a special scope:
/// `config.var1` stored under `this` becomes `config___var1`. A user
/// variable whose own name contains a literal `___` can collide with a
/// mangled name; the first entry stored under the colliding key wins and
/// no diagnostic is emitted.
pub const NESTED_SCOPE_SEP: &str = "___";

/// The special scopes recognized during reference resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialScope {
    /// `def.` routes to the global table but is otherwise not special.
    Def,
    Sys,
    Mon,
    Const,
    /// Regex capture variables from the last match.
    Match,
    /// The innermost bundle's local table (file editing).
    Edit,
    /// The innermost body frame's table.
    Body,
    /// The innermost promise frame's table.
    This,
    /// Not a special scope (a bundle name, or no scope at all).
    None,
}

impl SpecialScope {
    pub fn from_str(scope: &str) -> Self {
        match scope {
            "def" => SpecialScope::Def,
            "sys" => SpecialScope::Sys,
            "mon" => SpecialScope::Mon,
            "const" => SpecialScope::Const,
            "match" => SpecialScope::Match,
            "edit" => SpecialScope::Edit,
            "body" => SpecialScope::Body,
            "this" => SpecialScope::This,
            _ => SpecialScope::None,
        }
    }

    pub fn from_opt(scope: Option<&str>) -> Self {
        scope.map_or(SpecialScope::None, SpecialScope::from_str)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialScope::Def => "def",
            SpecialScope::Sys => "sys",
            SpecialScope::Mon => "mon",
            SpecialScope::Const => "const",
            SpecialScope::Match => "match",
            SpecialScope::Edit => "edit",
            SpecialScope::Body => "body",
            SpecialScope::This => "this",
            SpecialScope::None => "",
        }
    }
}

/// A qualified variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    pub ns: Option<String>,
    pub scope: Option<String>,
    pub lval: String,
    /// Ordered index path for map-like access: `cfg[net][port]`.
    pub indices: Vec<String>,
}

impl VarRef {
    pub fn new(ns: Option<&str>, scope: Option<&str>, lval: &str) -> Self {
        Self {
            ns: ns.map(|s| s.to_string()),
            scope: scope.map(|s| s.to_string()),
            lval: lval.to_string(),
            indices: Vec::new(),
        }
    }

    /// Parse `[ns:][scope.]name[idx]...`. The namespace separator is only
    /// honored before any `.` or `[`; the scope separator only before the
    /// first `[`, so dots inside indices stay part of the index.
    pub fn parse(qualified: &str) -> Self {
        let mut rest = qualified;

        let mut ns = None;
        if let Some(colon) = rest.find(':') {
            let stop = rest.find(|c| c == '.' || c == '[').unwrap_or(rest.len());
            if colon < stop {
                ns = Some(rest[..colon].to_string());
                rest = &rest[colon + 1..];
            }
        }

        let mut scope = None;
        let bracket = rest.find('[').unwrap_or(rest.len());
        if let Some(dot) = rest[..bracket].find('.') {
            scope = Some(rest[..dot].to_string());
            rest = &rest[dot + 1..];
        }

        let bracket = rest.find('[').unwrap_or(rest.len());
        let lval = rest[..bracket].to_string();

        let mut indices = Vec::new();
        let bytes = rest.as_bytes();
        let mut i = bracket;
        while i < bytes.len() {
            if bytes[i] == b'[' {
                let start = i + 1;
                let mut depth = 1;
                let mut j = start;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'[' => depth += 1,
                        b']' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                let end = if depth == 0 { j - 1 } else { j };
                indices.push(rest[start..end].to_string());
                i = j;
            } else {
                i += 1;
            }
        }

        Self { ns, scope, lval, indices }
    }

    /// Parse a reference, defaulting the scope when the string does not
    /// carry one.
    pub fn parse_from_scope(qualified: &str, scope: &str) -> Self {
        let mut parsed = Self::parse(qualified);
        if parsed.scope.is_none() {
            parsed.scope = Some(scope.to_string());
        }
        parsed
    }

    pub fn is_qualified(&self) -> bool {
        self.scope.is_some()
    }

    pub fn qualify(&mut self, ns: Option<&str>, scope: &str) {
        self.ns = ns.map(|s| s.to_string());
        self.scope = Some(scope.to_string());
    }

    pub fn copy_indexless(&self) -> Self {
        Self {
            ns: self.ns.clone(),
            scope: self.scope.clone(),
            lval: self.lval.clone(),
            indices: Vec::new(),
        }
    }

    /// The mangled `this`-scope form of a scoped reference:
    /// `config.var1[i]` becomes `this.config___var1[i]`.
    pub fn mangled_this(&self) -> Self {
        let scope = self.scope.as_deref().unwrap_or("");
        Self {
            ns: self.ns.clone(),
            scope: Some("this".to_string()),
            lval: format!("{}{}{}", scope, NESTED_SCOPE_SEP, self.lval),
            indices: self.indices.clone(),
        }
    }

    /// Canonical table key. The namespace defaults to `default` so that
    /// an elided and an explicit default namespace address the same slot.
    pub fn key(&self) -> String {
        let mut out = String::new();
        out.push_str(self.ns.as_deref().unwrap_or("default"));
        out.push(':');
        if let Some(scope) = &self.scope {
            out.push_str(scope);
        }
        out.push('.');
        out.push_str(&self.lval);
        for index in &self.indices {
            out.push('[');
            out.push_str(index);
            out.push(']');
        }
        out
    }
}

// Display mirrors the written form: ns only when not default, scope only
// when present.
impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.ns {
            if ns != "default" {
                write!(f, "{}:", ns)?;
            }
        }
        if let Some(scope) = &self.scope {
            write!(f, "{}.", scope)?;
        }
        write!(f, "{}", self.lval)?;
        for index in &self.indices {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

/// Replace the first `scope.` prefix occurrence in `var_name` with
/// `scope___`, producing the mangled special-scope name.
pub fn mangle_scoped_name(scope: &str, var_name: &str) -> String {
    let needle = format!("{}.", scope);
    let replacement = format!("{}{}", scope, NESTED_SCOPE_SEP);
    var_name.replacen(&needle, &replacement, 1)
}

/// A stored variable.
#[derive(Debug, Clone)]
pub struct Variable {
    reference: VarRef,
    value: Value,
    dtype: DataType,
    tags: BTreeSet<String>,
    comment: Option<String>,
    /// The promise that assigned this variable; none for system values.
    promise: Option<Rc<Promise>>,
}

impl Variable {
    pub fn new(
        reference: VarRef,
        value: Value,
        dtype: DataType,
        tags: BTreeSet<String>,
        comment: Option<String>,
        promise: Option<Rc<Promise>>,
    ) -> Self {
        Self { reference, value, dtype, tags, comment, promise }
    }

    pub fn reference(&self) -> &VarRef {
        &self.reference
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn data_type(&self) -> DataType {
        self.dtype
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn promise(&self) -> Option<&Rc<Promise>> {
        self.promise.as_ref()
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = value;
    }
}
