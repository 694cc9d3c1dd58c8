//! Value and Data-Type Definitions
//!
//! Values are a closed sum type: scalar strings, lists, container trees,
//! unevaluated function calls, and the absent value. Containers are
//! `serde_json::Value` trees (objects, arrays, four leaf primitives).
//! Copying a value deep-copies its owned storage.

use serde_json::Value as Json;
use std::fmt;

/// Data type attached to a stored variable or requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Int,
    Real,
    Bool,
    /// List of strings (`slist`)
    StringList,
    /// List of integers (`ilist`)
    IntList,
    /// List of reals (`rlist`)
    RealList,
    /// Structured tree value (`data`)
    Container,
    Body,
    Bundle,
    /// No type: the "not found" discriminant
    None,
}

impl DataType {
    /// Only iterable (list-shaped) types may legitimately hold the value
    /// `None`, which then denotes an empty list rather than absence.
    pub fn is_iterable(self) -> bool {
        matches!(
            self,
            DataType::StringList | DataType::IntList | DataType::RealList
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Real => "real",
            DataType::Bool => "boolean",
            DataType::StringList => "slist",
            DataType::IntList => "ilist",
            DataType::RealList => "rlist",
            DataType::Container => "data",
            DataType::Body => "body",
            DataType::Bundle => "bundle",
            DataType::None => "none",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An unevaluated function call carried as a value. The core never
/// evaluates these; function machinery lives outside and consults the
/// function-result cache through the context.
#[derive(Debug, Clone, PartialEq)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<Value>,
}

impl FnCall {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self { name: name.into(), args }
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    List(Vec<Value>),
    Container(Json),
    FnCall(FnCall),
    /// Absent value. For list-typed variables this is the empty list.
    None,
}

impl Value {
    pub fn scalar(s: impl Into<String>) -> Self {
        Value::Scalar(s.into())
    }

    /// Build a string list from anything yielding string-likes.
    pub fn slist<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::Scalar(s.into())).collect())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_container(&self) -> Option<&Json> {
        match self {
            Value::Container(json) => Some(json),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Append a canonical, injective rendering of this value to `out`.
    /// Scalars are length-prefixed so that concatenated renderings cannot
    /// collide; containers use serde_json's deterministic serialization.
    /// This is the basis of the function-cache key: equal renderings imply
    /// structurally equal values, and argument order matters.
    pub fn render_key(&self, out: &mut String) {
        match self {
            Value::Scalar(s) => {
                out.push('s');
                out.push_str(&s.len().to_string());
                out.push(':');
                out.push_str(s);
            }
            Value::List(items) => {
                out.push('[');
                for item in items {
                    item.render_key(out);
                    out.push(',');
                }
                out.push(']');
            }
            Value::Container(json) => {
                let body = json.to_string();
                out.push('c');
                out.push_str(&body.len().to_string());
                out.push(':');
                out.push_str(&body);
            }
            Value::FnCall(call) => {
                out.push('f');
                out.push_str(&call.name.len().to_string());
                out.push(':');
                out.push_str(&call.name);
                out.push('(');
                for arg in &call.args {
                    arg.render_key(out);
                    out.push(',');
                }
                out.push(')');
            }
            Value::None => out.push('n'),
        }
    }
}
