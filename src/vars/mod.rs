//! Variable system
//!
//! Typed values organized in scope-qualified tables. A variable is
//! addressed by a qualified reference `(namespace, scope, name,
//! indices)`; resolution across special scopes and the frame stack is
//! the evaluation context's job, this module provides the reference
//! type and the tables themselves.

pub mod table;
pub mod types;

pub use table::VariableTable;
pub use types::{SpecialScope, VarRef, Variable};
