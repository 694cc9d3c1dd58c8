//! Class system
//!
//! Classes are named boolean facts. Hard classes are discovered facts
//! about the process and platform; soft classes are derived by policy.
//! This module holds the class data types, the insertion-ordered class
//! table, and the boolean expression evaluator over class names.

pub mod expression;
pub mod table;
pub mod types;

pub use expression::{eval_with_token_set, ExpressionValue};
pub use table::ClassTable;
pub use types::{canonify, tags_from_str, Class, ClassRef, ContextScope, MAX_NAME_LEN};
