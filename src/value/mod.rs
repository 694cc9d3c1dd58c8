//! Runtime value model
//!
//! The closed sum type for every value the evaluator moves around, plus
//! the data-type enum that variable tables and callers use to agree on
//! what a value pointer means.

pub mod types;

pub use types::{DataType, FnCall, Value};
