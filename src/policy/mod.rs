//! Structured policy model
//!
//! The already-parsed policy the evaluation core consumes: bundles,
//! bodies, promises and their constraints, plus the per-promise outcome
//! attributes. There is no grammar here; a parser (or a test) builds
//! these values directly.

pub mod attributes;
pub mod types;

pub use attributes::{Action, Attributes, DefineClasses, TransactionContext};
pub use types::{Body, Bundle, BundleSection, Constraint, Policy, Promise};
