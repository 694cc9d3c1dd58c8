//! covenant - evaluation core for a declarative configuration agent
//!
//! This library takes an already-parsed policy (bundles, bodies,
//! promises) and drives it to a fixed point, maintaining a layered
//! class/variable environment, a stack of nested evaluation scopes, a
//! persistent class store, and a per-promise outcome protocol. The
//! per-type verifiers that actually touch the system are external; they
//! consume the [`eval::EvalContext`] API.

pub mod classes;
pub mod eval;
pub mod logging;
pub mod persist;
pub mod policy;
pub mod stack;
pub mod value;
pub mod vars;

pub use classes::{ClassTable, ContextScope, ExpressionValue};
pub use eval::{
    run_bundle, run_bundle_by_name, AgentConfig, EvalContext, EvalMode, EvalOption,
    PromiseResult, PromiseVerifier, VerifierRegistry,
};
pub use logging::LogLevel;
pub use persist::{FileStore, MemoryStore, StatePolicy, StateStore};
pub use policy::{Attributes, Body, Bundle, BundleSection, Policy, Promise};
pub use value::{DataType, Value};
pub use vars::{SpecialScope, VarRef};
