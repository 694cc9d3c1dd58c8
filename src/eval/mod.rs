//! Evaluation core
//!
//! The `EvalContext` façade and the machinery around it: expansion, the
//! promise outcome protocol, the chroot projection for dry-runs, and
//! the fixed-point driver.

pub mod chroot;
pub mod context;
pub mod driver;
pub mod expand;
pub mod outcome;

pub use context::{AgentConfig, EvalContext, EvalMode, EvalOption};
pub use driver::{run_bundle, run_bundle_by_name, PromiseVerifier, VerifierRegistry};
pub use outcome::{PromiseResult, StatusCounters};
