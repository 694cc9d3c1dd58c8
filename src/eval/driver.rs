//! Fixed-Point Driver
//!
//! Walks a bundle's sections and promises, pushing the corresponding
//! frames and dispatching each expanded promise to the verifier
//! registered for its type. Bundles are evaluated in multiple passes so
//! that classes and variables defined late in one pass take effect on
//! the next; verifiers are expected to be convergent.

use std::collections::HashMap;
use std::rc::Rc;

use crate::eval::context::EvalContext;
use crate::eval::outcome::PromiseResult;
use crate::logging::LogLevel;
use crate::policy::types::{Bundle, Policy, Promise};
use crate::value::Value;

/// Number of convergence passes over a bundle.
pub const DONE_PASSES: usize = 3;

/// A per-promise-type verifier: the leaves of the system, invoked
/// through the context for each expanded promise iteration.
pub trait PromiseVerifier {
    fn verify(&mut self, ctx: &mut EvalContext, pp: &Promise) -> PromiseResult;
}

/// Registry of verifiers keyed by promise type.
#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<String, Box<dyn PromiseVerifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, promise_type: &str, verifier: Box<dyn PromiseVerifier>) {
        self.verifiers.insert(promise_type.to_string(), verifier);
    }

    fn verify(&mut self, ctx: &mut EvalContext, pp: &Promise) -> Option<PromiseResult> {
        self.verifiers
            .get_mut(&pp.promise_type)
            .map(|verifier| verifier.verify(ctx, pp))
    }
}

enum SectionOutcome {
    Done,
    BundleAborted,
    EvalAborted,
}

fn run_section(
    ctx: &mut EvalContext,
    promises: &[Rc<Promise>],
    registry: &mut VerifierRegistry,
) -> SectionOutcome {
    for pp in promises {
        if ctx.eval_aborted() {
            return SectionOutcome::EvalAborted;
        }

        if ctx.missing_dependencies(pp) {
            continue;
        }

        ctx.stack_push_promise(pp);
        if let Some(expanded) = ctx.stack_push_promise_iteration(0) {
            let result = match registry.verify(ctx, &expanded) {
                Some(result) => result,
                None => {
                    ctx.log(
                        LogLevel::Verbose,
                        &format!("No verifier for promise type '{}'", expanded.promise_type),
                    );
                    PromiseResult::Noop
                }
            };
            ctx.notify_dependent_promises(&expanded, result);
            ctx.stack_pop();
        }
        ctx.stack_pop();

        if ctx.bundle_abort() {
            return SectionOutcome::BundleAborted;
        }
    }

    SectionOutcome::Done
}

/// Evaluate one bundle to its fixed point. Returns false when the
/// bundle or the whole evaluation was aborted.
pub fn run_bundle(
    ctx: &mut EvalContext,
    bundle: &Rc<Bundle>,
    args: &[Value],
    registry: &mut VerifierRegistry,
) -> bool {
    ctx.push_bundle_name(&bundle.name);
    ctx.stack_push_bundle(bundle, args, false);

    let mut completed = true;
    'passes: for pass in 1..=DONE_PASSES {
        ctx.set_pass(pass);

        for section in &bundle.sections {
            ctx.stack_push_bundle_section(section);
            let outcome = run_section(ctx, &section.promises, registry);
            ctx.stack_pop();

            match outcome {
                SectionOutcome::Done => {}
                SectionOutcome::BundleAborted | SectionOutcome::EvalAborted => {
                    completed = false;
                    break 'passes;
                }
            }
        }

        if ctx.eval_aborted() {
            completed = false;
            break;
        }
    }

    ctx.stack_pop();
    completed
}

/// Resolve a bundle by name in the policy and evaluate it.
pub fn run_bundle_by_name(
    ctx: &mut EvalContext,
    policy: &Policy,
    name: &str,
    registry: &mut VerifierRegistry,
) -> bool {
    match ctx.resolve_bundle_expression(policy, name, "agent") {
        Some(bundle) => run_bundle(ctx, &bundle, &[], registry),
        None => {
            log::error!("Bundle '{}' not found in policy", name);
            false
        }
    }
}
