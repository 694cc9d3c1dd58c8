//! Promise Outcome Protocol
//!
//! Maps the result of a promise iteration to class mutations, global
//! kept/repaired/not-kept accounting, dependency-handle satisfaction,
//! and outcome log emission. The `record_*` helpers are the thin
//! wrappers verifiers call; `record_promise_result` is the full
//! protocol.

use std::fs::OpenOptions;
use std::io::Write;

use crate::classes::types::{canonify, ClassRef, ContextScope};
use crate::eval::context::{EvalContext, EvalMode};
use crate::eval::expand;
use crate::logging::LogLevel;
use crate::persist::store::StatePolicy;
use crate::policy::attributes::{Action, Attributes, DefineClasses, TransactionContext};
use crate::policy::types::Promise;
use crate::value::Value;

/// The status of a single promise iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseResult {
    /// Nothing observable happened; steps of the protocol are skipped.
    Skipped,
    /// The promise was already kept.
    Noop,
    /// The promise was repaired.
    Change,
    Warn,
    Timeout,
    Fail,
    Denied,
    Interrupted,
}

impl PromiseResult {
    fn severity(self) -> u8 {
        match self {
            PromiseResult::Skipped => 0,
            PromiseResult::Noop => 1,
            PromiseResult::Change => 2,
            PromiseResult::Warn => 3,
            PromiseResult::Timeout => 4,
            PromiseResult::Fail => 5,
            PromiseResult::Denied => 6,
            PromiseResult::Interrupted => 7,
        }
    }

    /// Merge two results, keeping the worse one. Verifiers accumulate an
    /// aggregate result across sub-steps with this.
    pub fn update(self, other: PromiseResult) -> PromiseResult {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PromiseResult::Skipped => "skipped",
            PromiseResult::Noop => "kept",
            PromiseResult::Change => "repaired",
            PromiseResult::Warn => "warned",
            PromiseResult::Timeout => "timed out",
            PromiseResult::Fail => "failed",
            PromiseResult::Denied => "denied",
            PromiseResult::Interrupted => "interrupted",
        }
    }
}

/// Global kept/repaired/not-kept accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounters {
    pub kept: u64,
    pub repaired: u64,
    pub not_kept: u64,
}

/// Promise types that only support evaluation and would churn the
/// status counters and outcome logs without adding information.
const BOOKKEEPING_EXEMPT_TYPES: &[&str] = &[
    "vars",
    "classes",
    "insert_lines",
    "delete_lines",
    "replace_patterns",
    "field_edits",
];

fn promise_valuable_for_status(pp: &Promise) -> bool {
    !BOOKKEEPING_EXEMPT_TYPES.contains(&pp.promise_type.as_str())
}

fn promise_valuable_for_logging(pp: &Promise) -> bool {
    !BOOKKEEPING_EXEMPT_TYPES.contains(&pp.promise_type.as_str())
}

impl EvalContext {
    pub fn counters(&self) -> &StatusCounters {
        &self.counters
    }

    /// Install the external compliance tracker invoked for every
    /// status-valuable promise outcome.
    pub fn set_compliance_hook(&mut self, hook: Box<dyn FnMut(PromiseResult, &Promise)>) {
        self.compliance_hook = Some(hook);
    }

    /// A `change` or `noop` outcome satisfies the promise's handle for
    /// later `depends_on` checks.
    pub fn notify_dependent_promises(&mut self, pp: &Promise, result: PromiseResult) {
        if matches!(result, PromiseResult::Change | PromiseResult::Noop) {
            if let Some(handle) = pp.handle() {
                self.dependency_handles.insert(handle.to_string());
            }
        }
    }

    /// Apply the outcome's class mutations from the promise's `classes`
    /// body.
    pub fn set_promise_outcome_classes(&mut self, status: PromiseResult, dc: &DefineClasses) {
        let (add_classes, del_classes) = match status {
            PromiseResult::Change => (&dc.change, &dc.del_change),
            PromiseResult::Timeout => (&dc.timeout, &dc.del_notkept),
            PromiseResult::Warn | PromiseResult::Fail | PromiseResult::Interrupted => {
                (&dc.failure, &dc.del_notkept)
            }
            PromiseResult::Denied => (&dc.denied, &dc.del_notkept),
            PromiseResult::Noop => (&dc.kept, &dc.del_kept),
            PromiseResult::Skipped => {
                panic!("skipped outcomes have no class mutations")
            }
        };

        self.add_all_classes(add_classes, dc.persist, dc.timer, dc.scope);
        self.delete_all_classes(del_classes);
    }

    fn add_all_classes(
        &mut self,
        list: &[String],
        persistence_ttl: u32,
        policy: StatePolicy,
        scope: ContextScope,
    ) {
        for name in list {
            let classname = canonify(name);

            if self.heap_contains_hard_class(&classname) {
                self.log(
                    LogLevel::Error,
                    &format!(
                        "You cannot use reserved hard class '{}' as post-condition class",
                        classname
                    ),
                );
                continue;
            }

            if persistence_ttl > 0 {
                if scope != ContextScope::Namespace {
                    self.log(
                        LogLevel::Info,
                        &format!(
                            "Automatically promoting context scope for '{}' to namespace visibility, due to persistence",
                            classname
                        ),
                    );
                }
                self.log(
                    LogLevel::Verbose,
                    &format!("Defining persistent outcome class '{}'", classname),
                );
                self.persistent_save(&classname, persistence_ttl, policy, "");
                self.class_put_soft(&classname, ContextScope::Namespace, "");
            } else {
                self.log(
                    LogLevel::Verbose,
                    &format!("Defining promise outcome class '{}'", classname),
                );
                match scope {
                    ContextScope::Bundle => self.stack_frame_add_soft(&classname, ""),
                    ContextScope::Namespace => {
                        self.class_put_soft(&classname, ContextScope::Namespace, "");
                    }
                }
            }
        }
    }

    fn delete_all_classes(&mut self, list: &[String]) {
        for name in list {
            let cref = ClassRef::parse(name);
            let canonical = canonify(&cref.name);

            if self.heap_contains_hard_class(&canonical) {
                self.log(
                    LogLevel::Error,
                    &format!(
                        "You cannot cancel a reserved hard class '{}' in post-condition classes",
                        canonical
                    ),
                );
                return;
            }

            self.log(LogLevel::Verbose, &format!("Cancelling class '{}'", canonical));

            self.persistent_remove(name);
            self.class_remove(cref.ns.as_deref(), &canonical);
            self.stack_frame_remove_soft(&canonical);
        }
    }

    fn update_promise_counters(&mut self, status: PromiseResult) {
        match status {
            PromiseResult::Noop => self.counters.kept += 1,
            PromiseResult::Change => self.counters.repaired += 1,
            PromiseResult::Warn
            | PromiseResult::Timeout
            | PromiseResult::Fail
            | PromiseResult::Denied
            | PromiseResult::Interrupted => self.counters.not_kept += 1,
            PromiseResult::Skipped => {}
        }
    }

    /// Steps 1-4 of the outcome protocol: accounting, class mutations,
    /// and the outcome log.
    pub fn class_audit_log(&mut self, pp: &Promise, attr: &Attributes, status: PromiseResult) {
        if promise_valuable_for_status(pp) {
            self.update_promise_counters(status);
            if let Some(hook) = self.compliance_hook.as_mut() {
                hook(status, pp);
            }
        }

        self.set_promise_outcome_classes(status, &attr.classes);
        self.summarize_transaction(status, pp, &attr.transaction);
    }

    fn summarize_transaction(
        &mut self,
        status: PromiseResult,
        pp: &Promise,
        tc: &TransactionContext,
    ) {
        if !promise_valuable_for_logging(pp) {
            return;
        }

        let log_name = match status {
            PromiseResult::Change => tc.log_repaired.clone(),
            PromiseResult::Timeout
            | PromiseResult::Fail
            | PromiseResult::Denied
            | PromiseResult::Interrupted => tc.log_failed.clone(),
            PromiseResult::Noop => tc.log_kept.clone(),
            PromiseResult::Warn | PromiseResult::Skipped => return,
        };

        let (Some(log_name), Some(log_string)) = (log_name, tc.log_string.clone()) else {
            return;
        };

        let message = expand::expand_scalar(self, None, None, &log_string);
        match log_name.as_str() {
            // transport for syslog is an external collaborator; route
            // through the facade under its own target
            "udp_syslog" => log::info!(target: "udp_syslog", "{}", message),
            "stdout" => self.log(LogLevel::Info, &format!("L: {}", message)),
            path => {
                let opened = OpenOptions::new().create(true).append(true).open(path);
                match opened {
                    Ok(mut file) => {
                        self.log(
                            LogLevel::Verbose,
                            &format!("Logging string '{}' to '{}'", message, path),
                        );
                        if let Err(err) = writeln!(file, "{}", message) {
                            log::error!("Failed writing to outcome log '{}': {}", path, err);
                        }
                    }
                    Err(err) => {
                        log::error!("Unable to open private log '{}': {}", path, err);
                    }
                }
            }
        }
    }

    fn log_promise_context(&mut self, pp: &Promise) {
        if !self.would_log(LogLevel::Verbose) {
            return;
        }

        let mut info = String::from("Additional promise info:");
        if let Some(handle) = pp.handle() {
            info.push_str(&format!(" handle '{}'", handle));
        }
        if let Some(path) = &pp.source_path {
            info.push_str(&format!(" source path '{}' at line {}", path, pp.line));
        }
        match &pp.promisee {
            Some(Value::Scalar(text)) => info.push_str(&format!(" promisee '{}'", text)),
            Some(Value::List(items)) => {
                let names: Vec<&str> = items.iter().filter_map(|v| v.as_scalar()).collect();
                info.push_str(&format!(" promisee [{}]", names.join(", ")));
            }
            _ => {}
        }
        if let Some(comment) = &pp.comment {
            info.push_str(&format!(" comment '{}'", comment));
        }

        self.log(LogLevel::Verbose, &info);
    }

    /// The full outcome protocol: log `message` at `level`, then (unless
    /// skipped) account, mutate classes, and emit the outcome log.
    pub fn record_promise_result(
        &mut self,
        level: LogLevel,
        status: PromiseResult,
        pp: &Promise,
        attr: &Attributes,
        message: &str,
    ) {
        if !message.is_empty() {
            if level >= LogLevel::Verbose {
                self.log_promise_context(pp);
            }
            self.log(level, message);
        }

        if status != PromiseResult::Skipped {
            self.class_audit_log(pp, attr, status);
            self.notify_dependent_promises(pp, status);
        }
    }

    pub fn record_change(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Info, message);
        self.set_promise_outcome_classes(PromiseResult::Change, &attr.classes);
    }

    pub fn record_no_change(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Verbose, message);
        self.set_promise_outcome_classes(PromiseResult::Noop, &attr.classes);
    }

    pub fn record_failure(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Error, message);
        self.set_promise_outcome_classes(PromiseResult::Fail, &attr.classes);
    }

    pub fn record_warning(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Warning, message);
        self.set_promise_outcome_classes(PromiseResult::Warn, &attr.classes);
    }

    pub fn record_denial(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Error, message);
        self.set_promise_outcome_classes(PromiseResult::Denied, &attr.classes);
    }

    pub fn record_interruption(&mut self, pp: &Promise, attr: &Attributes, message: &str) {
        self.log_promise_context(pp);
        self.log(LogLevel::Error, message);
        self.set_promise_outcome_classes(PromiseResult::Interrupted, &attr.classes);
    }

    /// Dry-run gate for externally visible changes. True when the
    /// evaluator is enforcing and the promise's action allows repair;
    /// otherwise records a warn outcome with a "should have" message.
    pub fn making_changes(
        &mut self,
        pp: &Promise,
        attr: &Attributes,
        result: Option<&mut PromiseResult>,
        change_desc: &str,
    ) -> bool {
        if self.eval_mode != EvalMode::DryRun && attr.transaction.action != Action::Warn {
            return true;
        }
        self.warn_only_promised(pp, attr, result, change_desc);
        false
    }

    /// Dry-run gate for internal bookkeeping changes; only full
    /// enforcing mode passes.
    pub fn making_internal_changes(
        &mut self,
        pp: &Promise,
        attr: &Attributes,
        result: Option<&mut PromiseResult>,
        change_desc: &str,
    ) -> bool {
        if self.eval_mode == EvalMode::Normal && attr.transaction.action != Action::Warn {
            return true;
        }
        self.warn_only_promised(pp, attr, result, change_desc);
        false
    }

    fn warn_only_promised(
        &mut self,
        pp: &Promise,
        attr: &Attributes,
        result: Option<&mut PromiseResult>,
        change_desc: &str,
    ) {
        let message = if attr.transaction.action == Action::Warn {
            format!("Should {}, but only warning promised", change_desc)
        } else {
            format!("Should {}", change_desc)
        };

        self.log_promise_context(pp);
        self.log(LogLevel::Warning, &message);
        self.set_promise_outcome_classes(PromiseResult::Warn, &attr.classes);

        if let Some(result) = result {
            *result = PromiseResult::Warn;
        }
    }
}
