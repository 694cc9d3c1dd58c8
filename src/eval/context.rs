//! Evaluation Context
//!
//! The single process-wide object owning the class system, the variable
//! system, the evaluation stack, the persistent-class store, the
//! function cache, and the abort/dependency bookkeeping. Verifiers see
//! the whole core through this façade.
//!
//! There is one context per agent run. It is single-threaded; background
//! work gets its own inherited copy and never shares mutable state.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use crate::classes::expression::{self, ExpressionValue};
use crate::classes::table::ClassTable;
use crate::classes::types::{
    canonify, qualified_name, tags_from_str, Class, ClassRef, ContextScope, MAX_NAME_LEN,
};
use crate::eval::chroot::ChangesChroot;
use crate::eval::expand;
use crate::eval::outcome::{PromiseResult, StatusCounters};
use crate::logging::{self, LogLevel};
use crate::persist::store::{MemoryStore, PersistEntry, StatePolicy, StateStore};
use crate::policy::types::{Body, Bundle, BundleSection, Policy, Promise};
use crate::stack::frame::{self, BundleFrame, FrameData, StackFrame};
use crate::stack::ring_buffer::RingBuffer;
use crate::value::{DataType, Value};
use crate::vars::table::VariableTable;
use crate::vars::types::{mangle_scoped_name, SpecialScope, VarRef, Variable};

/// Driver-level configuration handed to the context at startup.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub input_file: Option<String>,
    pub bundlesequence: Vec<String>,
    pub ignore_missing_bundles: bool,
}

/// Togglable evaluation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOption {
    FullExpansion,
    CacheSystemFunctions,
}

/// How the evaluator treats drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Enforce: repair drift.
    Normal,
    /// Report what would be done, change nothing.
    DryRun,
    /// Apply changes under the chroot projection.
    Simulate,
}

/// One abort watchlist entry: a class-name pattern, guarded by a class
/// expression that must hold for the entry to be active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortItem {
    pub expr: String,
    pub activated_on: String,
}

enum AbortList {
    Eval,
    CurrentBundle,
}

fn regex_full_match(pattern: &str, text: &str) -> bool {
    match regex_lite::Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => re.is_match(text),
        Err(_) => pattern == text,
    }
}

fn dtype_for_value(value: &Value) -> DataType {
    match value {
        Value::Scalar(_) => DataType::String,
        Value::List(_) => DataType::StringList,
        Value::Container(_) => DataType::Container,
        Value::FnCall(_) => DataType::String,
        Value::None => DataType::StringList,
    }
}

/// Parent directory of a path, with any trailing separator removed.
fn dirname_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(pos) => trimmed[..pos].to_string(),
        None => trimmed.to_string(),
    }
}

fn json_select<'a>(json: &'a serde_json::Value, indices: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = json;
    for index in indices {
        current = match current {
            serde_json::Value::Object(map) => map.get(index)?,
            serde_json::Value::Array(items) => items.get(index.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_self_referential(reference: &VarRef, value: &Value) -> bool {
    match value {
        Value::Scalar(text) => {
            if expand::contains_var_token(text, &reference.lval) {
                log::error!(
                    "The value of variable '{}' contains a reference to itself, '{}'",
                    reference,
                    text
                );
                return true;
            }
            false
        }
        Value::List(items) => {
            for item in items {
                if let Value::Scalar(text) = item {
                    if expand::contains_var_token(text, &reference.lval) {
                        log::error!(
                            "An item in list variable '{}' contains a reference to itself",
                            reference
                        );
                        return true;
                    }
                }
            }
            false
        }
        _ => false,
    }
}

/// Every agent has one `EvalContext` from process start to finish.
pub struct EvalContext {
    // ---- Configuration ----
    pub(crate) config: Option<AgentConfig>,
    pub(crate) full_expansion: bool,
    pub(crate) cache_system_functions: bool,
    pub(crate) eval_mode: EvalMode,
    pub(crate) checksum_updates_default: bool,
    pub(crate) ignore_locks: bool,
    pub(crate) select_end_match_eof: bool,
    pub(crate) dump_reports: bool,
    pub(crate) restrict_keys: Vec<String>,
    pub(crate) launch_directory: Option<String>,
    pub(crate) entry_point: Option<String>,

    // ---- Evaluation state ----
    pub(crate) pass: usize,
    pub(crate) bundle_args: Vec<Value>,
    pub(crate) bundle_aborted: bool,
    pub(crate) eval_aborted: bool,
    pub(crate) heap_abort: Vec<AbortItem>,
    pub(crate) heap_abort_current_bundle: Vec<AbortItem>,

    // ---- Tables ----
    pub(crate) stack: Vec<StackFrame>,
    pub(crate) global_classes: ClassTable,
    pub(crate) global_variables: VariableTable,
    pub(crate) match_variables: VariableTable,

    // ---- Caches and bookkeeping ----
    pub(crate) promise_lock_cache: HashSet<String>,
    pub(crate) dependency_handles: HashSet<String>,
    pub(crate) function_cache: IndexMap<String, Value>,
    pub(crate) ip_addresses: Vec<(String, String)>,
    pub(crate) all_classes: Option<HashSet<String>>,
    pub(crate) negated_classes: HashSet<String>,
    pub(crate) bundle_names: HashSet<String>,
    pub(crate) remote_var_promises: HashMap<String, Vec<Rc<Promise>>>,

    // ---- Process identity ----
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) pid: u32,
    pub(crate) ppid: u32,

    // ---- Outcome accounting ----
    pub(crate) counters: StatusCounters,
    pub(crate) compliance_hook: Option<Box<dyn FnMut(PromiseResult, &Promise)>>,

    // ---- Persistence ----
    pub(crate) state_store: Box<dyn StateStore>,
    /// Test hook: offset added to the wall clock.
    pub(crate) clock_skew: i64,

    // ---- Logging ----
    pub(crate) global_log_level: LogLevel,
    pub(crate) global_system_log_level: Option<LogLevel>,
    pub(crate) effective_log_level: LogLevel,
    pub(crate) effective_report_level: LogLevel,

    // ---- Dry-run projection ----
    pub(crate) changes_chroot: ChangesChroot,
}

#[cfg(unix)]
fn process_identity() -> (u32, u32, u32, u32) {
    // SAFETY: these libc calls read process attributes and cannot fail
    unsafe { (libc::getuid(), libc::getgid(), std::process::id(), libc::getppid() as u32) }
}

#[cfg(not(unix))]
fn process_identity() -> (u32, u32, u32, u32) {
    (0, 0, std::process::id(), 0)
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    pub fn new() -> Self {
        let (uid, gid, pid, ppid) = process_identity();
        Self {
            config: None,
            full_expansion: true,
            cache_system_functions: true,
            eval_mode: EvalMode::Normal,
            checksum_updates_default: false,
            ignore_locks: false,
            select_end_match_eof: false,
            dump_reports: false,
            restrict_keys: Vec::new(),
            launch_directory: None,
            entry_point: None,
            pass: 0,
            bundle_args: Vec::new(),
            bundle_aborted: false,
            eval_aborted: false,
            heap_abort: Vec::new(),
            heap_abort_current_bundle: Vec::new(),
            stack: Vec::new(),
            global_classes: ClassTable::new(),
            global_variables: VariableTable::new(),
            match_variables: VariableTable::new(),
            promise_lock_cache: HashSet::new(),
            dependency_handles: HashSet::new(),
            function_cache: IndexMap::new(),
            ip_addresses: Vec::new(),
            all_classes: None,
            negated_classes: HashSet::new(),
            bundle_names: HashSet::new(),
            remote_var_promises: HashMap::new(),
            uid,
            gid,
            pid,
            ppid,
            counters: StatusCounters::default(),
            compliance_hook: None,
            state_store: Box::new(MemoryStore::new()),
            clock_skew: 0,
            global_log_level: LogLevel::Info,
            global_system_log_level: None,
            effective_log_level: LogLevel::Info,
            effective_report_level: LogLevel::Info,
            changes_chroot: ChangesChroot::new(),
        }
    }

    /// Drop all classes, variables, IP records, promise locks, the
    /// stack, and the function cache. Configuration survives.
    pub fn clear(&mut self) {
        self.global_classes.clear();
        self.ip_addresses.clear();
        self.global_variables.clear(None, None, None);
        self.match_variables.clear(None, None, None);
        self.promise_lock_cache.clear();
        self.stack.clear();
        self.function_cache.clear();
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_config(&mut self, config: AgentConfig) {
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&AgentConfig> {
        self.config.as_ref()
    }

    pub fn set_eval_option(&mut self, option: EvalOption, value: bool) {
        match option {
            EvalOption::FullExpansion => self.full_expansion = value,
            EvalOption::CacheSystemFunctions => self.cache_system_functions = value,
        }
    }

    pub fn get_eval_option(&self, option: EvalOption) -> bool {
        match option {
            EvalOption::FullExpansion => self.full_expansion,
            EvalOption::CacheSystemFunctions => self.cache_system_functions,
        }
    }

    pub fn set_eval_mode(&mut self, mode: EvalMode) {
        self.eval_mode = mode;
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }

    pub fn set_launch_directory(&mut self, path: &str) {
        self.launch_directory = Some(path.to_string());
    }

    pub fn set_entry_point(&mut self, entry_point: &str) {
        self.entry_point = Some(entry_point.to_string());
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    pub fn set_ignore_locks(&mut self, ignore: bool) {
        self.ignore_locks = ignore;
    }

    pub fn is_ignoring_locks(&self) -> bool {
        self.ignore_locks
    }

    pub fn set_dump_reports(&mut self, dump_reports: bool) {
        self.dump_reports = dump_reports;
        if dump_reports {
            self.log(LogLevel::Verbose, "Report dumping is enabled");
        }
    }

    pub fn dump_reports(&self) -> bool {
        self.dump_reports
    }

    pub fn set_select_end_match_eof(&mut self, value: bool) {
        self.select_end_match_eof = value;
    }

    pub fn select_end_match_eof(&self) -> bool {
        self.select_end_match_eof
    }

    pub fn set_restrict_keys(&mut self, keys: &[String]) {
        self.restrict_keys = keys.to_vec();
    }

    pub fn restrict_keys(&self) -> &[String] {
        &self.restrict_keys
    }

    pub fn set_checksum_updates_default(&mut self, enabled: bool) {
        self.checksum_updates_default = enabled;
    }

    pub fn checksum_updates_default(&self) -> bool {
        self.checksum_updates_default
    }

    pub fn set_pass(&mut self, pass: usize) {
        self.pass = pass;
    }

    pub fn pass(&self) -> usize {
        self.pass
    }

    pub fn set_bundle_args(&mut self, args: &[Value]) {
        self.bundle_args = args.to_vec();
    }

    pub fn bundle_args(&self) -> &[Value] {
        &self.bundle_args
    }

    pub fn set_negated_classes(&mut self, negated: HashSet<String>) {
        self.negated_classes = negated;
    }

    // ========================================================================
    // Logging
    // ========================================================================

    fn base_log_level(&self) -> LogLevel {
        self.global_system_log_level.unwrap_or(self.global_log_level)
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.global_log_level = level;
        self.reset_effective_levels();
    }

    pub(crate) fn reset_effective_levels(&mut self) {
        self.effective_log_level = self.base_log_level();
        self.effective_report_level = self.global_log_level;
    }

    pub fn would_log(&self, level: LogLevel) -> bool {
        level <= self.effective_report_level
    }

    /// Emit a message. Messages at info level or above severity are also
    /// captured in the current promise iteration's ring buffer for
    /// reporting.
    pub fn log(&mut self, level: LogLevel, message: &str) {
        if level <= LogLevel::Info {
            if let Some(StackFrame { data: FrameData::PromiseIteration(iteration), .. }) =
                self.stack.last_mut()
            {
                iteration.log_messages.push(message);
            }
        }
        if self.would_log(level) {
            logging::emit(level, message);
        }
    }

    fn apply_promise_log_levels(&mut self, pp: &Promise) {
        let log_adjust = pp
            .constraint_scalar("log_level")
            .and_then(LogLevel::from_promise_value);
        let report_adjust = pp
            .constraint_scalar("report_level")
            .and_then(LogLevel::from_promise_value);

        let mut log_level = LogLevel::adjust(self.base_log_level(), log_adjust);
        if self.eval_mode == EvalMode::DryRun {
            // no system log entries for changes that are not being made
            log_level = LogLevel::Nothing;
        }
        self.effective_log_level = log_level;
        self.effective_report_level = LogLevel::adjust(self.global_log_level, report_adjust);
    }

    // ========================================================================
    // Abort tracking
    // ========================================================================

    fn abort_list_match(&self, which: AbortList, class_name: &str) -> bool {
        let list = match which {
            AbortList::Eval => &self.heap_abort,
            AbortList::CurrentBundle => &self.heap_abort_current_bundle,
        };
        list.iter().any(|item| {
            let active = item.activated_on.is_empty()
                || self.is_defined_class(&item.activated_on);
            active && regex_full_match(&item.expr, class_name)
        })
    }

    /// Watch for `expr`: any later class definition matching it aborts
    /// the whole evaluation. Added idempotently by name; if a matching
    /// class is already defined, the evaluation aborts immediately.
    pub fn heap_add_abort(&mut self, expr: &str, activated_on: &str) {
        if !self.heap_abort.iter().any(|item| item.expr == expr) {
            self.heap_abort.push(AbortItem {
                expr: expr.to_string(),
                activated_on: activated_on.to_string(),
            });
        }

        if let Some(name) = self.agent_aborting_context() {
            self.log(
                LogLevel::Notice,
                &format!("Aborting agent run on defined class '{}'", name),
            );
            self.eval_aborted = true;
        }
    }

    /// Watch for `expr` within the current bundle only.
    pub fn heap_add_abort_current_bundle(&mut self, expr: &str, activated_on: &str) {
        if !self
            .heap_abort_current_bundle
            .iter()
            .any(|item| item.expr == expr)
        {
            self.heap_abort_current_bundle.push(AbortItem {
                expr: expr.to_string(),
                activated_on: activated_on.to_string(),
            });
        }
    }

    fn agent_aborting_context(&self) -> Option<String> {
        for item in &self.heap_abort {
            let active = item.activated_on.is_empty()
                || self.is_defined_class(&item.activated_on);
            if active {
                if let Some(cls) = self.class_match(&item.expr) {
                    return Some(cls.name.clone());
                }
            }
        }
        None
    }

    /// Consume the bundle-aborted flag: true once per abort.
    pub fn bundle_abort(&mut self) -> bool {
        if self.bundle_aborted {
            self.bundle_aborted = false;
            return true;
        }
        false
    }

    pub fn eval_aborted(&self) -> bool {
        self.eval_aborted
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Define a hard (process-provided) class. Hard classes live in the
    /// default namespace at namespace scope, always.
    pub fn class_put_hard(&mut self, name: &str, tags: &str) -> bool {
        self.class_put(None, name, false, ContextScope::Namespace, tags_from_str(tags), None)
    }

    /// Define a soft class. A `ns:name` form carries its own namespace;
    /// otherwise the current evaluation namespace applies.
    pub fn class_put_soft(&mut self, name: &str, scope: ContextScope, tags: &str) -> bool {
        self.class_put_soft_with_comment(name, scope, tags, None)
    }

    pub fn class_put_soft_with_comment(
        &mut self,
        name: &str,
        scope: ContextScope,
        tags: &str,
        comment: Option<&str>,
    ) -> bool {
        let (ns, bare) = match name.split_once(':') {
            Some((ns, bare)) => (Some(ns.to_string()), bare.to_string()),
            None => (self.current_namespace(), name.to_string()),
        };
        self.class_put(ns.as_deref(), &bare, true, scope, tags_from_str(tags), comment)
    }

    pub fn class_put_soft_ns(
        &mut self,
        ns: &str,
        name: &str,
        scope: ContextScope,
        tags: &str,
    ) -> bool {
        self.class_put(Some(ns), name, true, scope, tags_from_str(tags), None)
    }

    pub(crate) fn class_put(
        &mut self,
        ns: Option<&str>,
        name: &str,
        is_soft: bool,
        scope: ContextScope,
        tags: BTreeSet<String>,
        comment: Option<&str>,
    ) -> bool {
        if name.len() > MAX_NAME_LEN {
            log::warn!(
                "Skipping class '{}': name is longer than {} characters",
                name,
                MAX_NAME_LEN
            );
            return false;
        }

        let canonical = canonify(name.trim());
        if canonical.is_empty() {
            return false;
        }
        let qualified = qualified_name(ns, &canonical);

        if self.abort_list_match(AbortList::CurrentBundle, &qualified) {
            let bundle = self
                .stack_current_bundle()
                .map(|b| b.name.clone())
                .unwrap_or_else(|| "(unknown)".to_string());
            self.log(
                LogLevel::Error,
                &format!("Bundle '{}' aborted on defined class '{}'", bundle, qualified),
            );
            self.bundle_aborted = true;
        }

        if self.abort_list_match(AbortList::Eval, &qualified) {
            self.log(
                LogLevel::Notice,
                &format!("Aborting agent run on defined class '{}'", qualified),
            );
            self.eval_aborted = true;
        }

        if let Some(existing) = self.class_get(ns, &canonical) {
            if existing.scope == scope {
                return false;
            }
        }

        if let Some(all) = self.all_classes.as_mut() {
            all.insert(canonical.clone());
        }

        match scope {
            ContextScope::Bundle => {
                let Some(bundle_frame) = self.last_bundle_frame_mut() else {
                    panic!("attempted to add bundle class '{}' while not evaluating a bundle", name);
                };
                bundle_frame.classes.put(ns, &canonical, is_soft, scope, tags, comment);
            }
            ContextScope::Namespace => {
                self.global_classes.put(ns, &canonical, is_soft, scope, tags, comment);
            }
        }

        if !self.bundle_aborted {
            let watched: Vec<String> = self
                .heap_abort_current_bundle
                .iter()
                .map(|item| item.expr.clone())
                .collect();
            for expr in watched {
                if self.is_defined_class(&expr) {
                    self.log(
                        LogLevel::Error,
                        &format!("Setting bundle abort for '{}' when setting class '{}'", expr, name),
                    );
                    self.bundle_aborted = true;
                    break;
                }
            }
        }

        true
    }

    /// Add a soft, bundle-scope class to the innermost bundle frame.
    pub(crate) fn stack_frame_add_soft(&mut self, context: &str, tags: &str) {
        let (frame_ns, frame_bundle) = match self.last_bundle_frame() {
            Some(bundle_frame) => {
                (bundle_frame.owner.ns.clone(), bundle_frame.owner.name.clone())
            }
            None => panic!("attempted to add a soft class on the stack, but stack had no bundle frame"),
        };

        let qualified = qualified_name(Some(&frame_ns), context);
        if qualified.is_empty() {
            return;
        }

        if self.heap_contains_soft(Some(&frame_ns), context) {
            self.log(
                LogLevel::Warning,
                &format!(
                    "Private class '{}' in bundle '{}' shadows a global class, choose a different name to avoid conflicts",
                    qualified, frame_bundle
                ),
            );
        }

        if self.abort_list_match(AbortList::CurrentBundle, &qualified) {
            self.log(
                LogLevel::Error,
                &format!("Bundle '{}' aborted on defined class '{}'", frame_bundle, qualified),
            );
            self.bundle_aborted = true;
        }

        if self.abort_list_match(AbortList::Eval, &qualified) {
            self.log(
                LogLevel::Notice,
                &format!("Aborting agent run on defined class '{}'", qualified),
            );
            self.eval_aborted = true;
        }

        if self.stack_frame_contains_soft(context) {
            return;
        }

        let bundle_frame = self.last_bundle_frame_mut().expect("checked above");
        bundle_frame.classes.put(
            Some(&frame_ns),
            context,
            true,
            ContextScope::Bundle,
            tags_from_str(tags),
            None,
        );

        if !self.bundle_aborted {
            let watched: Vec<String> = self
                .heap_abort_current_bundle
                .iter()
                .map(|item| item.expr.clone())
                .collect();
            for expr in watched {
                if self.is_defined_class(&expr) {
                    self.log(
                        LogLevel::Error,
                        &format!("Setting bundle abort for '{}' when setting '{}'", expr, context),
                    );
                    self.bundle_aborted = true;
                    break;
                }
            }
        }
    }

    /// Remove a soft class from the innermost bundle frame.
    pub fn stack_frame_remove_soft(&mut self, context: &str) {
        if let Some(bundle_frame) = self.last_bundle_frame_mut() {
            let ns = bundle_frame.owner.ns.clone();
            bundle_frame.classes.remove(Some(&ns), context);
        }
    }

    /// Bundle-local lookup first, then the global table.
    pub fn class_get(&self, ns: Option<&str>, name: &str) -> Option<&Class> {
        if let Some(bundle_frame) = self.last_bundle_frame() {
            if let Some(cls) = bundle_frame.classes.get(ns, name) {
                return Some(cls);
            }
        }
        self.global_classes.get(ns, name)
    }

    /// First class whose qualified name matches `regex`, checking the
    /// innermost bundle frame before the global table.
    pub fn class_match(&self, regex: &str) -> Option<&Class> {
        if let Some(bundle_frame) = self.last_bundle_frame() {
            if let Some(cls) = bundle_frame.classes.find_match(regex) {
                return Some(cls);
            }
        }
        self.global_classes.find_match(regex)
    }

    /// Remove a class from every bundle frame and the global table.
    pub fn class_remove(&mut self, ns: Option<&str>, name: &str) -> bool {
        for frame in &mut self.stack {
            if let FrameData::Bundle(bundle_frame) = &mut frame.data {
                bundle_frame.classes.remove(ns, name);
            }
        }
        self.global_classes.remove(ns, name)
    }

    pub fn class_tags(&self, ns: Option<&str>, name: &str) -> Option<&BTreeSet<String>> {
        self.class_get(ns, name).map(|cls| &cls.tags)
    }

    pub fn iter_global_classes<'a>(
        &'a self,
        ns: Option<&'a str>,
        include_hard: bool,
        include_soft: bool,
    ) -> impl Iterator<Item = &'a Class> {
        self.global_classes.iter_filtered(ns, include_hard, include_soft)
    }

    /// Soft classes of the innermost bundle frame; empty when no bundle
    /// is being evaluated.
    pub fn iter_local_classes(&self) -> impl Iterator<Item = &Class> {
        self.last_bundle_frame()
            .into_iter()
            .flat_map(|bundle_frame| bundle_frame.classes.iter_filtered(None, false, true))
    }

    fn classes_matching_iter<'a>(
        &self,
        iter: impl Iterator<Item = &'a Class>,
        regex: &str,
        tag_filters: &[String],
        first_only: bool,
    ) -> Vec<String> {
        let compiled = regex_lite::Regex::new(&format!("^(?:{})$", regex)).ok();
        let mut matching = Vec::new();

        for cls in iter {
            let expr = cls.expr();
            let name_hit =
                expr == regex || compiled.as_ref().map_or(false, |re| re.is_match(&expr));
            if !name_hit {
                continue;
            }

            let pass = if tag_filters.is_empty() {
                true
            } else {
                tag_filters.iter().any(|tag_rx| {
                    cls.tags
                        .iter()
                        .any(|tag| tag == tag_rx || regex_full_match(tag_rx, tag))
                })
            };

            if pass {
                matching.push(expr);
                if first_only {
                    break;
                }
            }
        }

        matching
    }

    /// Global classes (hard and soft) matching `regex`, optionally
    /// filtered to those carrying a tag matching any of `tag_filters`.
    pub fn classes_matching_global(
        &self,
        regex: &str,
        tag_filters: &[String],
        first_only: bool,
    ) -> Vec<String> {
        self.classes_matching_iter(
            self.global_classes.iter_filtered(None, true, true),
            regex,
            tag_filters,
            first_only,
        )
    }

    /// Bundle-local soft classes matching `regex`, walking down through
    /// inheriting frames.
    pub fn classes_matching_local(
        &self,
        regex: &str,
        tag_filters: &[String],
        first_only: bool,
    ) -> Vec<String> {
        let mut matching = Vec::new();
        for frame in self.stack.iter().rev() {
            if let FrameData::Bundle(bundle_frame) = &frame.data {
                let found = self.classes_matching_iter(
                    bundle_frame.classes.iter_filtered(None, false, true),
                    regex,
                    tag_filters,
                    first_only,
                );
                matching.extend(found);
                if first_only && !matching.is_empty() {
                    break;
                }
            }
            if !frame.inherits_previous {
                break;
            }
        }
        matching
    }

    fn heap_contains_soft(&self, ns: Option<&str>, name: &str) -> bool {
        self.global_classes.get(ns, name).map_or(false, |cls| cls.is_soft)
    }

    fn heap_contains_hard(&self, name: &str) -> bool {
        self.global_classes.get(None, name).map_or(false, |cls| !cls.is_soft)
    }

    pub(crate) fn heap_contains_hard_class(&self, name: &str) -> bool {
        self.heap_contains_hard(name)
    }

    /// Walk the stack top-down looking for a soft class in bundle
    /// frames, following `inherits_previous` until a frame clears it.
    fn stack_frame_contains_soft(&self, context: &str) -> bool {
        for frame in self.stack.iter().rev() {
            if let FrameData::Bundle(bundle_frame) = &frame.data {
                if bundle_frame
                    .classes
                    .get(Some(&bundle_frame.owner.ns), context)
                    .is_some()
                {
                    return true;
                }
            }
            if !frame.inherits_previous {
                return false;
            }
        }
        false
    }

    fn class_token_defined(&self, token: &str, ns_override: Option<&str>) -> bool {
        let mut cref = ClassRef::parse(token);

        if cref.is_qualified() {
            if cref.namespace() == "default" && self.heap_contains_hard(&cref.name) {
                return true;
            }
        } else {
            if self.heap_contains_hard(&cref.name) {
                return true;
            }
            let ns = ns_override
                .map(|s| s.to_string())
                .or_else(|| self.current_namespace())
                .unwrap_or_else(|| "default".to_string());
            cref.qualify(&ns);
        }

        cref.name == "any"
            || self.heap_contains_soft(Some(cref.namespace()), &cref.name)
            || self.stack_frame_contains_soft(&cref.name)
    }

    /// Evaluate a class expression against the current context.
    pub fn check_class_expression(&self, expr: &str) -> ExpressionValue {
        expression::check_expression(expr, &|token| self.class_token_defined(token, None))
    }

    pub fn is_defined_class(&self, expr: &str) -> bool {
        self.check_class_expression(expr) == ExpressionValue::True
    }

    /// As [`Self::is_defined_class`], resolving unqualified soft tokens
    /// in the given namespace instead of the current one.
    pub fn is_defined_class_in(&self, expr: &str, ns: &str) -> bool {
        expression::check_expression(expr, &|token| self.class_token_defined(token, Some(ns)))
            == ExpressionValue::True
    }

    // ========================================================================
    // Class history
    // ========================================================================

    pub fn all_classes_logging_enable(&mut self, enable: bool) {
        if enable {
            self.all_classes.get_or_insert_with(HashSet::new);
        } else {
            self.all_classes = None;
        }
    }

    pub fn all_classes(&self) -> Option<&HashSet<String>> {
        self.all_classes.as_ref()
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn table_for_scope(&self, _ns: Option<&str>, scope: Option<&str>) -> Option<&VariableTable> {
        match SpecialScope::from_opt(scope) {
            SpecialScope::Def
            | SpecialScope::Sys
            | SpecialScope::Mon
            | SpecialScope::Const
            | SpecialScope::None => Some(&self.global_variables),
            SpecialScope::Match => Some(&self.match_variables),
            SpecialScope::Edit => self.last_bundle_frame().map(|f| &f.vars),
            SpecialScope::Body => self.stack.iter().rev().find_map(|frame| match &frame.data {
                FrameData::Body(body_frame) => Some(&body_frame.vars),
                _ => None,
            }),
            SpecialScope::This => self.stack.iter().rev().find_map(|frame| match &frame.data {
                FrameData::Promise(promise_frame) => Some(&promise_frame.vars),
                _ => None,
            }),
        }
    }

    fn table_for_scope_mut(
        &mut self,
        _ns: Option<&str>,
        scope: Option<&str>,
    ) -> Option<&mut VariableTable> {
        match SpecialScope::from_opt(scope) {
            SpecialScope::Def
            | SpecialScope::Sys
            | SpecialScope::Mon
            | SpecialScope::Const
            | SpecialScope::None => Some(&mut self.global_variables),
            SpecialScope::Match => Some(&mut self.match_variables),
            SpecialScope::Edit => self.last_bundle_frame_mut().map(|f| &mut f.vars),
            SpecialScope::Body => {
                self.stack.iter_mut().rev().find_map(|frame| match &mut frame.data {
                    FrameData::Body(body_frame) => Some(&mut body_frame.vars),
                    _ => None,
                })
            }
            SpecialScope::This => {
                self.stack.iter_mut().rev().find_map(|frame| match &mut frame.data {
                    FrameData::Promise(promise_frame) => Some(&mut promise_frame.vars),
                    _ => None,
                })
            }
        }
    }

    pub fn variable_put(
        &mut self,
        reference: &VarRef,
        value: Value,
        dtype: DataType,
        tags: &str,
    ) -> bool {
        self.variable_put_with_comment(reference, value, dtype, tags, None)
    }

    pub fn variable_put_with_comment(
        &mut self,
        reference: &VarRef,
        value: Value,
        dtype: DataType,
        tags: &str,
        comment: Option<&str>,
    ) -> bool {
        assert!(dtype != DataType::None, "cannot store a variable of type none");
        assert!(
            !value.is_none() || dtype.is_iterable(),
            "only iterable types may hold the empty value"
        );

        if reference.lval.len() > MAX_NAME_LEN {
            log::error!(
                "Variable '{}' cannot be added because its length exceeds the maximum length allowed ({} characters)",
                reference,
                MAX_NAME_LEN
            );
            return false;
        }

        if reference.scope.as_deref() != Some("body") && is_self_referential(reference, &value) {
            return false;
        }

        let promise = self.stack_current_promise_rc();
        let Some(table) = self.table_for_scope_mut(reference.ns.as_deref(), reference.scope.as_deref())
        else {
            log::error!("No variable table reachable for scope of '{}'", reference);
            return false;
        };

        table.put(
            reference.clone(),
            value,
            dtype,
            tags_from_str(tags),
            comment.map(|s| s.to_string()),
            promise,
        );
        true
    }

    pub fn variable_put_special(
        &mut self,
        scope: SpecialScope,
        lval: &str,
        value: Value,
        dtype: DataType,
        tags: &str,
    ) -> bool {
        self.variable_put_special_with_comment(scope, lval, value, dtype, tags, None)
    }

    /// As [`Self::variable_put_special`], applying the dot-to-separator
    /// mangling for scoped names placed into a special scope.
    pub fn variable_put_special_with_comment(
        &mut self,
        scope: SpecialScope,
        lval: &str,
        value: Value,
        dtype: DataType,
        tags: &str,
        comment: Option<&str>,
    ) -> bool {
        let mut mangled = None;
        if lval.contains('.') {
            let parsed = VarRef::parse(lval);
            if let Some(inner_scope) = parsed.scope {
                mangled = Some(mangle_scoped_name(&inner_scope, lval));
            }
        }
        let effective = mangled.as_deref().unwrap_or(lval);

        let reference = if effective.contains('[') {
            VarRef::parse_from_scope(effective, scope.as_str())
        } else {
            VarRef::new(None, Some(scope.as_str()), effective)
        };
        self.variable_put_with_comment(&reference, value, dtype, tags, comment)
    }

    fn stack_qualify_ref(&self, reference: &mut VarRef) {
        let Some(last) = self.stack.last() else {
            return;
        };
        match &last.data {
            FrameData::Body(_) => reference.qualify(None, SpecialScope::Body.as_str()),
            FrameData::BundleSection(_) => {
                let below = self
                    .stack
                    .get(self.stack.len() - 2)
                    .expect("bundle-section frames always have a bundle below");
                let FrameData::Bundle(bundle_frame) = &below.data else {
                    panic!("bundle-section frames always have a bundle below");
                };
                reference.qualify(Some(&bundle_frame.owner.ns), &bundle_frame.owner.name);
            }
            FrameData::Bundle(bundle_frame) => {
                reference.qualify(Some(&bundle_frame.owner.ns), &bundle_frame.owner.name);
            }
            FrameData::Promise(_) | FrameData::PromiseIteration(_) => {
                reference.qualify(None, SpecialScope::This.as_str());
            }
        }
    }

    fn variable_resolve_inner(&self, reference: &VarRef) -> Option<&Variable> {
        let table = self.table_for_scope(reference.ns.as_deref(), reference.scope.as_deref())?;
        let sscope = SpecialScope::from_opt(reference.scope.as_deref());

        // Special scopes hold iteration and frame variables without a
        // namespace in their stored ref, so a namespace on the query must
        // be ignored; 'def.' is the exception, it is not so special.
        let found = if sscope != SpecialScope::None
            && sscope != SpecialScope::Def
            && reference.ns.is_some()
        {
            let mut stripped = reference.clone();
            stripped.ns = None;
            table.get(&stripped)
        } else {
            table.get(reference)
        };
        if found.is_some() {
            return found;
        }

        if !reference.indices.is_empty() {
            // A scoped, indexed reference may have been stored under its
            // mangled name in the 'this' table by list iteration.
            if reference.scope.is_some() {
                if let Some(this_table) =
                    self.table_for_scope(None, Some(SpecialScope::This.as_str()))
                {
                    let mangled = reference.mangled_this();
                    if let Some(var) = this_table.get(&mangled) {
                        return Some(var);
                    }
                }
            }

            // The indices may address children of a container stored
            // under the indexless base reference.
            let base = reference.copy_indexless();
            if let Some(var) = table.get(&base) {
                if var.data_type() == DataType::Container {
                    return Some(var);
                }
            }
        }

        None
    }

    fn variable_resolve(&self, reference: &VarRef) -> Option<&Variable> {
        if let Some(var) = self.variable_resolve_inner(reference) {
            return Some(var);
        }

        // Qualify an unqualified reference to the current frame and
        // retry once.
        let mut scoped = None;
        if !reference.is_qualified() && !self.stack.is_empty() {
            let mut qualified = reference.clone();
            self.stack_qualify_ref(&mut qualified);
            if let Some(var) = self.variable_resolve_inner(&qualified) {
                return Some(var);
            }
            scoped = Some(qualified);
        }

        // Inside a promise or body the variable may belong to the last
        // bundle; retry once more with the bundle qualifier.
        let base = scoped.as_ref().unwrap_or(reference);
        let sscope = SpecialScope::from_opt(base.scope.as_deref());
        if sscope == SpecialScope::This || sscope == SpecialScope::Body {
            if let Some(bundle) = self.stack_current_bundle() {
                let mut retried = base.clone();
                retried.qualify(Some(&bundle.ns), &bundle.name);
                return self.variable_resolve_inner(&retried);
            }
        }

        None
    }

    /// Resolve a reference to its value and type. An unresolved
    /// reference yields `(None, DataType::None)`; a resolved list-typed
    /// variable holding the empty list yields `(Some(Value::None),
    /// <list type>)`.
    pub fn variable_get(&self, reference: &VarRef) -> (Option<Value>, DataType) {
        let Some(var) = self.variable_resolve(reference) else {
            return (None, DataType::None);
        };

        let dtype = var.data_type();
        if var.reference().indices.is_empty()
            && !reference.indices.is_empty()
            && dtype == DataType::Container
        {
            if let Value::Container(json) = var.value() {
                if let Some(child) = json_select(json, &reference.indices) {
                    return (Some(Value::Container(child.clone())), DataType::Container);
                }
            }
            return (None, DataType::None);
        }

        (Some(var.value().clone()), dtype)
    }

    pub fn variable_get_special(
        &self,
        scope: SpecialScope,
        lval: &str,
    ) -> (Option<Value>, DataType) {
        let reference = VarRef::parse_from_scope(lval, scope.as_str());
        self.variable_get(&reference)
    }

    pub fn variable_remove(&mut self, reference: &VarRef) -> bool {
        match self.table_for_scope_mut(reference.ns.as_deref(), reference.scope.as_deref()) {
            Some(table) => table.remove(reference),
            None => false,
        }
    }

    pub fn variable_remove_special(&mut self, scope: SpecialScope, lval: &str) -> bool {
        match scope {
            SpecialScope::Sys
            | SpecialScope::Mon
            | SpecialScope::Const
            | SpecialScope::Edit
            | SpecialScope::Body
            | SpecialScope::This => {
                let reference = VarRef::parse_from_scope(lval, scope.as_str());
                self.variable_remove(&reference)
            }
            _ => {
                log::error!("attempted to remove non-special variable '{}' via special scope", lval);
                false
            }
        }
    }

    pub fn variable_tags(&self, reference: &VarRef) -> Option<&BTreeSet<String>> {
        self.variable_resolve(reference).map(|var| var.tags())
    }

    /// The promise that assigned the variable, when any.
    pub fn variable_promise_get(&self, reference: &VarRef) -> Option<Rc<Promise>> {
        self.variable_resolve(reference).and_then(|var| var.promise().cloned())
    }

    pub fn variable_clear_match(&mut self) -> bool {
        self.match_variables.clear(None, None, None)
    }

    /// Variables matching the given filters, routed by scope like any
    /// other lookup. A missing frame for a frame-bound scope yields the
    /// empty set.
    pub fn variables_matching<'a>(
        &'a self,
        ns: Option<&'a str>,
        scope: Option<&'a str>,
        lval: Option<&'a str>,
    ) -> Vec<&'a Variable> {
        let table = match scope {
            Some(_) => self.table_for_scope(ns, scope),
            None => Some(&self.global_variables),
        };
        table
            .map(|t| t.iter_filtered(ns, scope, lval).collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Stack
    // ========================================================================

    fn push_frame(&mut self, frame: StackFrame) {
        if let Some(StackFrame { data: FrameData::PromiseIteration(_), .. }) = self.stack.last() {
            self.reset_effective_levels();
        }

        self.stack.push(frame);
        let path = frame::render_stack_path(&self.stack);
        let last = self.stack.last_mut().expect("frame just pushed");
        last.path = path;
        log::debug!("pushed frame (type {})", last.type_name());
    }

    pub fn stack_push_bundle(&mut self, owner: &Rc<Bundle>, args: &[Value], inherits_previous: bool) {
        let legal = match self.stack.last() {
            None => true,
            Some(frame) => matches!(frame.data, FrameData::PromiseIteration(_)),
        };
        assert!(legal, "bundle frames go on an empty stack or atop a promise iteration");

        self.push_frame(StackFrame::new_bundle(owner.clone(), inherits_previous));

        if !args.is_empty() {
            self.scope_augment(owner, args);
        }

        // Variables previously defined under this bundle's qualifier are
        // re-expanded through the current context, making outer
        // definitions visible under this bundle.
        let updates: Vec<(VarRef, Value)> = self
            .global_variables
            .iter_filtered(Some(&owner.ns), Some(&owner.name), None)
            .map(|var| {
                let expanded =
                    expand::expand_value(self, var.value(), Some(&owner.ns), Some(&owner.name));
                (var.reference().clone(), expanded)
            })
            .collect();
        for (reference, value) in updates {
            self.global_variables.set_value(&reference, value);
        }
    }

    fn scope_augment(&mut self, owner: &Rc<Bundle>, args: &[Value]) {
        if owner.args.len() != args.len() {
            let source = owner.source_path.as_deref().unwrap_or("(unknown)");
            self.log(
                LogLevel::Error,
                &format!(
                    "Argument arity mismatch in bundle '{}' (source '{}'): expected {}, got {}",
                    owner.name,
                    source,
                    owner.args.len(),
                    args.len()
                ),
            );
            return;
        }

        for (param, arg) in owner.args.iter().zip(args) {
            let reference = VarRef {
                ns: Some(owner.ns.clone()),
                scope: Some(owner.name.clone()),
                lval: param.clone(),
                indices: Vec::new(),
            };
            self.variable_put(&reference, arg.clone(), dtype_for_value(arg), "source=promise");
        }
    }

    /// Push a body frame. Requires a bundle-section predecessor; use
    /// [`Self::stack_push_control_body`] for a control body at the
    /// bottom of the stack.
    pub fn stack_push_body(&mut self, caller: Option<&Promise>, body: &Rc<Body>, args: &[Value]) {
        assert!(
            matches!(self.stack.last().map(|f| &f.data), Some(FrameData::BundleSection(_))),
            "body frames require a bundle-section predecessor"
        );
        self.push_body_frame(caller, body, args);
    }

    /// Push a control body onto an empty stack. The only legal way to
    /// have a body frame at the bottom.
    pub fn stack_push_control_body(&mut self, body: &Rc<Body>) {
        assert!(self.stack.is_empty(), "control bodies go at the bottom of the stack");
        assert!(body.args.is_empty(), "control bodies take no arguments");
        self.push_body_frame(None, body, &[]);
    }

    fn push_body_frame(&mut self, caller: Option<&Promise>, body: &Rc<Body>, args: &[Value]) {
        self.push_frame(StackFrame::new_body(body.clone()));

        if body.args.len() != args.len() {
            match caller {
                Some(caller) => self.log(
                    LogLevel::Error,
                    &format!(
                        "Argument arity mismatch in body '{}' at line {} in file '{}': expected {}, got {}",
                        body.name,
                        caller.line,
                        caller.source_path.as_deref().unwrap_or("(unknown)"),
                        body.args.len(),
                        args.len()
                    ),
                ),
                None => panic!("control body stack frame was pushed with arguments"),
            }
            return;
        }

        for (param, arg) in body.args.iter().zip(args) {
            let reference = VarRef::new(None, Some(SpecialScope::Body.as_str()), param);
            self.variable_put(&reference, arg.clone(), dtype_for_value(arg), "source=body");
        }
    }

    pub fn stack_push_bundle_section(&mut self, owner: &Rc<BundleSection>) {
        assert!(
            matches!(self.stack.last().map(|f| &f.data), Some(FrameData::Bundle(_))),
            "bundle-section frames require a bundle predecessor"
        );
        self.push_frame(StackFrame::new_bundle_section(owner.clone()));
    }

    pub fn stack_push_promise(&mut self, owner: &Rc<Promise>) {
        assert!(
            matches!(self.stack.last().map(|f| &f.data), Some(FrameData::BundleSection(_))),
            "promise frames require a bundle-section predecessor"
        );

        self.variable_clear_match();
        self.push_frame(StackFrame::new_promise(owner.clone()));

        let pp = owner.clone();
        if let Some(source_path) = &pp.source_path {
            let path = match (&self.launch_directory, source_path.starts_with('/')) {
                (Some(launch_dir), false) => format!("{}/{}", launch_dir, source_path),
                _ => source_path.clone(),
            };
            self.variable_put_special(
                SpecialScope::This,
                "promise_filename",
                Value::scalar(&path),
                DataType::String,
                "source=promise",
            );
            self.variable_put_special(
                SpecialScope::This,
                "promise_dirname",
                Value::scalar(dirname_of(&path)),
                DataType::String,
                "source=promise",
            );
            self.variable_put_special(
                SpecialScope::This,
                "promise_linenumber",
                Value::scalar(pp.line.to_string()),
                DataType::String,
                "source=promise",
            );
        }

        let identity = [
            ("promiser_uid", self.uid),
            ("promiser_gid", self.gid),
            ("promiser_pid", self.pid),
            ("promiser_ppid", self.ppid),
        ];
        for (name, id) in identity {
            self.variable_put_special(
                SpecialScope::This,
                name,
                Value::scalar(id.to_string()),
                DataType::Int,
                "source=agent",
            );
        }

        self.variable_put_special(
            SpecialScope::This,
            "promiser",
            Value::scalar(&pp.promiser),
            DataType::String,
            "source=promise",
        );
        self.variable_put_special(
            SpecialScope::This,
            "bundle",
            Value::scalar(&pp.bundle_name),
            DataType::String,
            "source=promise",
        );
        self.variable_put_special(
            SpecialScope::This,
            "namespace",
            Value::scalar(&pp.bundle_ns),
            DataType::String,
            "source=promise",
        );
        if let Some(handle) = pp.handle() {
            self.variable_put_special(
                SpecialScope::This,
                "handle",
                Value::scalar(handle),
                DataType::String,
                "source=promise",
            );
        }

        if let Some(with) = pp.constraint("with") {
            let expanded = expand::expand_value(self, with, None, Some("this"));
            if let Value::Scalar(text) = &expanded {
                if !expand::contains_any_var_token(text) {
                    self.variable_put_special(
                        SpecialScope::This,
                        "with",
                        Value::scalar(text),
                        DataType::String,
                        "source=promise_iteration/with",
                    );
                }
            }
        }
    }

    /// Expand the current promise and push its iteration frame. Returns
    /// the expanded promise, or `None` when the promise's class context
    /// excludes it; nothing is pushed in that case.
    pub fn stack_push_promise_iteration(&mut self, index: usize) -> Option<Promise> {
        let owner = match self.stack.last().map(|f| &f.data) {
            Some(FrameData::Promise(promise_frame)) => promise_frame.owner.clone(),
            _ => panic!("promise-iteration frames require a promise predecessor"),
        };

        let expanded = expand::expand_promise(self, &owner)?;
        self.push_frame(StackFrame::new_promise_iteration(expanded.clone(), index));
        self.apply_promise_log_levels(&expanded);
        Some(expanded)
    }

    pub fn stack_pop(&mut self) {
        assert!(!self.stack.is_empty(), "cannot pop an empty stack");

        if let Some(StackFrame { data: FrameData::Bundle(bundle_frame), .. }) =
            self.stack.last_mut()
        {
            let bundle_type = bundle_frame.owner.bundle_type.clone();
            if bundle_type == "edit_line" || bundle_type == "edit_xml" {
                bundle_frame.vars.clear(Some("default"), Some(SpecialScope::Edit.as_str()), None);
            }
        }

        let popped = self.stack.pop().expect("stack checked non-empty");
        if matches!(popped.data, FrameData::PromiseIteration(_)) {
            self.reset_effective_levels();
        }

        // returning into an enclosing iteration restores its levels
        if let Some(StackFrame { data: FrameData::PromiseIteration(iteration), .. }) =
            self.stack.last()
        {
            let pp = iteration.owner.clone();
            self.apply_promise_log_levels(&pp);
        }

        log::debug!("popped frame (type {})", popped.type_name());
    }

    fn last_bundle_frame(&self) -> Option<&BundleFrame> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::Bundle(bundle_frame) => Some(bundle_frame),
            _ => None,
        })
    }

    fn last_bundle_frame_mut(&mut self) -> Option<&mut BundleFrame> {
        self.stack.iter_mut().rev().find_map(|frame| match &mut frame.data {
            FrameData::Bundle(bundle_frame) => Some(bundle_frame),
            _ => None,
        })
    }

    pub(crate) fn current_namespace(&self) -> Option<String> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::Bundle(bundle_frame) => Some(bundle_frame.owner.ns.clone()),
            FrameData::Body(body_frame) => Some(body_frame.owner.ns.clone()),
            _ => None,
        })
    }

    /// The current stack path, empty when the stack is.
    pub fn stack_path(&self) -> String {
        self.stack.last().map(|frame| frame.path.clone()).unwrap_or_default()
    }

    pub fn stack_to_string(&self) -> String {
        self.stack_path()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_current_bundle(&self) -> Option<&Rc<Bundle>> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::Bundle(bundle_frame) => Some(&bundle_frame.owner),
            _ => None,
        })
    }

    /// The expanded promise of the innermost iteration frame.
    pub fn stack_current_promise(&self) -> Option<&Promise> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::PromiseIteration(iteration) => Some(&iteration.owner),
            _ => None,
        })
    }

    fn stack_current_promise_rc(&self) -> Option<Rc<Promise>> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::Promise(promise_frame) => Some(promise_frame.owner.clone()),
            _ => None,
        })
    }

    /// The message ring buffer of the innermost iteration frame.
    pub fn stack_current_messages(&self) -> Option<&RingBuffer> {
        self.stack.iter().rev().find_map(|frame| match &frame.data {
            FrameData::PromiseIteration(iteration) => Some(&iteration.log_messages),
            _ => None,
        })
    }

    /// Promisees of every iteration frame on the stack.
    pub fn stack_promisees(&self) -> BTreeSet<String> {
        let mut promisees = BTreeSet::new();
        for frame in &self.stack {
            let FrameData::PromiseIteration(iteration) = &frame.data else {
                continue;
            };
            match &iteration.owner.promisee {
                Some(Value::Scalar(text)) => {
                    promisees.insert(text.clone());
                }
                Some(Value::List(items)) => {
                    for item in items {
                        if let Value::Scalar(text) = item {
                            promisees.insert(text.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        promisees
    }

    /// Promisers of `methods` promises on the stack, outermost first.
    pub fn promise_caller_methods(&self) -> Vec<String> {
        self.stack
            .iter()
            .filter_map(|frame| match &frame.data {
                FrameData::Promise(promise_frame)
                    if promise_frame.owner.promise_type == "methods" =>
                {
                    Some(promise_frame.owner.promiser.clone())
                }
                _ => None,
            })
            .collect()
    }

    // ========================================================================
    // Dependencies and promise locks
    // ========================================================================

    /// True when the promise's `depends_on` names a handle that has not
    /// been satisfied yet (or is not a scalar); such promises are
    /// skipped.
    pub fn missing_dependencies(&self, pp: &Promise) -> bool {
        let Some(deps) = pp.constraint("depends_on") else {
            return false;
        };

        let handles: Vec<&Value> = match deps {
            Value::List(items) => items.iter().collect(),
            single @ Value::Scalar(_) => vec![single],
            Value::None => return false,
            _ => return true,
        };

        for handle in handles {
            let Some(name) = handle.as_scalar() else {
                return true;
            };
            if !self.dependency_handles.contains(name) {
                log::debug!(
                    "Skipping promise '{}', as promise dependency '{}' has not yet been kept",
                    pp.promiser,
                    name
                );
                return true;
            }
        }

        false
    }

    pub fn promise_lock_cache_contains(&self, key: &str) -> bool {
        self.promise_lock_cache.contains(key)
    }

    pub fn promise_lock_cache_put(&mut self, key: &str) {
        self.promise_lock_cache.insert(key.to_string());
    }

    pub fn promise_lock_cache_remove(&mut self, key: &str) {
        self.promise_lock_cache.remove(key);
    }

    // ========================================================================
    // Function cache
    // ========================================================================

    fn function_cache_key(fn_name: &str, args: &[Value]) -> String {
        let mut key = String::new();
        Value::Scalar(fn_name.to_string()).render_key(&mut key);
        for arg in args {
            arg.render_key(&mut key);
        }
        key
    }

    /// Cached result for `(fn_name, args)`, if caching is enabled and a
    /// structurally equal key was stored. The value is returned by
    /// reference; callers copy before mutating.
    pub fn function_cache_get(&self, fn_name: &str, args: &[Value]) -> Option<&Value> {
        if !self.cache_system_functions {
            return None;
        }
        self.function_cache.get(&Self::function_cache_key(fn_name, args))
    }

    pub fn function_cache_put(&mut self, fn_name: &str, args: &[Value], value: Value) {
        if !self.cache_system_functions {
            return;
        }
        self.function_cache
            .insert(Self::function_cache_key(fn_name, args), value);
    }

    // ========================================================================
    // Persistent classes
    // ========================================================================

    pub fn set_state_store(&mut self, store: Box<dyn StateStore>) {
        self.state_store = store;
    }

    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.clock_skew
    }

    fn id_ref_qualify(&self, id: &str) -> ClassRef {
        let mut cref = ClassRef::parse(id);
        if !cref.is_qualified() {
            let ns = self.current_namespace().unwrap_or_else(|| "default".to_string());
            cref.qualify(&ns);
        }
        cref
    }

    pub fn persistent_save(
        &mut self,
        name: &str,
        ttl_minutes: u32,
        policy: StatePolicy,
        tags: &str,
    ) {
        let now = self.now();
        self.persistent_save_at(name, ttl_minutes, policy, tags, now);
    }

    pub(crate) fn persistent_save_at(
        &mut self,
        name: &str,
        ttl_minutes: u32,
        policy: StatePolicy,
        tags: &str,
        now: i64,
    ) {
        let key = self.id_ref_qualify(name).to_string();

        match self.state_store.read(&key) {
            Ok(Some(existing))
                if existing.policy == StatePolicy::Preserve
                    && now < existing.expires
                    && existing.tags == tags =>
            {
                let minutes_left = (existing.expires - now) / 60;
                self.log(
                    LogLevel::Verbose,
                    &format!(
                        "Persistent class '{}' is already in a preserved state, {} minutes to go",
                        key, minutes_left
                    ),
                );
                return;
            }
            Err(err) => {
                log::error!("While persisting class '{}', error reading existing value: {}", key, err);
                return;
            }
            _ => {}
        }

        self.log(LogLevel::Verbose, &format!("Updating persistent class '{}'", key));

        let entry = PersistEntry {
            expires: now + i64::from(ttl_minutes) * 60,
            policy,
            tags: tags.to_string(),
        };
        if let Err(err) = self.state_store.write(&key, entry) {
            log::error!("While persisting class '{}', error writing record: {}", key, err);
        }
    }

    pub fn persistent_remove(&mut self, name: &str) {
        if let Err(err) = self.state_store.delete(name) {
            log::error!("While removing persistent class '{}': {}", name, err);
            return;
        }
        log::debug!("Deleted persistent class '{}'", name);
    }

    /// Load every valid persistent class into the global table, pruning
    /// expired records. Names in the negated-classes filter are skipped.
    pub fn persistent_load_all(&mut self) {
        let now = self.now();
        self.persistent_load_all_at(now);
    }

    pub(crate) fn persistent_load_all_at(&mut self, now: i64) {
        self.log(LogLevel::Verbose, "Loading persistent classes");

        let entries = match self.state_store.scan() {
            Ok(entries) => entries,
            Err(err) => {
                log::info!("Unable to scan the persistence store: {}", err);
                return;
            }
        };

        for (key, info) in entries {
            if now >= info.expires {
                self.log(LogLevel::Verbose, &format!("Persistent class '{}' expired", key));
                if let Err(err) = self.state_store.delete(&key) {
                    log::error!("While pruning persistent class '{}': {}", key, err);
                }
                continue;
            }

            if self.negated_classes.contains(&key) {
                self.log(
                    LogLevel::Verbose,
                    &format!("Not adding persistent class '{}' due to negation", key),
                );
                continue;
            }

            let minutes_left = (info.expires - now) / 60;
            self.log(
                LogLevel::Verbose,
                &format!("Persistent class '{}' for {} more minutes", key, minutes_left),
            );

            let cref = ClassRef::parse(&key);
            let mut tags = tags_from_str(&info.tags);
            tags.insert("source=persistent".to_string());
            self.class_put(cref.ns.as_deref(), &cref.name, true, ContextScope::Namespace, tags, None);
        }
    }

    // ========================================================================
    // IP addresses, bundle names, remote variable promises
    // ========================================================================

    pub fn add_ip_address(&mut self, ip_address: &str, iface: Option<&str>) {
        self.ip_addresses
            .push((ip_address.to_string(), iface.unwrap_or("").to_string()));
    }

    pub fn ip_addresses(&self) -> &[(String, String)] {
        &self.ip_addresses
    }

    pub fn delete_ip_addresses(&mut self) {
        self.ip_addresses.clear();
    }

    pub fn push_bundle_name(&mut self, bundle_name: &str) {
        self.bundle_names.insert(bundle_name.to_string());
    }

    pub fn bundle_names(&self) -> &HashSet<String> {
        &self.bundle_names
    }

    pub fn push_remote_var_promise(&mut self, bundle_name: &str, promise: Rc<Promise>) {
        self.remote_var_promises
            .entry(bundle_name.to_string())
            .or_default()
            .push(promise);
    }

    pub fn remote_var_promises(&self, bundle_name: &str) -> Option<&[Rc<Promise>]> {
        self.remote_var_promises.get(bundle_name).map(|v| v.as_slice())
    }

    // ========================================================================
    // Bundle and body resolution
    // ========================================================================

    /// Resolve a possibly unqualified bundle reference against a policy.
    pub fn resolve_bundle_expression(
        &self,
        policy: &Policy,
        callee_reference: &str,
        callee_type: &str,
    ) -> Option<Rc<Bundle>> {
        let cref = self.id_ref_qualify(callee_reference);
        policy
            .bundles
            .iter()
            .find(|bundle| {
                bundle.bundle_type == callee_type
                    && bundle.name == cref.name
                    && bundle.ns == cref.namespace()
            })
            .cloned()
    }

    /// Resolve a body reference to the body plus its `inherit_from`
    /// chain, nearest parent first. The chain depth is capped.
    pub fn resolve_body_expression(
        &self,
        policy: &Policy,
        callee_reference: &str,
        callee_type: &str,
    ) -> Vec<Rc<Body>> {
        let cref = self.id_ref_qualify(callee_reference);
        let Some(first) = find_first_matching_body(policy, callee_type, cref.namespace(), &cref.name)
        else {
            return Vec::new();
        };

        let mut chain = vec![first.clone()];
        self.append_body_parents(policy, &mut chain, &first, callee_type, 1);
        chain
    }

    fn append_body_parents(
        &self,
        policy: &Policy,
        chain: &mut Vec<Rc<Body>>,
        body: &Rc<Body>,
        callee_type: &str,
        depth: usize,
    ) {
        if depth > 30 {
            log::error!(
                "body inheritance chain in body '{}' is too deep, stopping resolution",
                body.name
            );
            return;
        }

        for constraint in &body.constraints {
            if constraint.lval != "inherit_from" {
                continue;
            }
            let call = match &constraint.rval {
                Value::Scalar(text) => text.clone(),
                Value::FnCall(call) => call.name.clone(),
                _ => continue,
            };

            let parent_ref = self.id_ref_qualify(&call);
            if parent_ref.name == body.name {
                log::error!("self body inheritance in '{}', stopping resolution", body.name);
                return;
            }

            if let Some(parent) =
                find_first_matching_body(policy, callee_type, parent_ref.namespace(), &parent_ref.name)
            {
                chain.push(parent.clone());
                self.append_body_parents(policy, chain, &parent, callee_type, depth + 1);
            }
        }
    }

    // ========================================================================
    // Chroot projection
    // ========================================================================

    /// Configure the simulation root; one-shot.
    pub fn set_changes_chroot(&mut self, root: &str) {
        self.changes_chroot.set(root);
    }

    pub fn changes_chroot_set(&self) -> bool {
        self.changes_chroot.is_set()
    }

    pub fn to_changes_chroot(&self, path: &str) -> String {
        self.changes_chroot.to_chroot(path)
    }

    pub fn to_normal_root(&self, path: &str) -> String {
        self.changes_chroot.to_normal(path)
    }
}

/// First body in the policy with the given type, namespace and name.
pub fn find_first_matching_body(
    policy: &Policy,
    body_type: &str,
    ns: &str,
    name: &str,
) -> Option<Rc<Body>> {
    policy
        .bodies
        .iter()
        .find(|body| body.body_type == body_type && body.name == name && body.ns == ns)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::Constraint;
    use serde_json::json;

    fn agent_bundle(name: &str) -> Rc<Bundle> {
        Rc::new(Bundle::new("default", name, "agent"))
    }

    /// Build a bundle holding one section with one promise and push
    /// bundle, section and promise frames.
    fn push_promise_env(ctx: &mut EvalContext, bundle_name: &str, promise: Promise) -> Rc<Promise> {
        let mut bundle = Bundle::new("default", bundle_name, "agent");
        let mut section = BundleSection::new(&promise.promise_type);
        let pp = section.add_promise(promise.in_bundle("default", bundle_name));
        let section = bundle.add_section(section);
        let bundle = Rc::new(bundle);

        ctx.stack_push_bundle(&bundle, &[], false);
        ctx.stack_push_bundle_section(&section);
        ctx.stack_push_promise(&pp);
        pp
    }

    // ---- classes ----

    #[test]
    fn test_class_lifecycle() {
        let mut ctx = EvalContext::new();
        assert!(ctx.class_put_soft("My-Fact", ContextScope::Namespace, "t=1"));
        let cls = ctx.class_get(None, "my_fact").unwrap();
        assert!(cls.is_soft);
        assert!(cls.tags.contains("t=1"));

        // identical put is refused, the entry is unchanged
        assert!(!ctx.class_put_soft("my_fact", ContextScope::Namespace, ""));

        assert!(ctx.class_remove(None, "my_fact"));
        assert!(ctx.class_get(None, "my_fact").is_none());
    }

    #[test]
    fn test_hard_classes_live_in_default_namespace() {
        let mut ctx = EvalContext::new();
        assert!(ctx.class_put_hard("linux", "inventory"));
        let cls = ctx.class_get(None, "linux").unwrap();
        assert!(!cls.is_soft);
        assert!(ctx.is_defined_class("linux"));
        assert!(ctx.is_defined_class("default:linux"));
    }

    #[test]
    fn test_any_is_always_defined() {
        let ctx = EvalContext::new();
        assert!(ctx.is_defined_class("any"));
        assert!(!ctx.is_defined_class("!any"));
    }

    #[test]
    fn test_namespaced_soft_classes() {
        let mut ctx = EvalContext::new();
        ctx.class_put_soft_ns("ops", "web", ContextScope::Namespace, "");
        assert!(!ctx.is_defined_class("web"));
        assert!(ctx.is_defined_class("ops:web"));
        assert!(ctx.is_defined_class_in("web", "ops"));
    }

    #[test]
    fn test_bundle_scope_requires_bundle_frame() {
        let mut ctx = EvalContext::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.class_put_soft("local", ContextScope::Bundle, "");
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_bundle_classes_die_with_frame() {
        let mut ctx = EvalContext::new();
        ctx.stack_push_bundle(&agent_bundle("main"), &[], false);
        ctx.class_put_soft("ephemeral", ContextScope::Bundle, "");
        assert!(ctx.is_defined_class("ephemeral"));
        ctx.stack_pop();
        assert!(!ctx.is_defined_class("ephemeral"));
    }

    #[test]
    fn test_class_visibility_follows_inheritance_flag() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "outer", Promise::new("inner", "methods"));
        ctx.class_put_soft("outer_cls", ContextScope::Bundle, "");
        assert!(ctx.stack_push_promise_iteration(0).is_some());

        // inheriting child sees the caller's bundle classes
        ctx.stack_push_bundle(&agent_bundle("child"), &[], true);
        assert!(ctx.is_defined_class("outer_cls"));
        ctx.stack_pop();

        // non-inheriting child sees exactly its own
        ctx.stack_push_bundle(&agent_bundle("isolated"), &[], false);
        assert!(!ctx.is_defined_class("outer_cls"));
        ctx.class_put_soft("own_cls", ContextScope::Bundle, "");
        assert!(ctx.is_defined_class("own_cls"));
    }

    #[test]
    fn test_class_match_and_matching_lists() {
        let mut ctx = EvalContext::new();
        ctx.class_put_soft("web_primary", ContextScope::Namespace, "role=web");
        ctx.class_put_soft("web_backup", ContextScope::Namespace, "role=web");
        ctx.class_put_soft("db_primary", ContextScope::Namespace, "role=db");

        assert_eq!(ctx.class_match("web_.*").unwrap().name, "web_primary");

        let all_web = ctx.classes_matching_global("web_.*", &[], false);
        assert_eq!(all_web, vec!["web_primary", "web_backup"]);

        let first = ctx.classes_matching_global(".*_primary", &[], true);
        assert_eq!(first.len(), 1);

        let tagged = ctx.classes_matching_global(".*", &["role=db".to_string()], false);
        assert_eq!(tagged, vec!["db_primary"]);
    }

    #[test]
    fn test_classes_matching_local_walks_inheriting_frames() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "outer", Promise::new("call", "methods"));
        ctx.class_put_soft("outer_local", ContextScope::Bundle, "");
        ctx.stack_push_promise_iteration(0).unwrap();
        ctx.stack_push_bundle(&agent_bundle("child"), &[], true);
        ctx.class_put_soft("child_local", ContextScope::Bundle, "");

        let found = ctx.classes_matching_local(".*_local", &[], false);
        assert!(found.contains(&"child_local".to_string()));
        assert!(found.contains(&"outer_local".to_string()));
    }

    #[test]
    fn test_all_classes_history() {
        let mut ctx = EvalContext::new();
        assert!(ctx.all_classes().is_none());
        ctx.all_classes_logging_enable(true);
        ctx.class_put_soft("tracked", ContextScope::Namespace, "");
        assert!(ctx.all_classes().unwrap().contains("tracked"));
    }

    // ---- abort tracking ----

    #[test]
    fn test_soft_class_define_triggers_eval_abort() {
        let mut ctx = EvalContext::new();
        ctx.heap_add_abort("danger", "any");
        assert!(!ctx.eval_aborted());

        ctx.class_put_soft("danger", ContextScope::Namespace, "");
        assert!(ctx.eval_aborted());
        assert!(ctx.is_defined_class("danger"));
    }

    #[test]
    fn test_heap_add_abort_checks_existing_classes() {
        let mut ctx = EvalContext::new();
        ctx.class_put_soft("already_here", ContextScope::Namespace, "");
        ctx.heap_add_abort("already_here", "any");
        assert!(ctx.eval_aborted());
    }

    #[test]
    fn test_abort_watchlists_are_idempotent() {
        let mut ctx = EvalContext::new();
        ctx.heap_add_abort("x", "any");
        ctx.heap_add_abort("x", "any");
        assert_eq!(ctx.heap_abort.len(), 1);

        ctx.heap_add_abort_current_bundle("y", "any");
        ctx.heap_add_abort_current_bundle("y", "any");
        assert_eq!(ctx.heap_abort_current_bundle.len(), 1);
    }

    #[test]
    fn test_bundle_abort_is_consumed() {
        let mut ctx = EvalContext::new();
        ctx.heap_add_abort_current_bundle("stop_bundle", "any");
        ctx.stack_push_bundle(&agent_bundle("main"), &[], false);
        ctx.class_put_soft("stop_bundle", ContextScope::Bundle, "");

        assert!(ctx.bundle_abort());
        assert!(!ctx.bundle_abort());
        assert!(!ctx.eval_aborted());
    }

    #[test]
    fn test_abort_entry_gated_by_activation_expression() {
        let mut ctx = EvalContext::new();
        ctx.heap_add_abort("danger", "armed");

        ctx.class_put_soft("danger", ContextScope::Namespace, "");
        assert!(!ctx.eval_aborted());

        ctx.class_put_soft("armed", ContextScope::Namespace, "");
        ctx.class_remove(None, "danger");
        ctx.class_put_soft("danger", ContextScope::Namespace, "");
        assert!(ctx.eval_aborted());
    }

    // ---- variables ----

    #[test]
    fn test_variable_put_get_roundtrip() {
        let mut ctx = EvalContext::new();
        let reference = VarRef::parse("web.port");
        assert!(ctx.variable_put(&reference, Value::scalar("8080"), DataType::String, "src=test"));

        let (value, dtype) = ctx.variable_get(&reference);
        assert_eq!(value.unwrap().as_scalar(), Some("8080"));
        assert_eq!(dtype, DataType::String);
        assert!(ctx.variable_tags(&reference).unwrap().contains("src=test"));
    }

    #[test]
    fn test_variable_unknown_reference() {
        let ctx = EvalContext::new();
        let (value, dtype) = ctx.variable_get(&VarRef::parse("no.such"));
        assert!(value.is_none());
        assert_eq!(dtype, DataType::None);
    }

    #[test]
    fn test_variable_empty_list_is_distinct_from_absence() {
        let mut ctx = EvalContext::new();
        let reference = VarRef::parse("web.empty");
        ctx.variable_put(&reference, Value::None, DataType::StringList, "");

        let (value, dtype) = ctx.variable_get(&reference);
        assert_eq!(dtype, DataType::StringList);
        assert!(value.unwrap().is_none());
    }

    #[test]
    fn test_variable_name_length_cap() {
        let mut ctx = EvalContext::new();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let reference = VarRef::new(None, Some("web"), &long);
        assert!(!ctx.variable_put(&reference, Value::scalar("v"), DataType::String, ""));
        assert_eq!(ctx.variable_get(&reference).1, DataType::None);
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let mut ctx = EvalContext::new();
        let reference = VarRef::parse("web.x");
        assert!(!ctx.variable_put(&reference, Value::scalar("$(x)"), DataType::String, ""));
        assert_eq!(ctx.variable_get(&reference).1, DataType::None);

        // lists are checked item-wise
        assert!(!ctx.variable_put(
            &reference,
            Value::slist(["fine", "$(x)"]),
            DataType::StringList,
            ""
        ));

        // body scope is exempt (substitution happens at call time)
        let body_ref = VarRef::new(None, Some("body"), "x");
        ctx.stack_push_control_body(&Rc::new(Body::new("default", "control", "common")));
        assert!(ctx.variable_put(&body_ref, Value::scalar("$(x)"), DataType::String, ""));
    }

    #[test]
    fn test_special_scope_ignores_namespace() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));
        ctx.variable_put_special(SpecialScope::This, "promiser_extra", Value::scalar("v"), DataType::String, "");

        let mut qualified = VarRef::parse("this.promiser_extra");
        qualified.ns = Some("elsewhere".to_string());
        let (value, _) = ctx.variable_get(&qualified);
        assert_eq!(value.unwrap().as_scalar(), Some("v"));
    }

    #[test]
    fn test_def_scope_respects_namespace() {
        let mut ctx = EvalContext::new();
        ctx.variable_put(&VarRef::parse("def.key"), Value::scalar("v"), DataType::String, "");
        let mut foreign = VarRef::parse("def.key");
        foreign.ns = Some("elsewhere".to_string());
        assert_eq!(ctx.variable_get(&foreign).1, DataType::None);
    }

    #[test]
    fn test_container_lookup_with_and_without_indices() {
        let mut ctx = EvalContext::new();
        let reference = VarRef::parse("web.cfg");
        ctx.variable_put(
            &reference,
            Value::Container(json!({"net": {"port": 8080}})),
            DataType::Container,
            "",
        );

        // zero indices: the container itself
        let (whole, dtype) = ctx.variable_get(&reference);
        assert_eq!(dtype, DataType::Container);
        assert_eq!(whole.unwrap().as_container(), Some(&json!({"net": {"port": 8080}})));

        // an index path selects into the tree
        let (child, dtype) = ctx.variable_get(&VarRef::parse("web.cfg[net][port]"));
        assert_eq!(dtype, DataType::Container);
        assert_eq!(child.unwrap().as_container(), Some(&json!(8080)));

        // a missing path is an unknown reference
        let (missing, dtype) = ctx.variable_get(&VarRef::parse("web.cfg[net][absent]"));
        assert!(missing.is_none());
        assert_eq!(dtype, DataType::None);
    }

    #[test]
    fn test_mangled_scoped_name_in_special_scope() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));

        // iteration machinery stores 'config.data[k]' mangled into this
        ctx.variable_put_special(
            SpecialScope::This,
            "config.data[k]",
            Value::scalar("per-item"),
            DataType::String,
            "",
        );

        let (value, _) = ctx.variable_get(&VarRef::parse("config.data[k]"));
        assert_eq!(value.unwrap().as_scalar(), Some("per-item"));
    }

    #[test]
    fn test_unqualified_reference_qualifies_to_frame() {
        let mut ctx = EvalContext::new();
        ctx.stack_push_bundle(&agent_bundle("web"), &[], false);
        ctx.variable_put(&VarRef::parse("web.port"), Value::scalar("8080"), DataType::String, "");

        let (value, _) = ctx.variable_get(&VarRef::parse("port"));
        assert_eq!(value.unwrap().as_scalar(), Some("8080"));
    }

    #[test]
    fn test_promise_scope_falls_back_to_last_bundle() {
        let mut ctx = EvalContext::new();
        ctx.variable_put(&VarRef::parse("web.port"), Value::scalar("8080"), DataType::String, "");
        push_promise_env(&mut ctx, "web", Promise::new("p", "files"));

        // inside the promise, an unqualified name first tries 'this',
        // then the enclosing bundle
        let (value, _) = ctx.variable_get(&VarRef::parse("port"));
        assert_eq!(value.unwrap().as_scalar(), Some("8080"));
    }

    #[test]
    fn test_variable_remove_and_special_remove() {
        let mut ctx = EvalContext::new();
        let reference = VarRef::parse("web.port");
        ctx.variable_put(&reference, Value::scalar("8080"), DataType::String, "");
        assert!(ctx.variable_remove(&reference));
        assert!(!ctx.variable_remove(&reference));

        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));
        ctx.variable_put_special(SpecialScope::This, "tmp", Value::scalar("v"), DataType::String, "");
        assert!(ctx.variable_remove_special(SpecialScope::This, "tmp"));
        assert_eq!(ctx.variable_get_special(SpecialScope::This, "tmp").1, DataType::None);
    }

    #[test]
    fn test_match_scope_and_clear() {
        let mut ctx = EvalContext::new();
        ctx.variable_put_special(SpecialScope::Match, "1", Value::scalar("capture"), DataType::String, "");
        assert_eq!(
            ctx.variable_get_special(SpecialScope::Match, "1").0.unwrap().as_scalar(),
            Some("capture")
        );
        assert!(ctx.variable_clear_match());
        assert_eq!(ctx.variable_get_special(SpecialScope::Match, "1").1, DataType::None);
    }

    #[test]
    fn test_edit_scope_routes_to_bundle_frame() {
        let mut ctx = EvalContext::new();
        ctx.stack_push_bundle(&agent_bundle("edit_bundle"), &[], false);
        ctx.variable_put_special(SpecialScope::Edit, "filename", Value::scalar("/etc/motd"), DataType::String, "");
        assert_eq!(
            ctx.variable_get_special(SpecialScope::Edit, "filename").0.unwrap().as_scalar(),
            Some("/etc/motd")
        );

        ctx.stack_pop();
        assert_eq!(ctx.variable_get_special(SpecialScope::Edit, "filename").1, DataType::None);
    }

    #[test]
    fn test_body_scope_and_control_body() {
        let mut ctx = EvalContext::new();
        let body = Rc::new(Body::new("default", "control", "common"));
        ctx.stack_push_control_body(&body);
        ctx.variable_put_special(SpecialScope::Body, "inputs", Value::slist(["a.cf"]), DataType::StringList, "");
        let (value, dtype) = ctx.variable_get_special(SpecialScope::Body, "inputs");
        assert_eq!(dtype, DataType::StringList);
        assert_eq!(value.unwrap().as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_body_args_are_mapped() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));
        ctx.stack_pop(); // promise; leaves bundle + section

        let body = Rc::new(Body::new("default", "rotate", "files").with_args(["count"]));
        let caller = Promise::new("p", "files");
        ctx.stack_push_body(Some(&caller), &body, &[Value::scalar("5")]);

        let (value, _) = ctx.variable_get_special(SpecialScope::Body, "count");
        assert_eq!(value.unwrap().as_scalar(), Some("5"));
    }

    #[test]
    fn test_variable_owning_promise_is_recorded() {
        let mut ctx = EvalContext::new();
        let pp = push_promise_env(&mut ctx, "main", Promise::new("p", "vars"));
        let reference = VarRef::parse("main.fact");
        ctx.variable_put(&reference, Value::scalar("v"), DataType::String, "");
        assert!(Rc::ptr_eq(&ctx.variable_promise_get(&reference).unwrap(), &pp));
    }

    // ---- stack discipline ----

    #[test]
    fn test_stack_path_extends_and_contracts() {
        let mut ctx = EvalContext::new();
        assert_eq!(ctx.stack_path(), "");

        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));
        ctx.stack_push_promise_iteration(0).unwrap();

        let mut previous = String::new();
        for frame in &ctx.stack {
            assert!(frame.path.starts_with(&previous));
            assert!(frame.path.len() > previous.len());
            previous = frame.path.clone();
        }

        let deepest = ctx.stack_path();
        ctx.stack_pop();
        assert!(deepest.starts_with(&ctx.stack_path()));
        assert!(deepest.len() > ctx.stack_path().len());
    }

    #[test]
    fn test_illegal_push_panics() {
        let mut ctx = EvalContext::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.stack_push_bundle_section(&Rc::new(BundleSection::new("files")));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_promise_frame_publishes_specials() {
        let mut ctx = EvalContext::new();
        ctx.set_launch_directory("/var/lib/agent");
        let promise = Promise::new("/etc/motd", "files")
            .with_constraint("handle", Value::scalar("motd_file"))
            .with_source("policy/main.cf", 42);
        push_promise_env(&mut ctx, "web", promise);

        let get = |ctx: &EvalContext, name: &str| {
            ctx.variable_get_special(SpecialScope::This, name)
                .0
                .and_then(|v| v.as_scalar().map(|s| s.to_string()))
        };

        assert_eq!(get(&ctx, "promiser").as_deref(), Some("/etc/motd"));
        assert_eq!(get(&ctx, "bundle").as_deref(), Some("web"));
        assert_eq!(get(&ctx, "namespace").as_deref(), Some("default"));
        assert_eq!(get(&ctx, "handle").as_deref(), Some("motd_file"));
        assert_eq!(get(&ctx, "promise_filename").as_deref(), Some("/var/lib/agent/policy/main.cf"));
        assert_eq!(get(&ctx, "promise_dirname").as_deref(), Some("/var/lib/agent/policy"));
        assert_eq!(get(&ctx, "promise_linenumber").as_deref(), Some("42"));
        assert!(get(&ctx, "promiser_uid").is_some());
        assert!(get(&ctx, "promiser_pid").is_some());
    }

    #[test]
    fn test_with_constraint_is_published_when_evaluable() {
        let mut ctx = EvalContext::new();
        ctx.variable_put(&VarRef::parse("web.name"), Value::scalar("motd"), DataType::String, "");
        let promise = Promise::new("p", "files").with_constraint("with", Value::scalar("file-$(web.name)"));
        push_promise_env(&mut ctx, "web", promise);

        assert_eq!(
            ctx.variable_get_special(SpecialScope::This, "with").0.unwrap().as_scalar(),
            Some("file-motd")
        );

        ctx.stack_pop();
        ctx.stack_pop();
        ctx.stack_pop();

        // an unresolvable reference keeps `with` unpublished
        let promise = Promise::new("p", "files").with_constraint("with", Value::scalar("$(absent)"));
        push_promise_env(&mut ctx, "other", promise);
        assert_eq!(ctx.variable_get_special(SpecialScope::This, "with").1, DataType::None);
    }

    #[test]
    fn test_bundle_arguments_bind_parameters() {
        let mut ctx = EvalContext::new();
        let bundle = Rc::new(Bundle::new("default", "web", "agent").with_args(["port", "host"]));
        ctx.stack_push_bundle(&bundle, &[Value::scalar("8080"), Value::scalar("localhost")], false);

        assert_eq!(
            ctx.variable_get(&VarRef::parse("web.port")).0.unwrap().as_scalar(),
            Some("8080")
        );
        assert_eq!(
            ctx.variable_get(&VarRef::parse("web.host")).0.unwrap().as_scalar(),
            Some("localhost")
        );
    }

    #[test]
    fn test_bundle_arity_mismatch_pushes_degraded() {
        let mut ctx = EvalContext::new();
        let bundle = Rc::new(Bundle::new("default", "web", "agent").with_args(["port", "host"]));
        ctx.stack_push_bundle(&bundle, &[Value::scalar("8080")], false);

        // the frame exists so evaluation can continue
        assert_eq!(ctx.stack_depth(), 1);
        // but no parameters were bound
        assert_eq!(ctx.variable_get(&VarRef::parse("web.port")).1, DataType::None);
    }

    #[test]
    fn test_bundle_push_reexpands_existing_variables() {
        let mut ctx = EvalContext::new();
        ctx.variable_put(&VarRef::parse("web.name"), Value::scalar("world"), DataType::String, "");
        ctx.variable_put(
            &VarRef::parse("web.greeting"),
            Value::scalar("hi $(name)"),
            DataType::String,
            "",
        );

        ctx.stack_push_bundle(&agent_bundle("web"), &[], false);
        assert_eq!(
            ctx.variable_get(&VarRef::parse("web.greeting")).0.unwrap().as_scalar(),
            Some("hi world")
        );
    }

    #[test]
    fn test_edit_bundle_pop_clears_edit_variables() {
        let mut ctx = EvalContext::new();
        let bundle = Rc::new(Bundle::new("default", "fix_motd", "edit_line"));
        ctx.stack_push_bundle(&bundle, &[], false);
        ctx.variable_put_special(SpecialScope::Edit, "filename", Value::scalar("/etc/motd"), DataType::String, "");
        ctx.stack_pop();
        assert_eq!(ctx.stack_depth(), 0);
    }

    #[test]
    fn test_skipped_iteration_pushes_nothing() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "main", Promise::new("p", "files").with_classes("not_defined"));

        assert!(ctx.stack_push_promise_iteration(0).is_none());
        // no iteration frame: no message buffer is allocated
        assert!(ctx.stack_current_messages().is_none());
        assert_eq!(ctx.stack_depth(), 3);
    }

    #[test]
    fn test_iteration_messages_are_captured() {
        let mut ctx = EvalContext::new();
        push_promise_env(&mut ctx, "main", Promise::new("p", "files"));
        ctx.stack_push_promise_iteration(0).unwrap();

        ctx.log(LogLevel::Info, "first");
        ctx.log(LogLevel::Error, "second");
        ctx.log(LogLevel::Verbose, "not captured");

        let messages: Vec<&str> = ctx.stack_current_messages().unwrap().iter().collect();
        assert_eq!(messages, vec!["first", "second"]);

        for i in 0..10 {
            ctx.log(LogLevel::Info, &format!("m{}", i));
        }
        assert_eq!(ctx.stack_current_messages().unwrap().len(), 5);
    }

    #[test]
    fn test_promise_log_level_adjustment_restored_on_pop() {
        let mut ctx = EvalContext::new();
        assert!(!ctx.would_log(LogLevel::Verbose));

        let promise = Promise::new("p", "files")
            .with_constraint("report_level", Value::scalar("verbose"));
        push_promise_env(&mut ctx, "main", promise);
        ctx.stack_push_promise_iteration(0).unwrap();
        assert!(ctx.would_log(LogLevel::Verbose));

        ctx.stack_pop();
        assert!(!ctx.would_log(LogLevel::Verbose));
    }

    #[test]
    fn test_stack_current_promise_and_bundle() {
        let mut ctx = EvalContext::new();
        assert!(ctx.stack_current_bundle().is_none());
        assert!(ctx.stack_current_promise().is_none());

        push_promise_env(&mut ctx, "main", Promise::new("thing", "files"));
        assert_eq!(ctx.stack_current_bundle().unwrap().name, "main");
        assert!(ctx.stack_current_promise().is_none());

        ctx.stack_push_promise_iteration(0).unwrap();
        assert_eq!(ctx.stack_current_promise().unwrap().promiser, "thing");
    }

    #[test]
    fn test_stack_promisees_and_caller_methods() {
        let mut ctx = EvalContext::new();
        let promise = Promise::new("deploy", "methods")
            .with_promisee(Value::slist(["ops-team", "audit"]));
        push_promise_env(&mut ctx, "main", promise);
        ctx.stack_push_promise_iteration(0).unwrap();

        let promisees = ctx.stack_promisees();
        assert!(promisees.contains("ops-team"));
        assert!(promisees.contains("audit"));

        assert_eq!(ctx.promise_caller_methods(), vec!["deploy"]);
    }

    // ---- persistence ----

    #[test]
    fn test_persistent_class_roundtrip_and_expiry() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save("mykept", 5, StatePolicy::Preserve, "src=t");
        ctx.persistent_load_all();

        assert!(ctx.is_defined_class("mykept"));
        let tags = ctx.class_tags(None, "mykept").unwrap();
        assert!(tags.contains("source=persistent"));
        assert!(tags.contains("src=t"));

        // six minutes later the record has expired
        ctx.clear();
        ctx.clock_skew += 6 * 60;
        ctx.persistent_load_all();
        assert!(!ctx.is_defined_class("mykept"));

        // and the expired record was pruned: rewinding the clock does
        // not bring it back
        ctx.clear();
        ctx.clock_skew = 0;
        ctx.persistent_load_all();
        assert!(!ctx.is_defined_class("mykept"));
    }

    #[test]
    fn test_persistent_expiry_boundary_is_inclusive() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save_at("edge", 5, StatePolicy::Preserve, "", 1_000);
        ctx.persistent_load_all_at(1_000 + 5 * 60);
        assert!(!ctx.is_defined_class("edge"));
    }

    #[test]
    fn test_persistent_preserve_is_idempotent() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save_at("kept", 5, StatePolicy::Preserve, "t=1", 1_000);
        // second save within the window, same tags: expiry unchanged
        ctx.persistent_save_at("kept", 5, StatePolicy::Preserve, "t=1", 1_100);
        ctx.persistent_load_all_at(1_350);
        assert!(!ctx.is_defined_class("kept"));
    }

    #[test]
    fn test_persistent_preserve_with_changed_tags_rewrites() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save_at("kept", 5, StatePolicy::Preserve, "t=1", 1_000);
        ctx.persistent_save_at("kept", 5, StatePolicy::Preserve, "t=2", 1_100);
        ctx.persistent_load_all_at(1_350);
        assert!(ctx.is_defined_class("kept"));
        assert!(ctx.class_tags(None, "kept").unwrap().contains("t=2"));
    }

    #[test]
    fn test_persistent_reset_policy_restarts_clock() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save_at("kept", 5, StatePolicy::Reset, "", 1_000);
        ctx.persistent_save_at("kept", 5, StatePolicy::Reset, "", 1_100);
        ctx.persistent_load_all_at(1_350);
        assert!(ctx.is_defined_class("kept"));
    }

    #[test]
    fn test_persistent_remove() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save("gone", 5, StatePolicy::Preserve, "");
        ctx.persistent_remove("gone");
        ctx.persistent_load_all();
        assert!(!ctx.is_defined_class("gone"));
    }

    #[test]
    fn test_persistent_negated_classes_are_skipped() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save("unwanted", 5, StatePolicy::Preserve, "");
        ctx.set_negated_classes(["unwanted".to_string()].into_iter().collect());
        ctx.persistent_load_all();
        assert!(!ctx.is_defined_class("unwanted"));
    }

    #[test]
    fn test_persistent_namespace_qualified_names() {
        let mut ctx = EvalContext::new();
        ctx.persistent_save("ops:mykept", 5, StatePolicy::Preserve, "");
        ctx.persistent_load_all();
        assert!(ctx.is_defined_class("ops:mykept"));
        assert!(!ctx.is_defined_class("mykept"));
    }

    // ---- function cache ----

    #[test]
    fn test_function_cache_hit_and_miss() {
        let mut ctx = EvalContext::new();
        let args = [Value::scalar("1"), Value::scalar("2"), Value::scalar("3")];
        ctx.function_cache_put("sum", &args, Value::scalar("6"));

        assert_eq!(ctx.function_cache_get("sum", &args).unwrap().as_scalar(), Some("6"));
        assert_eq!(ctx.function_cache_get("sum", &args).unwrap().as_scalar(), Some("6"));

        let other = [Value::scalar("1"), Value::scalar("2")];
        assert!(ctx.function_cache_get("sum", &other).is_none());
        assert!(ctx.function_cache_get("product", &args).is_none());
    }

    #[test]
    fn test_function_cache_disabled() {
        let mut ctx = EvalContext::new();
        let args = [Value::scalar("1")];
        ctx.function_cache_put("probe", &args, Value::scalar("r"));

        ctx.set_eval_option(EvalOption::CacheSystemFunctions, false);
        assert!(ctx.function_cache_get("probe", &args).is_none());

        // disabled caching also refuses insertion
        ctx.function_cache_put("probe2", &args, Value::scalar("r"));
        ctx.set_eval_option(EvalOption::CacheSystemFunctions, true);
        assert!(ctx.function_cache_get("probe2", &args).is_none());
    }

    #[test]
    fn test_function_cache_last_write_wins() {
        let mut ctx = EvalContext::new();
        let args = [Value::scalar("x")];
        ctx.function_cache_put("f", &args, Value::scalar("old"));
        ctx.function_cache_put("f", &args, Value::scalar("new"));
        assert_eq!(ctx.function_cache_get("f", &args).unwrap().as_scalar(), Some("new"));
    }

    // ---- locks, config, lifecycle ----

    #[test]
    fn test_promise_lock_cache() {
        let mut ctx = EvalContext::new();
        assert!(!ctx.promise_lock_cache_contains("lock1"));
        ctx.promise_lock_cache_put("lock1");
        assert!(ctx.promise_lock_cache_contains("lock1"));
        ctx.promise_lock_cache_remove("lock1");
        assert!(!ctx.promise_lock_cache_contains("lock1"));
    }

    #[test]
    fn test_config_and_options() {
        let mut ctx = EvalContext::new();
        assert!(ctx.get_eval_option(EvalOption::FullExpansion));
        assert!(ctx.get_eval_option(EvalOption::CacheSystemFunctions));

        ctx.set_eval_option(EvalOption::FullExpansion, false);
        assert!(!ctx.get_eval_option(EvalOption::FullExpansion));

        ctx.set_config(AgentConfig {
            bundlesequence: vec!["main".into()],
            ..AgentConfig::default()
        });
        assert_eq!(ctx.config().unwrap().bundlesequence, vec!["main"]);

        ctx.set_ignore_locks(true);
        assert!(ctx.is_ignoring_locks());
        ctx.set_select_end_match_eof(true);
        assert!(ctx.select_end_match_eof());
        ctx.set_restrict_keys(&["k1".to_string()]);
        assert_eq!(ctx.restrict_keys(), ["k1".to_string()]);
        ctx.set_checksum_updates_default(true);
        assert!(ctx.checksum_updates_default());
        ctx.set_entry_point("promises.cf");
        assert_eq!(ctx.entry_point(), Some("promises.cf"));
    }

    #[test]
    fn test_clear_drops_state() {
        let mut ctx = EvalContext::new();
        ctx.class_put_soft("cls", ContextScope::Namespace, "");
        ctx.variable_put(&VarRef::parse("web.v"), Value::scalar("x"), DataType::String, "");
        ctx.add_ip_address("10.0.0.1", Some("eth0"));
        ctx.promise_lock_cache_put("lock");
        ctx.function_cache_put("f", &[], Value::scalar("r"));
        ctx.stack_push_bundle(&agent_bundle("main"), &[], false);

        ctx.clear();

        assert!(!ctx.is_defined_class("cls"));
        assert_eq!(ctx.variable_get(&VarRef::parse("web.v")).1, DataType::None);
        assert!(ctx.ip_addresses().is_empty());
        assert!(!ctx.promise_lock_cache_contains("lock"));
        assert!(ctx.function_cache_get("f", &[]).is_none());
        assert_eq!(ctx.stack_depth(), 0);
    }

    #[test]
    fn test_ip_addresses_and_bundle_names() {
        let mut ctx = EvalContext::new();
        ctx.add_ip_address("10.0.0.1", Some("eth0"));
        ctx.add_ip_address("10.0.0.2", None);
        assert_eq!(ctx.ip_addresses().len(), 2);
        ctx.delete_ip_addresses();
        assert!(ctx.ip_addresses().is_empty());

        ctx.push_bundle_name("main");
        ctx.push_bundle_name("main");
        assert_eq!(ctx.bundle_names().len(), 1);
    }

    #[test]
    fn test_remote_var_promises() {
        let mut ctx = EvalContext::new();
        assert!(ctx.remote_var_promises("web").is_none());
        let pp = Rc::new(Promise::new("x", "vars"));
        ctx.push_remote_var_promise("web", pp);
        assert_eq!(ctx.remote_var_promises("web").unwrap().len(), 1);
    }

    // ---- bundle and body resolution ----

    #[test]
    fn test_resolve_bundle_expression() {
        let mut policy = Policy::new();
        policy.add_bundle(Bundle::new("default", "main", "agent"));
        policy.add_bundle(Bundle::new("ops", "deploy", "agent"));

        let ctx = EvalContext::new();
        assert!(ctx.resolve_bundle_expression(&policy, "main", "agent").is_some());
        assert!(ctx.resolve_bundle_expression(&policy, "ops:deploy", "agent").is_some());
        assert!(ctx.resolve_bundle_expression(&policy, "deploy", "agent").is_none());
        assert!(ctx.resolve_bundle_expression(&policy, "main", "common").is_none());
    }

    #[test]
    fn test_resolve_body_expression_with_inheritance() {
        let mut policy = Policy::new();
        let mut child = Body::new("default", "child", "files");
        child.constraints.push(Constraint::new("inherit_from", Value::scalar("parent")));
        policy.add_body(child);
        policy.add_body(Body::new("default", "parent", "files"));

        let ctx = EvalContext::new();
        let chain = ctx.resolve_body_expression(&policy, "child", "files");
        let names: Vec<&str> = chain.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["child", "parent"]);
    }

    #[test]
    fn test_resolve_body_self_inheritance_stops() {
        let mut policy = Policy::new();
        let mut looped = Body::new("default", "looped", "files");
        looped.constraints.push(Constraint::new("inherit_from", Value::scalar("looped")));
        policy.add_body(looped);

        let ctx = EvalContext::new();
        let chain = ctx.resolve_body_expression(&policy, "looped", "files");
        assert_eq!(chain.len(), 1);
    }
}
