//! Promise Outcome Attributes
//!
//! The `classes` and transaction bodies of a promise, as consumed by the
//! outcome protocol: which classes to define or cancel per outcome,
//! persistence of outcome classes, and outcome log routing.

use crate::classes::types::ContextScope;
use crate::persist::store::StatePolicy;

/// What the agent is allowed to do about a drifted promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Repair the drift.
    Fix,
    /// Only warn about it.
    Warn,
}

impl Default for Action {
    fn default() -> Self {
        Action::Fix
    }
}

/// The `classes` body: outcome-conditional class definitions.
#[derive(Debug, Clone, Default)]
pub struct DefineClasses {
    /// Added on `change` (repaired).
    pub change: Vec<String>,
    /// Added on `warn`, `fail` and `interrupted` (not kept).
    pub failure: Vec<String>,
    /// Added on `denied`.
    pub denied: Vec<String>,
    /// Added on `timeout`.
    pub timeout: Vec<String>,
    /// Added on `noop` (kept).
    pub kept: Vec<String>,
    /// Cancelled on `change`.
    pub del_change: Vec<String>,
    /// Cancelled on `noop`.
    pub del_kept: Vec<String>,
    /// Cancelled on every not-kept outcome.
    pub del_notkept: Vec<String>,
    /// Persistence TTL in minutes; zero means not persistent.
    pub persist: u32,
    /// Persistence policy used when `persist` is set.
    pub timer: StatePolicy,
    /// Requested scope for added classes. Persistent classes are promoted
    /// to namespace scope regardless.
    pub scope: ContextScope,
}

/// The `action`/logging slice of a transaction body.
#[derive(Debug, Clone, Default)]
pub struct TransactionContext {
    pub action: Action,
    /// Message template for the outcome log, expanded at emit time.
    pub log_string: Option<String>,
    /// Sink name for kept outcomes: `stdout`, `udp_syslog` or a file path.
    pub log_kept: Option<String>,
    /// Sink name for repaired outcomes.
    pub log_repaired: Option<String>,
    /// Sink name for failed/denied/timeout/interrupted outcomes.
    pub log_failed: Option<String>,
}

/// The attributes slice the outcome protocol needs from a promise.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    pub classes: DefineClasses,
    pub transaction: TransactionContext,
}

impl Attributes {
    /// Attributes defining classes on repair, nothing else.
    pub fn with_repaired_classes<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: DefineClasses {
                change: classes.into_iter().map(Into::into).collect(),
                ..DefineClasses::default()
            },
            ..Self::default()
        }
    }

    pub fn warn_only(mut self) -> Self {
        self.transaction.action = Action::Warn;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let attr = Attributes::default();
        assert_eq!(attr.transaction.action, Action::Fix);
        assert_eq!(attr.classes.persist, 0);
        assert!(attr.classes.change.is_empty());
    }

    #[test]
    fn test_with_repaired_classes() {
        let attr = Attributes::with_repaired_classes(["fixed_it"]).warn_only();
        assert_eq!(attr.classes.change, vec!["fixed_it"]);
        assert_eq!(attr.transaction.action, Action::Warn);
    }
}
