//! Leveled logging
//!
//! The evaluator's log-level ladder and its mapping onto the `log`
//! facade. Promises can raise the effective level for their own
//! iteration through `log_level` / `report_level` constraints; the
//! context applies and restores those adjustments around iteration
//! frames.

use std::fmt;

/// Log levels, quietest first. A message is emitted when its level is at
/// or below the effective level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Suppress everything (dry-run system log).
    Nothing,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    /// Parse the promise-constraint spelling of a level. `error` maps to
    /// notice so that errors, warnings and notices all pass.
    pub fn from_promise_value(value: &str) -> Option<LogLevel> {
        match value {
            "verbose" => Some(LogLevel::Verbose),
            "inform" => Some(LogLevel::Info),
            "error" => Some(LogLevel::Notice),
            _ => None,
        }
    }

    /// Raise `base` to `adjust` when an adjustment is present; levels are
    /// never lowered by a promise.
    pub fn adjust(base: LogLevel, adjust: Option<LogLevel>) -> LogLevel {
        match adjust {
            Some(level) => base.max(level),
            None => base,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Nothing => "nothing",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Forward a message to the `log` facade at the closest severity.
pub fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Nothing => {}
        LogLevel::Critical | LogLevel::Error => log::error!("{}", message),
        LogLevel::Warning => log::warn!("{}", message),
        LogLevel::Notice | LogLevel::Info => log::info!("{}", message),
        LogLevel::Verbose => log::debug!("{}", message),
        LogLevel::Debug => log::trace!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(LogLevel::Error < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Verbose);
        assert!(LogLevel::Nothing < LogLevel::Critical);
    }

    #[test]
    fn test_from_promise_value() {
        assert_eq!(LogLevel::from_promise_value("verbose"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_promise_value("inform"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_promise_value("error"), Some(LogLevel::Notice));
        assert_eq!(LogLevel::from_promise_value("chatty"), None);
    }

    #[test]
    fn test_adjust_only_raises() {
        assert_eq!(LogLevel::adjust(LogLevel::Info, Some(LogLevel::Verbose)), LogLevel::Verbose);
        assert_eq!(LogLevel::adjust(LogLevel::Verbose, Some(LogLevel::Notice)), LogLevel::Verbose);
        assert_eq!(LogLevel::adjust(LogLevel::Info, None), LogLevel::Info);
    }
}
