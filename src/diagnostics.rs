//! Diagnostics emitted during a reload pass.
//!
//! Messages go to the [`log`] facade with three severities: info, error and verbose (logged
//! at debug level, and only when enabled). Info and error messages are also kept so the
//! host can replay them once it has restarted against the reloaded modules, where the log
//! sink of the first start is gone.

use std::{fmt, sync::Mutex};

use crate::config::ReloadConfig;

/// Severity of a carried message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational
    Info,
    /// Something failed; the pass may still have continued
    Error,
}

/// A message kept for replay after the restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarriedMessage {
    /// Severity of the message
    pub severity: Severity,
    /// Message text, without prefix
    pub message: String,
}

/// The diagnostic sink of a pass.
#[derive(Debug)]
pub struct Diagnostics {
    prefix: String,
    verbose: bool,
    carried: Mutex<Vec<CarriedMessage>>,
}

impl Diagnostics {
    /// Create a sink with the given line prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, verbose: bool) -> Self {
        Diagnostics {
            prefix: prefix.into(),
            verbose,
            carried: Mutex::new(Vec::new()),
        }
    }

    /// Create a sink configured from `config`.
    #[must_use]
    pub fn from_config(config: &ReloadConfig) -> Self {
        Self::new(config.log_prefix.clone(), config.verbose)
    }

    /// Returns true if verbose messages are forwarded.
    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log an informational message.
    pub fn info(&self, message: impl fmt::Display) {
        let message = message.to_string();
        log::info!("{}: {}", self.prefix, message);
        self.carry(Severity::Info, message);
    }

    /// Log an error.
    pub fn error(&self, message: impl fmt::Display) {
        let message = message.to_string();
        log::error!("{} Error: {}", self.prefix, message);
        self.carry(Severity::Error, message);
    }

    /// Log a verbose message, if verbose output is enabled.
    pub fn verbose(&self, message: impl fmt::Display) {
        if self.verbose {
            log::debug!("{} Verbose: {}", self.prefix, message);
        }
    }

    /// Take the carried messages, leaving the buffer empty.
    pub fn drain_carried(&self) -> Vec<CarriedMessage> {
        match self.carried.lock() {
            Ok(mut carried) => std::mem::take(&mut *carried),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Log carried messages from an earlier start, marked as such. Replayed messages are
    /// not carried again.
    pub fn replay(&self, carried: &[CarriedMessage]) {
        for entry in carried {
            match entry.severity {
                Severity::Info => log::info!("{}: Before reload: {}", self.prefix, entry.message),
                Severity::Error => {
                    log::error!("{} Error: Before reload: {}", self.prefix, entry.message);
                }
            }
        }
    }

    fn carry(&self, severity: Severity, message: String) {
        let entry = CarriedMessage { severity, message };
        match self.carried.lock() {
            Ok(mut carried) => carried.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::from_config(&ReloadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_info_and_errors() {
        let _ = env_logger::builder().is_test(true).try_init();
        let diagnostics = Diagnostics::new("dotswap", false);

        diagnostics.info("Starting");
        diagnostics.verbose("not carried");
        diagnostics.error(format_args!("Duplicate module not found: {}", "Lib"));

        let carried = diagnostics.drain_carried();
        assert_eq!(
            carried,
            vec![
                CarriedMessage {
                    severity: Severity::Info,
                    message: "Starting".to_string()
                },
                CarriedMessage {
                    severity: Severity::Error,
                    message: "Duplicate module not found: Lib".to_string()
                },
            ]
        );
        assert!(diagnostics.drain_carried().is_empty());

        diagnostics.replay(&carried);
        assert!(diagnostics.drain_carried().is_empty());
    }

    #[test]
    fn verbose_follows_config() {
        assert!(!Diagnostics::default().is_verbose());
        assert!(Diagnostics::from_config(&ReloadConfig::default().with_verbose(true)).is_verbose());
    }
}
