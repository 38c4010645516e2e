//! Pass states, outcomes and the pass report.

use std::{fmt, path::PathBuf};

use strum::{EnumCount, EnumIter};

use crate::{
    patch::{PatchRecord, PatchResult},
    Error,
};

/// The steps of a reload pass, in execution order.
///
/// A pass only ever moves forward one step at a time, or to [`PassState::Failed`]. Both
/// [`PassState::Complete`] and [`PassState::Failed`] are terminal.
#[derive(Clone, Copy, PartialEq, Debug, EnumIter, EnumCount, Eq, Hash)]
pub enum PassState {
    /// Build the module set from the process inventory
    Discover,
    /// Collapse extension modules that alias an already registered identity
    ResolveDuplicates,
    /// Apply free patches and attribute reconciliation
    Transform,
    /// Stage every module that needs a reload as bytes
    Serialize,
    /// Load the staged images into the process
    LoadImages,
    /// Replace the module load hook
    InstallRedirection,
    /// The pass finished
    Complete,
    /// The pass was aborted
    Failed,
}

impl PassState {
    /// The state that follows this one on success, `None` for terminal states.
    #[must_use]
    pub fn next(self) -> Option<PassState> {
        match self {
            PassState::Discover => Some(PassState::ResolveDuplicates),
            PassState::ResolveDuplicates => Some(PassState::Transform),
            PassState::Transform => Some(PassState::Serialize),
            PassState::Serialize => Some(PassState::LoadImages),
            PassState::LoadImages => Some(PassState::InstallRedirection),
            PassState::InstallRedirection => Some(PassState::Complete),
            PassState::Complete | PassState::Failed => None,
        }
    }

    /// Returns true for [`PassState::Complete`] and [`PassState::Failed`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, PassState::Complete | PassState::Failed)
    }

    /// Returns true if a pass in this state may move to `to`.
    #[must_use]
    pub fn can_advance_to(self, to: PassState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == PassState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassState::Discover => "Discover",
            PassState::ResolveDuplicates => "ResolveDuplicates",
            PassState::Transform => "Transform",
            PassState::Serialize => "Serialize",
            PassState::LoadImages => "LoadImages",
            PassState::InstallRedirection => "InstallRedirection",
            PassState::Complete => "Complete",
            PassState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What a pass did, for callers and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Logical names registered in the module set, in registration order
    pub registered: Vec<String>,
    /// Modules changed by the transform step
    pub modified: Vec<String>,
    /// Modules staged for loading, in registration order
    pub serialized: Vec<String>,
    /// Modules loaded into the process, in load order
    pub loaded: Vec<String>,
    /// Redirects recorded during duplicate resolution
    pub redirects: Vec<(PathBuf, PathBuf)>,
    /// Extension modules whose backing file could not be determined
    pub unresolved: Vec<String>,
    /// One record per patch and eligible module
    pub patches: Vec<PatchRecord>,
    /// Staged modules that are reloaded without symbols
    pub without_symbols: Vec<String>,
}

impl PassReport {
    /// Records of patches that changed a module.
    pub fn applied(&self) -> impl Iterator<Item = &PatchRecord> {
        self.patches.iter().filter(|record| record.result.is_applied())
    }

    /// Records of patches whose targets do not exist in the module they were offered to.
    pub fn not_applicable(&self) -> impl Iterator<Item = &PatchRecord> {
        self.patches
            .iter()
            .filter(|record| matches!(record.result, PatchResult::NotApplicable(_)))
    }
}

/// The result of [`crate::reload::Reloader::run`].
#[derive(Debug)]
pub enum PassOutcome {
    /// Every step ran; the host should restart its initialization against the new main module
    Complete(PassReport),
    /// The pass stopped; the host keeps running its original modules
    Failed {
        /// The step that failed
        state: PassState,
        /// Why it failed
        error: Error,
        /// What had been done up to the failure
        report: PassReport,
    },
}

impl PassOutcome {
    /// Returns true for [`PassOutcome::Complete`].
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, PassOutcome::Complete(_))
    }

    /// The report, whatever the outcome.
    #[must_use]
    pub fn report(&self) -> &PassReport {
        match self {
            PassOutcome::Complete(report) | PassOutcome::Failed { report, .. } => report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn forward_only() {
        let order: Vec<PassState> =
            std::iter::successors(Some(PassState::Discover), |state| state.next()).collect();
        assert_eq!(order.len(), PassState::COUNT - 1);
        assert_eq!(order.last(), Some(&PassState::Complete));

        for state in PassState::iter() {
            assert!(!state.can_advance_to(PassState::Discover));
            if state.is_terminal() {
                assert!(!state.can_advance_to(PassState::Failed));
            } else {
                assert!(state.can_advance_to(PassState::Failed));
            }
        }

        assert!(PassState::Serialize.can_advance_to(PassState::LoadImages));
        assert!(!PassState::Serialize.can_advance_to(PassState::InstallRedirection));
        assert!(!PassState::LoadImages.can_advance_to(PassState::Transform));
    }

    #[test]
    fn display() {
        assert_eq!(PassState::ResolveDuplicates.to_string(), "ResolveDuplicates");
        assert_eq!(PassState::Failed.to_string(), "Failed");
    }

    #[test]
    fn report_filters() {
        let record = |patch: &str, result| PatchRecord {
            patch: patch.to_string(),
            module: "B".to_string(),
            result,
        };
        let report = PassReport {
            patches: vec![
                record("A", PatchResult::Applied { changes: 1 }),
                record("B", PatchResult::Unchanged),
                record("C", PatchResult::NotApplicable("no type".to_string())),
            ],
            ..PassReport::default()
        };

        assert_eq!(report.applied().count(), 1);
        let not_applicable: Vec<&str> = report
            .not_applicable()
            .map(|record| record.patch.as_str())
            .collect();
        assert_eq!(not_applicable, vec!["C"]);
    }
}
