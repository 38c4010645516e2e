//! Free patches: declarative instruction-level rewrites applied before a module is reloaded.
//!
//! A [`FreePatch`] names the module it targets, the part of that module it operates on and a
//! [`PatchAction`]. Patches are plain data; they are collected in a [`PatchRegistry`] before
//! the pass runs and executed by the [`PatchEngine`] during the transform step.
//!
//! # Actions
//!
//! - [`PatchAction::RedirectCall`] swaps the operand of every instruction that refers to a
//!   matched method for a reference to a replacement method, importing it if needed.
//! - [`PatchAction::StripToReturn`] cuts a method body at the first matching instruction and
//!   puts a bare `ret` in its place.
//! - [`PatchAction::RenameType`] renames every referenced or defined type with a given full
//!   name that is used by an instruction, directly or through one of its members.
//!
//! A patch whose target type or method does not exist in a module is reported as
//! [`PatchResult::NotApplicable`], never as an error, so patches survive version drift of the
//! modules they target. Every action is idempotent: a second application reports
//! [`PatchResult::Unchanged`] and leaves the image as it was.
//!
//! # Examples
//!
//! ```rust
//! use dotswap::image::{MethodImport, ModuleIdentity};
//! use dotswap::patch::{FreePatch, MethodMatcher, PatchRegistry};
//!
//! let mut registry = PatchRegistry::new();
//! registry.register(FreePatch::redirect_call(
//!     "ReplaceAddComponent",
//!     "Assembly-CSharp",
//!     "Game.Cameras.CameraRig",
//!     "CreateCamera",
//!     MethodMatcher::named("AddComponent"),
//!     MethodImport::new(
//!         ModuleIdentity::new("Loader"),
//!         "Loader.CameraFreePatch",
//!         "AddComponent",
//!         vec![0x00, 0x01, 0x12, 0x08, 0x12, 0x0C],
//!     ),
//! ));
//! assert_eq!(registry.for_module("Assembly-CSharp").count(), 1);
//! ```

mod engine;
mod matcher;

pub use engine::{apply, PatchEngine};
pub use matcher::{render_operand, InstructionPattern, MethodMatcher};

use std::fmt;

use crate::{
    image::{Image, MethodImport, ModuleIdentity},
    Result,
};

/// The modules a patch applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleTarget {
    /// The module with this logical name
    Named(String),
    /// Every module that allows patches
    Any,
}

impl ModuleTarget {
    /// Returns true if this target selects the module called `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ModuleTarget::Named(target) => target == name,
            ModuleTarget::Any => true,
        }
    }
}

/// The part of a module a patch operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchScope {
    /// A single method, the first overload with this name
    Method {
        /// Full name of the declaring type, nested types written `Outer/Inner`
        type_name: String,
        /// Method name, `.cctor` for the static constructor
        method_name: String,
    },
    /// Every method body of the module, nested types included
    Module,
}

/// The rewrite a patch performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    /// Point every reference to a matched method at `replacement`.
    RedirectCall {
        /// Methods whose references are redirected
        target: MethodMatcher,
        /// The method to call instead
        replacement: MethodImport,
    },
    /// Replace the first matching instruction with `ret` and drop everything after it.
    StripToReturn {
        /// The instruction to cut at
        at: InstructionPattern,
    },
    /// Rename types with full name `from` to the short name of `to`.
    RenameType {
        /// Full name of the type, `Outer/Inner` for nested types
        from: String,
        /// New full name; only its last segment is applied
        to: String,
    },
}

/// A named, declarative rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreePatch {
    /// Name used in diagnostics and reports
    pub name: String,
    /// Modules the patch applies to
    pub module: ModuleTarget,
    /// Part of the module the patch operates on
    pub scope: PatchScope,
    /// The rewrite
    pub action: PatchAction,
}

impl FreePatch {
    /// Redirect calls inside one method of one module.
    #[must_use]
    pub fn redirect_call(
        name: impl Into<String>,
        module: impl Into<String>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
        target: MethodMatcher,
        replacement: MethodImport,
    ) -> Self {
        FreePatch {
            name: name.into(),
            module: ModuleTarget::Named(module.into()),
            scope: PatchScope::Method {
                type_name: type_name.into(),
                method_name: method_name.into(),
            },
            action: PatchAction::RedirectCall {
                target,
                replacement,
            },
        }
    }

    /// Cut one method of one module at the first instruction matching `at`.
    #[must_use]
    pub fn strip_to_return(
        name: impl Into<String>,
        module: impl Into<String>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
        at: InstructionPattern,
    ) -> Self {
        FreePatch {
            name: name.into(),
            module: ModuleTarget::Named(module.into()),
            scope: PatchScope::Method {
                type_name: type_name.into(),
                method_name: method_name.into(),
            },
            action: PatchAction::StripToReturn { at },
        }
    }

    /// Rename a type and the references to it across whole modules.
    #[must_use]
    pub fn rename_type(
        name: impl Into<String>,
        module: ModuleTarget,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        FreePatch {
            name: name.into(),
            module,
            scope: PatchScope::Module,
            action: PatchAction::RenameType {
                from: from.into(),
                to: to.into(),
            },
        }
    }
}

/// Outcome of applying one patch to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResult {
    /// The patch rewrote `changes` instructions or references
    Applied {
        /// Number of rewritten sites
        changes: usize,
    },
    /// The targets exist but there was nothing (left) to rewrite
    Unchanged,
    /// The targeted type or method does not exist in this module
    NotApplicable(String),
}

impl PatchResult {
    /// Returns true if the image was changed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchResult::Applied { .. })
    }
}

/// One line of a patch report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Patch name
    pub patch: String,
    /// Module the patch was applied to
    pub module: String,
    /// What happened
    pub result: PatchResult,
}

impl fmt::Display for PatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            PatchResult::Applied { changes } => write!(
                f,
                "Applied {} to {} ({} changes)",
                self.patch, self.module, changes
            ),
            PatchResult::Unchanged => {
                write!(f, "{} left {} unchanged", self.patch, self.module)
            }
            PatchResult::NotApplicable(reason) => write!(
                f,
                "{} is not applicable to {}: {}",
                self.patch, self.module, reason
            ),
        }
    }
}

/// Patches registered for a pass, in registration order.
#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    patches: Vec<FreePatch>,
}

impl PatchRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a patch.
    pub fn register(&mut self, patch: FreePatch) -> &mut Self {
        self.patches.push(patch);
        self
    }

    /// All registered patches.
    #[must_use]
    pub fn patches(&self) -> &[FreePatch] {
        &self.patches
    }

    /// Patches that apply to the module called `name`.
    pub fn for_module<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FreePatch> + 'a {
        self.patches
            .iter()
            .filter(move |patch| patch.module.matches(name))
    }

    /// Number of registered patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Returns true if no patch is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Reconciles the custom attributes of a module against the main application module.
///
/// Runs during the transform step on every module flagged `process_attributes`.
pub trait AttributeReconciler: Send + Sync {
    /// Reconcile `image`; returns true if the image was changed.
    ///
    /// # Errors
    /// Returns an error if the image cannot be reconciled; this fails the pass.
    fn reconcile(&self, image: &mut Image, main: &ModuleIdentity) -> Result<bool>;
}
