//! # dotswap Prelude
//!
//! The types a host needs to run a reload pass, and the ones patch authors need to describe
//! their patches.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotswap operations
pub use crate::Error;

/// The result type used throughout dotswap
pub use crate::Result;

/// Settings of a reload pass
pub use crate::config::ReloadConfig;

/// Diagnostics of a reload pass
pub use crate::diagnostics::{CarriedMessage, Diagnostics, Severity};

// ================================================================================================
// Running a Pass
// ================================================================================================

/// The pass state machine and its results
pub use crate::reload::{
    PassOutcome, PassReport, PassState, RedirectTable, RedirectingResolver, ReloadContext,
    Reloader,
};

/// The traits a host implements
pub use crate::runtime::{
    Extension, Host, ImageLoader, LoadHook, LoadHooks, ModuleHandle, ModuleHandleRc,
    ModuleInventory, ModuleResolver, SystemModule,
};

// ================================================================================================
// Modules
// ================================================================================================

/// The mutable unit of a pass and its registry
pub use crate::module::{Module, ModuleSet, SerializedModule, SymbolSource, SymbolStatus};

/// Module images
pub use crate::image::{Image, MethodImport, ModuleIdentity, ModuleVersion, Token};

// ================================================================================================
// Patches
// ================================================================================================

/// Free patch descriptors
pub use crate::patch::{
    AttributeReconciler, FreePatch, InstructionPattern, MethodMatcher, ModuleTarget, PatchAction,
    PatchRecord, PatchRegistry, PatchResult, PatchScope,
};

/// Instructions, for patterns and tests
pub use crate::assembly::{opcodes, Instruction, Operand};
