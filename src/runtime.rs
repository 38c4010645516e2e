//! The interface between the reload pass and the process hosting it.
//!
//! Everything the pass needs from the running process goes through the traits in this
//! module: which modules exist ([`ModuleInventory`]), how a serialized image becomes a live
//! module again ([`ImageLoader`]), and how the process-wide module load hook is replaced
//! ([`LoadHooks`]). A platform adapter implements all of them and the [`Host`] supertrait;
//! the crate itself never reaches into runtime internals.
//!
//! Live modules are shared as [`ModuleHandleRc`] (`Arc<dyn ModuleHandle>`), because the
//! same handle is referenced from the module set, the loaded-module table and the installed
//! resolver, which may be called from any thread once the pass is over.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A module loaded into the running process.
pub trait ModuleHandle: Send + Sync + fmt::Debug {
    /// Simple name, e.g. `Assembly-CSharp`.
    fn name(&self) -> &str;

    /// Full identity string, e.g. `Lib, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null`.
    fn full_name(&self) -> &str;

    /// Path the module was loaded from, `None` for modules loaded from memory.
    fn location(&self) -> Option<&Path>;

    /// The raw image the runtime holds for this module, if it can be recovered.
    fn raw_image(&self) -> Option<&[u8]>;

    /// Switch the module to (or back from) a metadata-only view whose code never runs.
    fn set_reflection_only(&self, reflection_only: bool);

    /// Returns true if the module is currently a metadata-only view.
    fn is_reflection_only(&self) -> bool;
}

/// Shared handle to a live module.
pub type ModuleHandleRc = Arc<dyn ModuleHandle>;

/// A third party extension and the module binaries it ships.
#[derive(Debug, Clone)]
pub struct Extension {
    /// Owner name used in diagnostics
    pub name: String,
    /// Module binaries the extension ships, in declared order
    pub declared_files: Vec<PathBuf>,
    /// Modules loaded on behalf of the extension, in load order
    pub loaded: Vec<ModuleHandleRc>,
}

impl Extension {
    /// Create an extension entry.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        declared_files: Vec<PathBuf>,
        loaded: Vec<ModuleHandleRc>,
    ) -> Self {
        Extension {
            name: name.into(),
            declared_files,
            loaded,
        }
    }
}

/// A system or runtime module known only by its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemModule {
    /// Name used in diagnostics
    pub friendly_name: String,
    /// Path of the module binary
    pub path: PathBuf,
}

/// Enumeration of the modules currently present in the process.
pub trait ModuleInventory {
    /// The main application module.
    fn main_module(&self) -> ModuleHandleRc;

    /// System and runtime modules. May include the main module's own path.
    fn system_modules(&self) -> Vec<SystemModule>;

    /// Extensions in load order.
    fn extensions(&self) -> Vec<Extension>;

    /// Every module currently loaded in the process, regardless of who loaded it.
    fn live_modules(&self) -> Vec<ModuleHandleRc>;
}

/// Loads serialized images into the running process.
pub trait ImageLoader {
    /// Load `image` as a new module, with its matching symbol stream if there is one.
    ///
    /// # Errors
    /// Returns a host specific description of why the image was rejected.
    fn load(&self, image: &[u8], symbols: Option<&[u8]>) -> Result<ModuleHandleRc, String>;
}

/// Module resolution override, consulted when the process is asked to load a module by
/// path.
///
/// Returning `None` lets the process fall through to its normal loading from disk.
pub trait ModuleResolver: Send + Sync {
    /// Resolve a load request for `path`.
    fn resolve(&self, path: &Path) -> Option<ModuleHandleRc>;
}

/// A module load hook registered in the process.
#[derive(Debug, Clone)]
pub struct LoadHook {
    /// Namespace of the type that registered the hook
    pub owner_namespace: String,
    /// Modules the hook holds on to
    pub captured: Vec<ModuleHandleRc>,
}

/// Access to the process-wide module load hook.
pub trait LoadHooks {
    /// Hooks registered so far.
    fn registered(&self) -> Vec<LoadHook>;

    /// Remove every registered hook.
    fn clear(&self);

    /// Install `resolver` as the module load hook.
    fn install(&self, resolver: Arc<dyn ModuleResolver>);
}

/// The process running a reload pass.
pub trait Host: ModuleInventory + ImageLoader + LoadHooks {
    /// Terminate the process once the pass has completed.
    fn request_exit(&self);
}
