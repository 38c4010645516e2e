//! The reload pass.
//!
//! A [`Reloader`] drives one pass over the modules of a running process:
//!
//! ```text
//! Discover -> ResolveDuplicates -> Transform -> Serialize -> LoadImages -> InstallRedirection -> Complete
//! ```
//!
//! Any step may fail, which ends the pass in [`PassState::Failed`]. Every module is staged as
//! bytes before the first one is loaded. The only changes a failed pass leaves behind are the
//! images it already loaded; modules it switched to reflection-only are switched back.
//!
//! The steps can be driven one at a time (tests, hosts that want to inspect the module set
//! between steps) or all at once through [`Reloader::run`], which turns errors into a
//! [`PassOutcome`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotswap::{
//!     reload::{PassOutcome, Reloader},
//!     runtime::Host,
//!     PatchRegistry, ReloadConfig,
//! };
//!
//! fn reload(host: &impl Host) {
//!     let config = ReloadConfig::from_args(std::env::args());
//!     let mut reloader = Reloader::new(host, config, PatchRegistry::new());
//!
//!     match reloader.run() {
//!         PassOutcome::Complete(report) => println!("Reloaded {} modules", report.loaded.len()),
//!         PassOutcome::Failed { state, error, .. } => eprintln!("{state} failed: {error}"),
//!     }
//! }
//! ```

mod context;
mod duplicates;
mod resolver;
mod state;

pub use context::{RedirectTable, ReloadContext};
pub use duplicates::{locate_module_file, read_identity_string, PathMatch};
pub use resolver::RedirectingResolver;
pub use state::{PassOutcome, PassReport, PassState};

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::ReloadConfig,
    diagnostics::Diagnostics,
    image::ModuleIdentity,
    module::{Module, ModuleSet, SymbolStatus},
    patch::{AttributeReconciler, PatchEngine, PatchRegistry, PatchResult},
    runtime::{Extension, Host, ModuleHandleRc},
    Error, Result,
};

/// Owner of the main application module in diagnostics.
pub const MAIN_OWNER: &str = "Application";

/// Owner of system modules in diagnostics.
pub const SYSTEM_OWNER: &str = "System";

/// An extension module waiting for duplicate resolution.
#[derive(Debug)]
struct Candidate {
    extension: usize,
    handle: ModuleHandleRc,
}

/// Runs one reload pass against a [`Host`].
pub struct Reloader<'h, H: Host> {
    host: &'h H,
    config: ReloadConfig,
    registry: PatchRegistry,
    reconciler: Option<Box<dyn AttributeReconciler>>,
    diagnostics: Diagnostics,
    state: PassState,
    set: ModuleSet,
    extensions: Vec<Extension>,
    candidates: Vec<Candidate>,
    context: Arc<ReloadContext>,
    load_order: Vec<String>,
    /// Handles to switch to reflection-only before the new images are loaded
    retiring: Vec<ModuleHandleRc>,
    /// Handles this pass switched to reflection-only
    reflection_only: Vec<ModuleHandleRc>,
    report: PassReport,
}

impl<'h, H: Host> Reloader<'h, H> {
    /// Create a pass over `host` with the patches in `registry`.
    #[must_use]
    pub fn new(host: &'h H, config: ReloadConfig, registry: PatchRegistry) -> Self {
        Reloader {
            host,
            diagnostics: Diagnostics::from_config(&config),
            config,
            registry,
            reconciler: None,
            state: PassState::Discover,
            set: ModuleSet::new(),
            extensions: Vec::new(),
            candidates: Vec::new(),
            context: Arc::new(ReloadContext::new()),
            load_order: Vec::new(),
            retiring: Vec::new(),
            reflection_only: Vec::new(),
            report: PassReport::default(),
        }
    }

    /// Run `reconciler` on every module flagged `process_attributes`.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Box<dyn AttributeReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// The state the pass is in; for a running pass, the next step to execute.
    #[must_use]
    pub fn state(&self) -> PassState {
        self.state
    }

    /// The module set built by [`Reloader::discover`].
    #[must_use]
    pub fn module_set(&self) -> &ModuleSet {
        &self.set
    }

    /// Mutable access to the module set, e.g. to force a reload between steps.
    pub fn module_set_mut(&mut self) -> &mut ModuleSet {
        &mut self.set
    }

    /// The tables shared with the installed resolver.
    #[must_use]
    pub fn context(&self) -> &Arc<ReloadContext> {
        &self.context
    }

    /// The diagnostic sink of this pass.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// What the pass has done so far.
    #[must_use]
    pub fn report(&self) -> &PassReport {
        &self.report
    }

    /// Modules in the order [`Reloader::load_images`] loads them, available after
    /// [`Reloader::serialize`].
    #[must_use]
    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }

    /// Run every remaining step.
    ///
    /// On success the host is asked to exit if `patch_and_exit` is configured. On failure
    /// every module this pass switched to reflection-only is switched back and the host
    /// keeps running its original modules.
    pub fn run(&mut self) -> PassOutcome {
        self.diagnostics.verbose("Starting reload pass");

        match self.run_steps() {
            Ok(()) => {
                self.diagnostics.info(format!(
                    "Reload complete: {} modules loaded, {} redirects",
                    self.report.loaded.len(),
                    self.report.redirects.len()
                ));
                if self.config.patch_and_exit {
                    self.diagnostics.info("Patching done, exiting");
                    self.host.request_exit();
                }
                PassOutcome::Complete(self.report.clone())
            }
            Err(error) => {
                let state = self.state;
                self.fail();
                self.diagnostics
                    .error(format!("Reload failed during {state}: {error}"));
                self.revert_reflection_only();
                PassOutcome::Failed {
                    state,
                    error,
                    report: self.report.clone(),
                }
            }
        }
    }

    fn run_steps(&mut self) -> Result<()> {
        loop {
            match self.state {
                PassState::Discover => self.discover()?,
                PassState::ResolveDuplicates => self.resolve_duplicates()?,
                PassState::Transform => self.transform()?,
                PassState::Serialize => self.serialize()?,
                PassState::LoadImages => self.load_images()?,
                PassState::InstallRedirection => self.install_redirection()?,
                PassState::Complete => return Ok(()),
                PassState::Failed => {
                    return Err(Error::InvalidTransition {
                        from: PassState::Failed,
                        to: PassState::Complete,
                    })
                }
            }
        }
    }

    /// Register the main module and the system modules, and collect the extension modules
    /// for duplicate resolution.
    ///
    /// The main module always needs a reload. A system module with the main module's name is
    /// skipped.
    ///
    /// # Errors
    /// Returns an error if called out of order or if a module cannot be read.
    pub fn discover(&mut self) -> Result<()> {
        self.enter(PassState::Discover)?;

        let main = self.host.main_module();
        self.set = ModuleSet::with_main(main.clone());

        let main_name = main.name().to_string();
        let mut module = Module::from_handle(
            MAIN_OWNER,
            main_name.clone(),
            main,
            &self.config.symbol_extension,
        )?;
        module.set_needs_reload();
        self.set.add(module)?;

        for system in self.host.system_modules() {
            let identity = ModuleIdentity::read_from_file(&system.path)?;
            if identity.name == main_name {
                self.diagnostics
                    .verbose(format!("Skipping main module at {}", system.path.display()));
                continue;
            }

            let mut module = Module::from_path(
                SYSTEM_OWNER,
                system.friendly_name,
                &system.path,
                &self.config.symbol_extension,
            )?;
            module.allow_patches = false;
            self.set.add(module)?;
        }

        self.extensions = self.host.extensions();
        self.candidates = self
            .extensions
            .iter()
            .enumerate()
            .flat_map(|(extension, entry)| {
                entry.loaded.iter().map(move |handle| Candidate {
                    extension,
                    handle: handle.clone(),
                })
            })
            .collect();

        self.diagnostics.verbose(format!(
            "Discovered {} modules and {} extension modules",
            self.set.len(),
            self.candidates.len()
        ));
        self.report.registered = self.registered_names();
        self.advance(PassState::Discover)?;
        Ok(())
    }

    /// Register extension modules, collapsing the ones whose identity is already in the
    /// set into redirects.
    ///
    /// A duplicate whose backing file cannot be located is logged and left out of the pass.
    ///
    /// # Errors
    /// Returns an error if called out of order or if a module cannot be read.
    pub fn resolve_duplicates(&mut self) -> Result<()> {
        self.enter(PassState::ResolveDuplicates)?;

        let candidates = std::mem::take(&mut self.candidates);
        for candidate in candidates {
            self.register_candidate(&candidate)?;
        }

        self.report.registered = self.registered_names();
        self.advance(PassState::ResolveDuplicates)?;
        Ok(())
    }

    fn register_candidate(&mut self, candidate: &Candidate) -> Result<()> {
        let extension = &self.extensions[candidate.extension];
        let handle = &candidate.handle;
        let name = handle.name().to_string();
        let friendly_name = format!("{}:{}", extension.name, name);

        let registered = self
            .set
            .get(&name)
            .map(|existing| existing.source_location().map(Path::to_path_buf));

        if let Some(existing_location) = registered {
            match locate_module_file(
                extension,
                handle.as_ref(),
                &self.diagnostics,
                read_identity_string,
            ) {
                PathMatch::Matched(location) => {
                    let target = handle
                        .location()
                        .map(Path::to_path_buf)
                        .or(existing_location);
                    match target {
                        Some(target) => self.record_redirect(location, target),
                        None => self.diagnostics.error(format!(
                            "Duplicate module has no backing file: {friendly_name}"
                        )),
                    }
                }
                PathMatch::NotFound => {
                    self.diagnostics
                        .error(format!("Duplicate module not found: {friendly_name}"));
                    self.report.unresolved.push(friendly_name);
                }
            }
            return Ok(());
        }

        let mut location = handle.location().map(Path::to_path_buf);
        if location.is_none() {
            let located = locate_module_file(
                extension,
                handle.as_ref(),
                &self.diagnostics,
                read_identity_string,
            );

            let live = self
                .host
                .live_modules()
                .into_iter()
                .find(|live| live.name() == name && live.location().is_some());

            if let Some(live) = live {
                self.diagnostics.verbose(format!(
                    "Using module loaded elsewhere in the process for {friendly_name}"
                ));

                let owner = extension.name.clone();
                let live_location = live.location().map(Path::to_path_buf);
                let mut module = Module::from_handle(
                    owner,
                    friendly_name,
                    live,
                    &self.config.symbol_extension,
                )?;
                module.process_attributes = true;
                self.set.add(module)?;
                self.retiring.push(handle.clone());

                if let (PathMatch::Matched(from), Some(to)) = (located, live_location) {
                    self.record_redirect(from, to);
                }
                return Ok(());
            }

            if let PathMatch::Matched(path) = located {
                location = Some(path);
            }
        }

        let exempt = self.config.is_patch_exempt(&name);
        let mut module = Module::from_handle(
            extension.name.clone(),
            friendly_name,
            handle.clone(),
            &self.config.symbol_extension,
        )?;
        module.set_source_location(location);
        module.allow_patches = !exempt;
        module.process_attributes = !exempt;
        self.set.add(module)?;
        Ok(())
    }

    fn record_redirect(&mut self, from: PathBuf, to: PathBuf) {
        if from == to {
            return;
        }

        self.diagnostics.verbose(format!(
            "Registering duplicate module redirect: {} -> {}",
            from.display(),
            to.display()
        ));
        match self.context.redirects.insert(from.clone(), to.clone()) {
            Ok(()) => self.report.redirects.push((from, to)),
            Err(e) => self.diagnostics.error(e),
        }
    }

    /// Apply free patches to every module that allows them and reconcile attributes, then
    /// mark every module that references a module needing reload as needing reload itself.
    ///
    /// # Errors
    /// Returns an error if called out of order, or if a patch or the reconciler fails on
    /// a module.
    pub fn transform(&mut self) -> Result<()> {
        self.enter(PassState::Transform)?;

        let main_identity = self
            .set
            .main_name()
            .and_then(|name| self.set.get(name))
            .map(|main| main.image().identity.clone())
            .ok_or_else(|| malformed_error!("Main module is not registered"))?;

        let engine = PatchEngine::new(&self.registry);
        for module in self.set.iter_mut() {
            if module.allow_patches {
                for record in engine.apply_all(module)? {
                    match record.result {
                        PatchResult::Applied { .. } => self.diagnostics.info(&record),
                        _ => self.diagnostics.verbose(&record),
                    }
                    self.report.patches.push(record);
                }
            }

            if module.process_attributes {
                if let Some(reconciler) = &self.reconciler {
                    if reconciler.reconcile(module.image_mut()?, &main_identity)? {
                        module.mark_modified();
                    }
                }
            }
        }

        propagate_reload(&mut self.set);

        self.report.modified = self
            .set
            .iter()
            .filter(|module| module.is_modified())
            .map(|module| module.name().to_string())
            .collect();
        self.advance(PassState::Transform)?;
        Ok(())
    }

    /// Stage every module that needs a reload as bytes, dump the modified ones if
    /// configured, and compute the load order.
    ///
    /// # Errors
    /// Returns an error if called out of order or a module fails to serialize.
    pub fn serialize(&mut self) -> Result<()> {
        self.enter(PassState::Serialize)?;

        let staged = self.set.serialize_pending()?;

        for name in &staged {
            let Some(module) = self.set.get(name) else {
                continue;
            };

            if !matches!(module.symbol_status(), SymbolStatus::Loaded(_)) {
                self.diagnostics.verbose(format!(
                    "Reloading without symbols ({:?}): {}",
                    module.symbol_status(),
                    module
                ));
                self.report.without_symbols.push(name.clone());
            }

            if let (Some(dir), true) = (&self.config.dump_dir, module.is_modified()) {
                if let Err(e) = dump(dir, module, &self.config.image_extension) {
                    self.diagnostics
                        .error(format!("Failed to dump {}: {}", module, e));
                }
            }
        }

        self.load_order = load_order(&self.set, &staged);
        self.report.serialized = staged;
        self.advance(PassState::Serialize)?;
        Ok(())
    }

    /// Switch the modules being replaced to reflection-only, then load the staged images in
    /// dependency order, the main module last.
    ///
    /// # Errors
    /// Returns an error if called out of order or the host rejects an image.
    pub fn load_images(&mut self) -> Result<()> {
        self.enter(PassState::LoadImages)?;

        for name in &self.load_order {
            if let Some(handle) = self
                .set
                .get(name)
                .and_then(Module::set_source_reflection_only)
            {
                self.reflection_only.push(handle);
            }
        }
        for handle in std::mem::take(&mut self.retiring) {
            handle.set_reflection_only(true);
            self.reflection_only.push(handle);
        }

        for name in &self.load_order {
            let module = self
                .set
                .get(name)
                .ok_or_else(|| malformed_error!("Staged module {} is not registered", name))?;
            let serialized = module.serialized()?;

            self.diagnostics.verbose(format!("Loading {module}"));
            let handle = self
                .host
                .load(&serialized.image, serialized.symbols.as_deref())
                .map_err(|message| Error::LoadFailed {
                    module: module.friendly_name().to_string(),
                    message,
                })?;

            self.context
                .record_loaded(name, module.source_location(), handle.clone());
            if self.set.is_main(name) {
                self.context.set_main(handle);
            }
            self.report.loaded.push(name.clone());
        }

        self.advance(PassState::LoadImages)?;
        Ok(())
    }

    /// Neutralize interop load hooks, clear every registered hook and install a
    /// [`RedirectingResolver`].
    ///
    /// # Errors
    /// Returns an error if called out of order.
    pub fn install_redirection(&mut self) -> Result<()> {
        self.enter(PassState::InstallRedirection)?;

        for hook in self.host.registered() {
            if !self.config.is_interop_namespace(&hook.owner_namespace) {
                continue;
            }

            self.diagnostics.verbose(format!(
                "Neutralizing load hook from {} ({} modules)",
                hook.owner_namespace,
                hook.captured.len()
            ));
            for handle in hook.captured {
                handle.set_reflection_only(true);
                self.reflection_only.push(handle);
            }
        }
        self.host.clear();

        let main_name = self.set.main_name().unwrap_or_default().to_string();
        self.host.install(Arc::new(RedirectingResolver::new(
            self.context.clone(),
            main_name,
        )));

        self.advance(PassState::InstallRedirection)?;
        Ok(())
    }

    fn enter(&self, step: PassState) -> Result<()> {
        if self.state != step || step.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: step,
            });
        }
        Ok(())
    }

    fn advance(&mut self, step: PassState) -> Result<()> {
        match step.next() {
            Some(next) if self.state == step && step.can_advance_to(next) => {
                self.state = next;
                Ok(())
            }
            next => Err(Error::InvalidTransition {
                from: self.state,
                to: next.unwrap_or(step),
            }),
        }
    }

    fn fail(&mut self) {
        if self.state.can_advance_to(PassState::Failed) {
            self.state = PassState::Failed;
        }
    }

    fn revert_reflection_only(&mut self) {
        for handle in self.reflection_only.drain(..) {
            handle.set_reflection_only(false);
        }
    }

    fn registered_names(&self) -> Vec<String> {
        self.set.names().into_iter().map(str::to_string).collect()
    }
}

/// Mark every module that references a module needing reload as needing reload, until
/// nothing changes.
fn propagate_reload(set: &mut ModuleSet) {
    loop {
        let pending: HashSet<String> = set
            .iter()
            .filter(|module| module.needs_reload())
            .map(|module| module.name().to_string())
            .collect();

        let mut changed = false;
        for module in set.iter_mut() {
            if module.needs_reload() {
                continue;
            }
            let stale = module
                .image()
                .assembly_refs
                .iter()
                .any(|reference| pending.contains(&reference.name));
            if stale {
                log::debug!("Reloading {} with its dependencies", module);
                module.set_needs_reload();
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

/// Staged modules ordered so each comes after the staged modules it references, stable by
/// registration order, with the main module last. Reference cycles are broken in
/// registration order.
fn load_order(set: &ModuleSet, staged: &[String]) -> Vec<String> {
    let mut remaining: Vec<&str> = staged
        .iter()
        .map(String::as_str)
        .filter(|name| !set.is_main(name))
        .collect();
    let mut order = Vec::with_capacity(staged.len());

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|name| {
                set.get(name).map_or(true, |module| {
                    module.image().assembly_refs.iter().all(|reference| {
                        reference.name == *name || !remaining.contains(&reference.name.as_str())
                    })
                })
            })
            .unwrap_or(0);
        order.push(remaining.remove(ready).to_string());
    }

    if let Some(main) = staged.iter().find(|name| set.is_main(name)) {
        order.push(main.clone());
    }
    order
}

fn dump(dir: &Path, module: &Module, extension: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.{}", module.name(), extension));
    std::fs::write(&path, &module.serialized()?.image)?;
    log::debug!("Dumped {} to {}", module, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        assembly::{opcodes, Instruction, Operand},
        image::{Image, MethodImport, ModuleIdentity, Token},
        patch::{FreePatch, InstructionPattern, MethodMatcher, ModuleTarget},
        runtime::{LoadHook, LoadHooks, ModuleHandle, ModuleInventory},
        test::{ImageBuilder, MockHost, MockModule},
    };

    fn patches() -> PatchRegistry {
        let mut registry = PatchRegistry::new();
        registry
            .register(FreePatch::redirect_call(
                "ReplaceCreate",
                "B",
                "B.Entry",
                "Start",
                MethodMatcher::named("Create"),
                MethodImport::new(
                    ModuleIdentity::new("Patches"),
                    "Patches.Replacements",
                    "Create",
                    vec![0x00, 0x00, 0x01],
                ),
            ))
            .register(FreePatch::rename_type(
                "RenameCamera",
                ModuleTarget::Any,
                "MainApp.Camera",
                "MainApp.CameraManager",
            ))
            .register(FreePatch::strip_to_return(
                "DontInitCamera",
                "MainApp",
                "MainApp.CameraManager",
                ".cctor",
                InstructionPattern::Mentions("Create".to_string()),
            ));
        registry
    }

    fn calling_b() -> Vec<u8> {
        ImageBuilder::new("B")
            .assembly_ref("MainApp")
            .type_ref("MainApp", "MainApp", "Factory")
            .member_ref("MainApp.Factory", "Create")
            .type_def("B", "Entry")
            .method(
                "Start",
                vec![
                    Instruction::new(opcodes::CALL, Operand::Token(Token::new(0x0A00_0001))),
                    Instruction::ret(),
                ],
            )
            .build_bytes()
    }

    fn host(dir: &Path) -> MockHost {
        let system_a = dir.join("A.dll");
        std::fs::write(
            &system_a,
            ImageBuilder::new("A").assembly_ref("MainApp").build_bytes(),
        )
        .unwrap();
        let system_main = dir.join("MainApp.dll");
        std::fs::write(&system_main, ImageBuilder::new("MainApp").build_bytes()).unwrap();
        let untouched = dir.join("Untouched.dll");
        std::fs::write(&untouched, ImageBuilder::new("Untouched").build_bytes()).unwrap();

        let mut host = MockHost::new(MockModule::in_memory(
            "MainApp",
            ImageBuilder::new("MainApp").build_bytes(),
        ));
        host.add_system("A", &system_a);
        host.add_system("MainApp", &system_main);
        host.add_system("Untouched", &untouched);
        host.add_extension(
            "X",
            vec![dir.join("B.dll")],
            vec![Arc::new(MockModule::in_memory("B", calling_b()))],
        );
        host
    }

    #[test]
    fn steps_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let mut reloader = Reloader::new(&host, ReloadConfig::default(), patches());

        assert!(matches!(
            reloader.transform(),
            Err(Error::InvalidTransition {
                from: PassState::Discover,
                to: PassState::Transform
            })
        ));

        reloader.discover().unwrap();
        assert_eq!(reloader.state(), PassState::ResolveDuplicates);
        assert_eq!(reloader.report().registered, vec!["MainApp", "A", "Untouched"]);

        reloader.resolve_duplicates().unwrap();
        assert_eq!(
            reloader.report().registered,
            vec!["MainApp", "A", "Untouched", "B"]
        );
        let b = reloader.module_set().get("B").unwrap();
        assert!(b.allow_patches && b.process_attributes);
        assert_eq!(b.source_location(), Some(dir.path().join("B.dll").as_path()));
        assert!(!reloader.module_set().get("A").unwrap().allow_patches);

        reloader.transform().unwrap();
        assert_eq!(reloader.report().modified, vec!["B"]);
        assert!(reloader.module_set().get("A").unwrap().needs_reload());
        assert!(!reloader.module_set().get("Untouched").unwrap().needs_reload());

        reloader.serialize().unwrap();
        assert_eq!(reloader.load_order(), ["A", "B", "MainApp"]);

        reloader.load_images().unwrap();
        reloader.install_redirection().unwrap();
        assert_eq!(reloader.state(), PassState::Complete);
        assert!(reloader.install_redirection().is_err());
    }

    #[test]
    fn run_completes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let main = host.main_module();
        let captured: ModuleHandleRc = Arc::new(MockModule::detached("Captured"));
        let foreign: ModuleHandleRc = Arc::new(MockModule::detached("Foreign"));
        host.add_hook(LoadHook {
            owner_namespace: "MonoMod.Utils.Interop".to_string(),
            captured: vec![captured.clone()],
        });
        host.add_hook(LoadHook {
            owner_namespace: "HarmonyLib".to_string(),
            captured: vec![foreign.clone()],
        });

        let mut reloader = Reloader::new(&host, ReloadConfig::default(), patches());
        let outcome = reloader.run();
        assert!(outcome.is_complete());

        let report = outcome.report();
        assert_eq!(report.loaded, vec!["A", "B", "MainApp"]);
        assert_eq!(report.applied().count(), 1);
        assert_eq!(report.not_applicable().count(), 1);
        assert!(captured.is_reflection_only());
        assert!(!foreign.is_reflection_only());
        assert!(host.registered().is_empty());
        assert_eq!(host.loaded_names(), vec!["A", "B", "MainApp"]);
        assert!(main.is_reflection_only());
        assert!(host.resolver().is_some());
        assert!(!host.exit_requested());
        assert_eq!(
            reloader.context().main().map(|m| m.name().to_string()),
            Some("MainApp".to_string())
        );
    }

    #[test]
    fn failure_reverts_reflection_only() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let main = host.main_mock();
        let stale: ModuleHandleRc = Arc::new(MockModule::detached("Stale"));
        host.add_hook(LoadHook {
            owner_namespace: "MonoMod.Utils".to_string(),
            captured: vec![stale.clone()],
        });
        host.fail_loading("MainApp");

        let mut reloader = Reloader::new(&host, ReloadConfig::default(), patches());
        match reloader.run() {
            PassOutcome::Failed { state, error, report } => {
                assert_eq!(state, PassState::LoadImages);
                assert!(matches!(error, Error::LoadFailed { .. }));
                assert_eq!(report.loaded, vec!["A", "B"]);
            }
            PassOutcome::Complete(_) => panic!("load failure must fail the pass"),
        }

        assert_eq!(reloader.state(), PassState::Failed);
        // Switched before loading, switched back on failure
        assert_eq!(main.reflection_only_changes(), 2);
        assert!(!main.is_reflection_only());
        assert!(!stale.is_reflection_only());
        assert!(host.resolver().is_none());
        assert!(reloader.discover().is_err());
    }

    struct RenameEntry {
        seen: Arc<Mutex<Vec<(String, ModuleIdentity)>>>,
    }

    impl AttributeReconciler for RenameEntry {
        fn reconcile(&self, image: &mut Image, main: &ModuleIdentity) -> Result<bool> {
            self.seen
                .lock()
                .unwrap()
                .push((image.identity.name.clone(), main.clone()));
            if image.identity.name != "B" {
                return Ok(false);
            }
            image.type_defs[0].name = "Reconciled".to_string();
            Ok(true)
        }
    }

    #[test]
    fn reconciler_marks_modules_modified() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = host(dir.path());
        host.add_extension(
            "Y",
            Vec::new(),
            vec![Arc::new(MockModule::in_memory(
                "ModDataAssembly",
                ImageBuilder::new("ModDataAssembly").build_bytes(),
            ))],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new())
            .with_reconciler(Box::new(RenameEntry { seen: seen.clone() }));
        reloader.discover().unwrap();
        reloader.resolve_duplicates().unwrap();
        assert!(reloader.module_set().get("ModDataAssembly").is_some());
        reloader.transform().unwrap();

        // System, main and exempt modules are not reconciled
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "B");
        let main = reloader.module_set().get("MainApp").unwrap();
        assert_eq!(seen[0].1, main.image().identity);

        assert_eq!(reloader.report().modified, vec!["B"]);
        let b = reloader.module_set().get("B").unwrap();
        assert!(b.is_modified() && b.needs_reload());
        assert!(!reloader.module_set().get("ModDataAssembly").unwrap().needs_reload());

        reloader.serialize().unwrap();
        let b = reloader.module_set().get("B").unwrap();
        let written = Image::parse(&b.serialized().unwrap().image).unwrap();
        assert_eq!(written.type_defs[0].name, "Reconciled");

        reloader.load_images().unwrap();
        assert_eq!(host.loaded_names(), vec!["A", "B", "MainApp"]);
    }

    #[test]
    fn terminal_states_are_final() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());

        let mut reloader = Reloader::new(&host, ReloadConfig::default(), patches());
        assert!(reloader.run().is_complete());
        assert!(matches!(
            reloader.discover(),
            Err(Error::InvalidTransition {
                from: PassState::Complete,
                to: PassState::Discover
            })
        ));

        let dir = tempfile::tempdir().unwrap();
        let failing = self::host(dir.path());
        failing.fail_loading("MainApp");
        let mut failed = Reloader::new(&failing, ReloadConfig::default(), patches());
        assert!(!failed.run().is_complete());
        assert_eq!(failed.state(), PassState::Failed);

        match failed.run() {
            PassOutcome::Failed { state, error, .. } => {
                assert_eq!(state, PassState::Failed);
                assert!(matches!(error, Error::InvalidTransition { .. }));
            }
            PassOutcome::Complete(_) => panic!("a failed pass cannot complete"),
        }
        assert_eq!(failed.state(), PassState::Failed);
    }

    #[test]
    fn load_order_follows_references() {
        let mut set = ModuleSet::with_main(Arc::new(MockModule::detached("MainApp")));
        for (name, refs) in [
            ("MainApp", vec!["C"]),
            ("C", vec!["D", "MainApp"]),
            ("D", vec![]),
            ("E", vec!["F"]),
            ("F", vec!["E"]),
        ] {
            let mut builder = ImageBuilder::new(name);
            for reference in refs {
                builder = builder.assembly_ref(reference);
            }
            set.add(crate::test::module_from_image("X", builder.build()))
                .unwrap();
        }

        let staged: Vec<String> = ["MainApp", "C", "D", "E", "F"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(load_order(&set, &staged), vec!["D", "C", "E", "F", "MainApp"]);
    }
}
