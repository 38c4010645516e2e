//! End-to-end reload passes against a scripted host process.

mod common;

use std::path::{Path, PathBuf};

use common::{bytes, caller_image, module_image, write_module, LiveModule, ScriptedHost};
use dotswap::{
    image::{Image, MethodImport, ModuleIdentity, Token},
    patch::{apply, FreePatch, InstructionPattern, MethodMatcher, ModuleTarget, PatchResult},
    prelude::*,
    symbols::{Document, MethodSymbols, PortableSymbols, SequencePoint, NATIVE_SIGNATURE},
};

fn redirect_create() -> FreePatch {
    FreePatch::redirect_call(
        "ReplaceCreate",
        "B",
        "B.Entry",
        "Start",
        MethodMatcher::named("Create").on_type("MainApp.Factory"),
        MethodImport::new(
            ModuleIdentity::new("Patches"),
            "Patches.Replacements",
            "Create",
            vec![0x00, 0x00, 0x01],
        ),
    )
}

fn registry() -> PatchRegistry {
    let mut registry = PatchRegistry::new();
    registry.register(redirect_create()).register(FreePatch::strip_to_return(
        "DontCreateCamera",
        "MainApp",
        "MainApp.CameraManager",
        ".cctor",
        InstructionPattern::Mentions("Create".to_string()),
    ));
    registry
}

/// The process of the scenario: main module `MainApp` loaded from memory, system module `A`
/// referencing it, and extension `X` shipping `B`, which calls into `MainApp`.
fn scenario(dir: &Path) -> ScriptedHost {
    let a = write_module(dir, "A.dll", &module_image("A", &["MainApp"]));
    let standalone = write_module(dir, "Standalone.dll", &module_image("Standalone", &[]));
    let main_file = write_module(dir, "MainApp.dll", &module_image("MainApp", &[]));

    ScriptedHost::new(LiveModule::from_memory(
        "MainApp",
        bytes(&module_image("MainApp", &[])),
    ))
    .system("A", &a)
    .system("Standalone", &standalone)
    .system("MainApp", &main_file)
    .extension(
        "X",
        vec![dir.join("B.dll")],
        vec![LiveModule::from_memory("B", bytes(&caller_image("B", "MainApp")))],
    )
}

#[test]
fn reloads_in_dependency_order() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let host = scenario(dir.path());

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), registry());
    let outcome = reloader.run();
    assert!(outcome.is_complete());

    let report = outcome.report();
    assert_eq!(report.registered, vec!["MainApp", "A", "Standalone", "B"]);
    assert_eq!(report.modified, vec!["B"]);
    assert_eq!(report.loaded, vec!["A", "B", "MainApp"]);
    assert_eq!(host.loaded_names(), vec!["A", "B", "MainApp"]);

    let applied: Vec<String> = report.applied().map(ToString::to_string).collect();
    assert_eq!(applied, vec!["Applied ReplaceCreate to B (1 changes)"]);
    assert_eq!(report.not_applicable().count(), 1);

    // The new B calls the replacement
    let b = Image::parse(&host.loaded_image("B").unwrap().image)?;
    let call = &b.methods[0].body.as_ref().unwrap().instructions[1];
    let target = b.member_name(call.token().unwrap()).unwrap();
    assert_eq!(target.declaring_type.as_deref(), Some("Patches.Replacements"));
    assert!(b.references("Patches"));

    assert!(host.main().is_reflection_only());
    assert_eq!(reloader.state(), PassState::Complete);
    Ok(())
}

#[test]
fn unmodified_modules_pass_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let host = scenario(dir.path());

    let outcome = Reloader::new(&host, ReloadConfig::default(), registry()).run();
    assert!(outcome.is_complete());

    assert_eq!(
        host.loaded_image("A").unwrap().image,
        std::fs::read(dir.path().join("A.dll"))?
    );
    assert_eq!(
        host.loaded_image("MainApp").unwrap().image,
        bytes(&module_image("MainApp", &[]))
    );
    assert!(host.loaded_image("Standalone").is_none());
    Ok(())
}

#[test]
fn redirect_twice_is_byte_identical() -> Result<()> {
    let patch = redirect_create();

    let mut once = caller_image("B", "MainApp");
    assert_eq!(apply(&mut once, &patch)?, PatchResult::Applied { changes: 1 });

    let mut twice = once.clone();
    assert_eq!(apply(&mut twice, &patch)?, PatchResult::Unchanged);

    let mut once_module = Module::from_bytes("X", "B", bytes(&once), None)?;
    once_module.mark_modified();
    let mut twice_module = Module::from_bytes("X", "B", bytes(&twice), None)?;
    twice_module.mark_modified();

    assert_eq!(
        once_module.serialize()?.image,
        twice_module.serialize()?.image
    );
    Ok(())
}

#[test]
fn symbols_follow_rewritten_modules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let image = caller_image("B", "MainApp");
    let b_path = write_module(dir.path(), "B.dll", &image);

    let mut symbols = PortableSymbols::new(image.pdb_id(), vec![Document::new("Entry.cs")]);
    symbols.type_system_rows = image.table_rows();
    symbols.methods = vec![MethodSymbols::new(
        Token::new(0x0600_0001),
        vec![
            (0, SequencePoint::new(0, 10, 9, 10, 11)),
            (1, SequencePoint::new(0, 11, 9, 11, 40)),
        ],
    )];
    std::fs::write(dir.path().join("B.pdb"), symbols.to_bytes()?)?;

    // Native symbols on a system module are ignored, not fatal
    let a = write_module(dir.path(), "A.dll", &module_image("A", &["MainApp"]));
    std::fs::write(dir.path().join("A.pdb"), NATIVE_SIGNATURE)?;

    let host = ScriptedHost::new(LiveModule::from_memory(
        "MainApp",
        bytes(&module_image("MainApp", &[])),
    ))
    .system("A", &a)
    .extension("X", vec![b_path.clone()], vec![LiveModule::from_file("B", &b_path)]);

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), registry());
    let outcome = reloader.run();
    assert!(outcome.is_complete());
    assert_eq!(outcome.report().without_symbols, vec!["MainApp", "A"]);
    assert_eq!(
        reloader.module_set().get("A").unwrap().symbol_status(),
        &SymbolStatus::Unsupported
    );

    let loaded = host.loaded_image("B").unwrap();
    let rewritten = PortableSymbols::parse(&loaded.symbols.unwrap())?;
    assert_eq!(rewritten.pdb_id, Image::parse(&loaded.image)?.pdb_id());
    assert_eq!(rewritten.documents[0].name, "Entry.cs");
    let offsets: Vec<u32> = rewritten.methods[0].points.iter().map(|p| p.0).collect();
    assert_eq!(offsets, vec![0, 1]);
    assert!(host.loaded_image("A").unwrap().symbols.is_none());
    Ok(())
}

#[test]
fn failed_pass_keeps_original_modules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let stale = LiveModule::from_memory("MonoMod.Dynamic", Vec::new());
    let host = scenario(dir.path())
        .hook("MonoMod.Utils", vec![stale.clone()])
        .reject("MainApp");

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), registry());
    match reloader.run() {
        PassOutcome::Failed { state, error, report } => {
            assert_eq!(state, PassState::LoadImages);
            assert!(matches!(error, Error::LoadFailed { ref module, .. } if module == "MainApp"));
            assert_eq!(report.loaded, vec!["A", "B"]);
        }
        PassOutcome::Complete(_) => panic!("a rejected image must fail the pass"),
    }

    assert_eq!(reloader.state(), PassState::Failed);
    assert_eq!(host.main().toggles(), 2);
    assert!(!host.main().is_reflection_only());
    assert!(!stale.is_reflection_only());
    assert!(host.resolver().is_none());
    assert_eq!(host.registered().len(), 1);
    assert!(!host.exit_requested());

    let carried = reloader.diagnostics().drain_carried();
    assert!(carried
        .iter()
        .any(|m| m.severity == Severity::Error && m.message.contains("LoadImages")));
    Ok(())
}

#[test]
fn patch_and_exit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let host = scenario(dir.path());
    let dump_dir = dir.path().join("dump");
    let config = ReloadConfig::from_args([
        "-patchandexit".to_string(),
        format!("--dumpasms={}", dump_dir.display()),
    ]);

    let outcome = Reloader::new(&host, config, registry()).run();
    assert!(outcome.is_complete());
    assert!(host.exit_requested());

    // Only modified modules are dumped
    let dumped = dir.path().join("dump").join("B.dll");
    assert_eq!(std::fs::read(dumped)?, host.loaded_image("B").unwrap().image);
    assert!(!dir.path().join("dump").join("A.dll").exists());
    Ok(())
}

#[test]
fn late_loads_resolve_to_new_modules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let host = scenario(dir.path())
        .hook("MonoMod.Utils.Cil", vec![LiveModule::from_memory("Dyn", Vec::new())])
        .hook("Game.Loader", Vec::new());

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), registry());
    assert!(reloader.run().is_complete());
    assert!(host.registered().is_empty());

    let resolver = host.resolver().unwrap();

    // By source location
    let b = resolver.resolve(&dir.path().join("B.dll")).unwrap();
    assert_eq!(b.name(), "B");
    assert!(!b.is_reflection_only());

    // The stale copy of the main module on disk resolves to the new main module
    let main = resolver.resolve(&dir.path().join("MainApp.dll")).unwrap();
    let new_main = reloader.context().main().unwrap();
    assert!(std::sync::Arc::ptr_eq(&main, &new_main));

    // A copy of A elsewhere resolves by name
    let copy = write_module(dir.path(), "ACopy.dll", &module_image("A", &[]));
    assert_eq!(resolver.resolve(&copy).unwrap().name(), "A");

    // Modules that were not reloaded fall through to disk
    assert!(resolver.resolve(&dir.path().join("Standalone.dll")).is_none());
    assert!(resolver.resolve(&PathBuf::from("/nonexistent/C.dll")).is_none());
    Ok(())
}

#[test]
fn steps_cannot_be_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let host = scenario(dir.path());
    let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new());

    reloader.discover().unwrap();
    assert!(matches!(
        reloader.serialize(),
        Err(Error::InvalidTransition {
            from: PassState::ResolveDuplicates,
            to: PassState::Serialize
        })
    ));

    // Resuming through run picks up where the steps left off
    let outcome = reloader.run();
    assert!(outcome.is_complete());
    assert!(outcome.report().modified.is_empty());
    assert_eq!(outcome.report().loaded, vec!["A", "B", "MainApp"]);
}

#[test]
fn any_module_rename() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let host = scenario(dir.path());
    let mut registry = PatchRegistry::new();
    registry.register(FreePatch::rename_type(
        "RenameFactory",
        ModuleTarget::Any,
        "MainApp.Factory",
        "MainApp.LegacyFactory",
    ));

    let outcome = Reloader::new(&host, ReloadConfig::default(), registry).run();
    assert_eq!(outcome.report().modified, vec!["B"]);

    let b = Image::parse(&host.loaded_image("B").unwrap().image)?;
    assert_eq!(b.type_refs[0].name, "LegacyFactory");
    assert_eq!(b.type_refs[0].namespace, "MainApp");
    Ok(())
}

/// A system module that may not be patched, an extension module with a rename, and a main
/// module with a redirected call.
#[test]
fn patches_main_and_extension_modules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let a = write_module(dir.path(), "A.dll", &module_image("A", &["MainApp"]));
    let host = ScriptedHost::new(LiveModule::from_memory(
        "MainApp",
        bytes(&caller_image("MainApp", "Engine")),
    ))
    .system("A", &a)
    .extension(
        "X",
        vec![dir.path().join("B.dll")],
        vec![LiveModule::from_memory("B", bytes(&caller_image("B", "Lib")))],
    );

    let mut registry = PatchRegistry::new();
    registry
        .register(FreePatch::rename_type(
            "RenameFactory",
            ModuleTarget::Named("B".to_string()),
            "Lib.Factory",
            "Lib.Factory2",
        ))
        .register(FreePatch::redirect_call(
            "RedirectCreate",
            "MainApp",
            "MainApp.Entry",
            "Start",
            MethodMatcher::named("Create"),
            MethodImport::new(
                ModuleIdentity::new("Engine"),
                "Engine.Pool",
                "Rent",
                vec![0x00, 0x00, 0x01],
            ),
        ));

    let outcome = Reloader::new(&host, ReloadConfig::default(), registry).run();
    assert!(outcome.is_complete());
    assert_eq!(outcome.report().modified, vec!["MainApp", "B"]);
    assert_eq!(host.loaded_names(), vec!["A", "B", "MainApp"]);
    assert_eq!(host.loaded_image("A").unwrap().image, std::fs::read(&a)?);

    let b = Image::parse(&host.loaded_image("B").unwrap().image)?;
    assert_eq!(b.type_ref_full_name(0).as_deref(), Some("Lib.Factory2"));

    let main = Image::parse(&host.loaded_image("MainApp").unwrap().image)?;
    let call = &main.methods[0].body.as_ref().unwrap().instructions[1];
    let target = main.member_name(call.token().unwrap()).unwrap();
    assert_eq!(target.name, "Rent");
    assert_eq!(target.declaring_type.as_deref(), Some("Engine.Pool"));
    Ok(())
}
