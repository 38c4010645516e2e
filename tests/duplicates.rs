//! Extension modules that duplicate modules already in the pass.

mod common;

use std::path::PathBuf;

use common::{bytes, module_image, write_module, LiveModule, ScriptedHost};
use dotswap::prelude::*;

fn main_module() -> std::sync::Arc<LiveModule> {
    LiveModule::from_memory("MainApp", bytes(&module_image("MainApp", &[])))
}

fn in_memory_lib() -> std::sync::Arc<LiveModule> {
    LiveModule::from_memory("Lib", bytes(&module_image("Lib", &["MainApp"])))
}

/// Two extensions each ship a copy of `Lib`, both loaded from memory. The second copy is
/// redirected to the file the first one came from.
#[test]
fn second_copy_redirects_to_first() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let w_lib = PathBuf::from("/mods/W/Lib.dll");
    let x_lib = PathBuf::from("/mods/X/Lib.dll");

    let host = ScriptedHost::new(main_module())
        .extension("W", vec![w_lib.clone()], vec![in_memory_lib()])
        .extension("X", vec![x_lib.clone()], vec![in_memory_lib()]);

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new());
    let outcome = reloader.run();
    assert!(outcome.is_complete());

    let report = outcome.report();
    assert_eq!(report.registered, vec!["MainApp", "Lib"]);
    assert_eq!(report.redirects, vec![(x_lib.clone(), w_lib.clone())]);
    assert!(report.unresolved.is_empty());
    assert_eq!(host.loaded_names(), vec!["Lib", "MainApp"]);

    let lib = reloader.module_set().get("Lib").unwrap();
    assert_eq!(lib.friendly_name(), "W:Lib");
    assert_eq!(lib.owner(), "W");
    assert_eq!(lib.source_location(), Some(w_lib.as_path()));

    // Requests for either copy land on the reloaded module
    let resolver = host.resolver().unwrap();
    let from_x = resolver.resolve(&x_lib).unwrap();
    let from_w = resolver.resolve(&w_lib).unwrap();
    assert!(std::sync::Arc::ptr_eq(&from_x, &from_w));
    assert_eq!(from_x.name(), "Lib");
    Ok(())
}

/// When the number of declared files and loaded modules differ, files are matched by the
/// identity they declare.
#[test]
fn mismatched_counts_match_by_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let other = write_module(dir.path(), "Other.dll", &module_image("Other", &[]));
    let swapped = write_module(dir.path(), "Swapped.dll", &module_image("Lib", &["MainApp"]));
    let broken = dir.path().join("Broken.dll");
    std::fs::write(&broken, b"not a module")?;

    let host = ScriptedHost::new(main_module()).extension(
        "Y",
        vec![broken, other, swapped.clone()],
        vec![in_memory_lib()],
    );

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new());
    assert!(reloader.run().is_complete());
    assert_eq!(
        reloader.module_set().get("Lib").unwrap().source_location(),
        Some(swapped.as_path())
    );

    let carried = reloader.diagnostics().drain_carried();
    assert!(carried
        .iter()
        .any(|m| m.severity == Severity::Error && m.message.contains("count mismatch for Y")));
    Ok(())
}

#[test]
fn unlocated_duplicate_is_left_out() -> Result<()> {
    let host = ScriptedHost::new(main_module())
        .extension("W", vec![PathBuf::from("/mods/W/Lib.dll")], vec![in_memory_lib()])
        .extension("Z", Vec::new(), vec![in_memory_lib()]);

    let outcome = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new()).run();
    assert!(outcome.is_complete());

    let report = outcome.report();
    assert_eq!(report.unresolved, vec!["Z:Lib"]);
    assert!(report.redirects.is_empty());
    assert_eq!(report.registered, vec!["MainApp", "Lib"]);
    assert_eq!(host.loaded_names(), vec!["Lib", "MainApp"]);
    Ok(())
}

/// An extension loads `Lib` from memory while the process already has `Lib` loaded from
/// its own directory. The on-disk module is the one reloaded; the in-memory copy retires.
#[test]
fn live_module_on_disk_wins() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let game = dir.path().join("game");
    std::fs::create_dir_all(&game)?;
    let game_lib = write_module(&game, "Lib.dll", &module_image("Lib", &["MainApp"]));
    let v_lib = dir.path().join("mods").join("V").join("Lib.dll");

    let live = LiveModule::from_file("Lib", &game_lib);
    let candidate = in_memory_lib();
    let host = ScriptedHost::new(main_module())
        .other(live.clone())
        .extension("V", vec![v_lib.clone()], vec![candidate.clone()]);

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new());
    let outcome = reloader.run();
    assert!(outcome.is_complete());

    let lib = reloader.module_set().get("Lib").unwrap();
    assert_eq!(lib.friendly_name(), "V:Lib");
    assert_eq!(lib.source_location(), Some(game_lib.as_path()));
    assert!(lib.process_attributes);
    assert_eq!(outcome.report().redirects, vec![(v_lib.clone(), game_lib.clone())]);

    assert!(candidate.is_reflection_only());
    assert!(live.is_reflection_only());
    assert_eq!(
        host.loaded_image("Lib").unwrap().image,
        std::fs::read(&game_lib)?
    );

    let resolved = host.resolver().unwrap().resolve(&v_lib).unwrap();
    assert!(!resolved.is_reflection_only());
    assert_eq!(resolved.name(), "Lib");
    Ok(())
}

#[test]
fn patch_exempt_extension_modules() -> Result<()> {
    let data = LiveModule::from_memory(
        "ModDataAssembly",
        bytes(&module_image("ModDataAssembly", &["MainApp"])),
    );
    let host = ScriptedHost::new(main_module()).extension(
        "W",
        vec![PathBuf::from("/mods/W/ModDataAssembly.dll")],
        vec![data],
    );

    let mut reloader = Reloader::new(&host, ReloadConfig::default(), PatchRegistry::new());
    assert!(reloader.run().is_complete());

    let module = reloader.module_set().get("ModDataAssembly").unwrap();
    assert!(!module.allow_patches);
    assert!(!module.process_attributes);
    assert!(module.needs_reload());
    Ok(())
}

#[test]
fn redirects_never_form_cycles() {
    let table = RedirectTable::new();
    let a = PathBuf::from("/mods/A/Lib.dll");
    let b = PathBuf::from("/mods/B/Lib.dll");
    let c = PathBuf::from("/game/Lib.dll");

    table.insert(a.clone(), b.clone()).unwrap();
    table.insert(b.clone(), c.clone()).unwrap();
    assert_eq!(table.resolve(&a), c);

    assert!(matches!(
        table.insert(c.clone(), a.clone()),
        Err(Error::RedirectCycle { .. })
    ));
    assert!(table.insert(c.clone(), c.clone()).is_err());
    assert_eq!(table.len(), 2);

    // Replacing an entry may not close a loop either
    assert!(table.insert(b.clone(), a.clone()).is_err());
    table.insert(a.clone(), c.clone()).unwrap();
    assert_eq!(table.entries(), vec![(a.clone(), c.clone()), (b, c.clone())]);
    assert_eq!(table.resolve(&a), c);
}
