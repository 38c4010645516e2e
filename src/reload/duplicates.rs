//! Locating the file behind an extension module.
//!
//! An extension may ship its own copy of a module that something else already loaded, and a
//! module loaded from memory does not know which file it came from. [`locate_module_file`]
//! maps a loaded module back to one of the files its extension declared:
//!
//! 1. A module that knows its location and whose location is declared is taken as is.
//! 2. If the extension declared exactly as many files as it has loaded modules, files and
//!    modules correspond by position.
//! 3. Otherwise every declared file's identity is read and compared with the module's
//!    identity string; the first exact match wins.

use std::path::{Path, PathBuf};

use crate::{
    diagnostics::Diagnostics,
    image::ModuleIdentity,
    runtime::{Extension, ModuleHandle},
    Result,
};

/// Where a loaded extension module came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    /// The declared file backing the module
    Matched(PathBuf),
    /// No declared file could be matched
    NotFound,
}

impl PathMatch {
    /// The matched path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            PathMatch::Matched(path) => Some(path),
            PathMatch::NotFound => None,
        }
    }
}

/// Find the declared file of `extension` that backs `module`.
///
/// `read_identity` returns the identity string of a module file; files it fails on are
/// skipped.
pub fn locate_module_file<F>(
    extension: &Extension,
    module: &dyn ModuleHandle,
    diagnostics: &Diagnostics,
    read_identity: F,
) -> PathMatch
where
    F: Fn(&Path) -> Result<String>,
{
    if let Some(location) = module.location() {
        if extension.declared_files.iter().any(|file| file == location) {
            return PathMatch::Matched(location.to_path_buf());
        }
    }

    if extension.declared_files.len() != extension.loaded.len() {
        diagnostics.error(format!(
            "Module file count mismatch for {}: {} files, {} loaded modules",
            extension.name,
            extension.declared_files.len(),
            extension.loaded.len()
        ));

        for file in &extension.declared_files {
            match read_identity(file) {
                Ok(identity) if identity == module.full_name() => {
                    return PathMatch::Matched(file.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    diagnostics.verbose(format!("Failed to read {}: {}", file.display(), e));
                }
            }
        }

        return PathMatch::NotFound;
    }

    extension
        .loaded
        .iter()
        .position(|loaded| loaded.full_name() == module.full_name())
        .and_then(|position| extension.declared_files.get(position))
        .map_or(PathMatch::NotFound, |file| PathMatch::Matched(file.clone()))
}

/// Identity string of the module file at `path`, as compared by [`locate_module_file`].
///
/// # Errors
/// Returns an error if the file cannot be read or has no valid header.
pub fn read_identity_string(path: &Path) -> Result<String> {
    Ok(ModuleIdentity::read_from_file(path)?.display_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runtime::ModuleHandleRc, test::MockModule, Error};
    use std::sync::Arc;

    fn handle(name: &str) -> ModuleHandleRc {
        Arc::new(MockModule::detached(name))
    }

    fn full(name: &str) -> String {
        ModuleIdentity::new(name).display_name()
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| PathBuf::from(format!("/mods/X/{name}.dll")))
            .collect()
    }

    /// Identity reader that derives the identity from the file stem, mismatched on purpose
    /// for `Swapped` so ordinal and identity matching can be told apart.
    fn by_stem(path: &Path) -> Result<String> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or(Error::Empty)?;
        Ok(match stem {
            "Swapped" => full("Lib"),
            "Broken" => return Err(Error::OutOfBounds),
            other => full(other),
        })
    }

    #[test]
    fn location_wins() {
        let lib: ModuleHandleRc = Arc::new(MockModule::on_disk("Lib", Path::new("/mods/X/Lib.dll")));
        let extension = Extension::new("X", files(&["Lib"]), vec![lib.clone()]);

        assert_eq!(
            locate_module_file(&extension, lib.as_ref(), &Diagnostics::default(), |_| {
                Err(Error::Empty)
            }),
            PathMatch::Matched(PathBuf::from("/mods/X/Lib.dll"))
        );
    }

    #[test]
    fn ordinal_when_counts_agree() {
        let lib = handle("Lib");
        let other = handle("Other");
        let extension = Extension::new(
            "X",
            files(&["Other", "Swapped"]),
            vec![other.clone(), lib.clone()],
        );

        // Position 1 is Swapped; identities are never read
        let result = locate_module_file(&extension, lib.as_ref(), &Diagnostics::default(), |_| {
            Err(Error::Empty)
        });
        assert_eq!(result, PathMatch::Matched(PathBuf::from("/mods/X/Swapped.dll")));
        assert_eq!(result.path(), Some(Path::new("/mods/X/Swapped.dll")));
    }

    #[test]
    fn identity_when_counts_differ() {
        let lib = handle("Lib");
        let extension = Extension::new(
            "X",
            files(&["Broken", "Other", "Swapped", "Lib"]),
            vec![lib.clone()],
        );

        assert_eq!(
            locate_module_file(&extension, lib.as_ref(), &Diagnostics::default(), by_stem),
            PathMatch::Matched(PathBuf::from("/mods/X/Swapped.dll"))
        );
    }

    #[test]
    fn not_found() {
        let lib = handle("Lib");

        let extension = Extension::new("X", files(&["Other", "Broken"]), vec![lib.clone()]);
        assert_eq!(
            locate_module_file(&extension, lib.as_ref(), &Diagnostics::default(), by_stem),
            PathMatch::NotFound
        );
        assert_eq!(PathMatch::NotFound.path(), None);

        // Counts agree but the module is not among the extension's loaded modules
        let extension = Extension::new("X", files(&["Other"]), vec![handle("Other")]);
        assert_eq!(
            locate_module_file(&extension, lib.as_ref(), &Diagnostics::default(), by_stem),
            PathMatch::NotFound
        );
    }
}
