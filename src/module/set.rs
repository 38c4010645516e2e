//! The registry of modules taking part in a reload pass.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::{module::Module, runtime::ModuleHandleRc, Error, Result};

/// Modules keyed by logical name, in registration order.
///
/// Names are unique. Registering a second module under an existing name is rejected; the
/// caller is expected to have run duplicate resolution first.
#[derive(Debug, Default)]
pub struct ModuleSet {
    modules: Vec<Module>,
    index: HashMap<String, usize>,
    main: Option<ModuleHandleRc>,
}

impl ModuleSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set for the process whose main module is `main`.
    #[must_use]
    pub fn with_main(main: ModuleHandleRc) -> Self {
        ModuleSet {
            main: Some(main),
            ..Self::default()
        }
    }

    /// The original handle of the main application module.
    #[must_use]
    pub fn main(&self) -> Option<&ModuleHandleRc> {
        self.main.as_ref()
    }

    /// Name of the main application module.
    #[must_use]
    pub fn main_name(&self) -> Option<&str> {
        self.main.as_ref().map(|main| main.name())
    }

    /// Returns true if `name` is the main application module.
    #[must_use]
    pub fn is_main(&self, name: &str) -> bool {
        self.main_name() == Some(name)
    }

    /// Register `module` under its logical name.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateModule`] if the name is already registered.
    pub fn add(&mut self, module: Module) -> Result<&mut Module> {
        if self.index.contains_key(module.name()) {
            return Err(Error::DuplicateModule(module.name().to_string()));
        }

        let position = self.modules.len();
        self.index.insert(module.name().to_string(), position);
        self.modules.push(module);
        Ok(&mut self.modules[position])
    }

    /// Returns true if a module named `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// The module registered as `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.index.get(name).map(|position| &self.modules[*position])
    }

    /// Mutable access to the module registered as `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.index
            .get(name)
            .map(|position| &mut self.modules[*position])
    }

    /// Registration position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    /// Mutable modules in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.modules.iter_mut()
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(Module::name).collect()
    }

    /// Serialize every module that needs a reload, in parallel.
    ///
    /// Returns the names of the serialized modules in registration order.
    ///
    /// # Errors
    /// Returns the first serialization error; modules that serialized successfully keep
    /// their result.
    pub fn serialize_pending(&mut self) -> Result<Vec<String>> {
        self.modules
            .par_iter_mut()
            .filter(|module| module.needs_reload())
            .map(|module| module.serialize().map(|_| ()))
            .collect::<Result<Vec<()>>>()?;

        Ok(self
            .modules
            .iter()
            .filter(|module| module.needs_reload())
            .map(|module| module.name().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::module;

    #[test]
    fn add_and_lookup() {
        let mut set = ModuleSet::new();
        set.add(module("Host", "MainApp")).unwrap();
        set.add(module("System", "A")).unwrap().allow_patches = false;

        assert!(set.contains("A"));
        assert!(!set.contains("B"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.names(), vec!["MainApp", "A"]);
        assert_eq!(set.position("A"), Some(1));
        assert!(!set.get("A").unwrap().allow_patches);
        assert!(set.get_mut("MainApp").unwrap().allow_patches);
    }

    #[test]
    fn rejects_duplicates() {
        let mut set = ModuleSet::new();
        set.add(module("System", "Lib")).unwrap();

        let err = set.add(module("ModX", "Lib")).unwrap_err();
        assert!(matches!(err, Error::DuplicateModule(name) if name == "Lib"));
        assert_eq!(set.get("Lib").unwrap().owner(), "System");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serialize_only_pending() {
        let mut set = ModuleSet::new();
        set.add(module("System", "A")).unwrap();
        set.add(module("Mod", "B")).unwrap().mark_modified();
        set.add(module("Mod", "C")).unwrap().set_needs_reload();

        assert_eq!(set.serialize_pending().unwrap(), vec!["B", "C"]);
        assert!(set.get("A").unwrap().serialized().is_err());
        assert!(set.get("B").unwrap().serialized().unwrap().reencoded);
        assert!(!set.get("C").unwrap().serialized().unwrap().reencoded);

        assert!(set.serialize_pending().is_err());
    }
}
