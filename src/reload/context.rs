//! Tables shared between the pass and the installed module resolver.
//!
//! Both tables are filled while the pass runs and read by the resolver afterwards, possibly
//! from several threads at once. They are [`DashMap`]s so an insert made while loading
//! images is visible to concurrent readers without further locking.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use dashmap::DashMap;

use crate::{runtime::ModuleHandleRc, Error, Result};

/// Maps a requested module path to the path that backs the loaded content.
///
/// The table never contains a cycle: an entry that would lead back to its own source is
/// rejected on insert, so following redirects from any path ends after at most
/// [`RedirectTable::len`] steps.
#[derive(Debug, Default)]
pub struct RedirectTable {
    entries: DashMap<PathBuf, PathBuf>,
}

impl RedirectTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect requests for `from` to `to`, replacing an earlier entry for `from`.
    ///
    /// # Errors
    /// Returns [`Error::RedirectCycle`] if `from` equals `to` or if following redirects from
    /// `to` reaches `from`.
    pub fn insert(&self, from: PathBuf, to: PathBuf) -> Result<()> {
        if from == to || self.chain(&to).iter().any(|step| *step == from) {
            return Err(Error::RedirectCycle { from, to });
        }

        self.entries.insert(from, to);
        Ok(())
    }

    /// The direct target of `from`.
    #[must_use]
    pub fn get(&self, from: &Path) -> Option<PathBuf> {
        self.entries.get(from).map(|entry| entry.value().clone())
    }

    /// Follow redirects from `path` to the end of the chain; `path` itself if there is no
    /// entry.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.chain(path)
            .pop()
            .unwrap_or_else(|| path.to_path_buf())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, sorted by source path.
    #[must_use]
    pub fn entries(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort();
        entries
    }

    /// The paths visited when following redirects from `start`, `start` included.
    fn chain(&self, start: &Path) -> Vec<PathBuf> {
        let mut chain = vec![start.to_path_buf()];

        // Bounded, so a table corrupted by concurrent replacement still terminates
        for _ in 0..self.entries.len() {
            let Some(next) = chain.last().and_then(|last| self.get(last)) else {
                break;
            };
            if chain.contains(&next) {
                break;
            }
            chain.push(next);
        }

        chain
    }
}

/// State handed from the pass to the module resolver it installs.
#[derive(Debug, Default)]
pub struct ReloadContext {
    /// The duplicate redirect table
    pub redirects: RedirectTable,
    loaded: DashMap<PathBuf, ModuleHandleRc>,
    by_name: DashMap<String, ModuleHandleRc>,
    main: OnceLock<ModuleHandleRc>,
}

impl ReloadContext {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly loaded module under its logical name and, if it was read from disk,
    /// under its original source location.
    pub fn record_loaded(&self, name: &str, location: Option<&Path>, handle: ModuleHandleRc) {
        if let Some(location) = location {
            self.loaded.insert(location.to_path_buf(), handle.clone());
        }
        self.by_name.insert(name.to_string(), handle);
    }

    /// The new module loaded in place of the file at `location`.
    #[must_use]
    pub fn loaded_at(&self, location: &Path) -> Option<ModuleHandleRc> {
        self.loaded.get(location).map(|entry| entry.value().clone())
    }

    /// The new module loaded under the logical name `name`.
    #[must_use]
    pub fn loaded_named(&self, name: &str) -> Option<ModuleHandleRc> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Number of entries in the location table.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Record the new main module. Only the first call has an effect.
    pub fn set_main(&self, handle: ModuleHandleRc) {
        let _ = self.main.set(handle);
    }

    /// The new main module, once it has been loaded.
    #[must_use]
    pub fn main(&self) -> Option<ModuleHandleRc> {
        self.main.get().cloned()
    }
}
