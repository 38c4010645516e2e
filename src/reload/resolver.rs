//! The module resolver installed at the end of a pass.

use std::{path::Path, sync::Arc};

use crate::{
    image::ModuleIdentity,
    reload::ReloadContext,
    runtime::{ModuleHandleRc, ModuleResolver},
};

/// Answers load-by-path requests with the modules loaded by the pass.
///
/// A request is first rewritten through the redirect table, then looked up in the table
/// of loaded modules by source location. If neither answers, the identity of the requested
/// file is read and a loaded module with the same simple name is returned; the main
/// module's name always resolves to the new main module. Anything else falls through to
/// the process's normal loading.
#[derive(Debug, Clone)]
pub struct RedirectingResolver {
    context: Arc<ReloadContext>,
    main_name: String,
}

impl RedirectingResolver {
    /// Create a resolver over `context`.
    #[must_use]
    pub fn new(context: Arc<ReloadContext>, main_name: impl Into<String>) -> Self {
        RedirectingResolver {
            context,
            main_name: main_name.into(),
        }
    }
}

impl ModuleResolver for RedirectingResolver {
    fn resolve(&self, path: &Path) -> Option<ModuleHandleRc> {
        let target = self.context.redirects.resolve(path);
        if target != path {
            log::debug!("Redirecting load of {} to {}", path.display(), target.display());
        }

        if let Some(loaded) = self.context.loaded_at(&target) {
            return Some(loaded);
        }

        let identity = match ModuleIdentity::read_from_file(&target) {
            Ok(identity) => identity,
            Err(e) => {
                log::debug!("Not resolving {}: {}", target.display(), e);
                return None;
            }
        };

        if identity.name == self.main_name {
            return self.context.main();
        }
        self.context.loaded_named(&identity.name)
    }
}
