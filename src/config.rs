//! Configuration of a reload pass.
//!
//! [`ReloadConfig::from_args`] is the only place process arguments are interpreted. It
//! understands `-verbose`, `-patchandexit` and `-dumpasms=<dir>` and ignores everything
//! else.

use std::path::PathBuf;

/// Settings for one reload pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadConfig {
    /// Forward verbose diagnostics to the log
    pub verbose: bool,

    /// Ask the host to exit after a completed pass instead of resuming startup
    pub patch_and_exit: bool,

    /// Directory that receives a copy of every modified module
    pub dump_dir: Option<PathBuf>,

    /// Prefix of every diagnostic line
    pub log_prefix: String,

    /// Extension modules whose name ends with one of these are never patched
    pub patch_exempt_suffixes: Vec<String>,

    /// Load hooks registered from these namespaces hold stale module references that are
    /// switched to reflection-only
    pub interop_hook_namespaces: Vec<String>,

    /// Extension of sidecar symbol files
    pub symbol_extension: String,

    /// Extension used for dumped module images
    pub image_extension: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            patch_and_exit: false,
            dump_dir: None,
            log_prefix: "dotswap".to_string(),
            patch_exempt_suffixes: vec!["DataAssembly".to_string()],
            interop_hook_namespaces: vec!["MonoMod.Utils".to_string()],
            symbol_extension: "pdb".to_string(),
            image_extension: "dll".to_string(),
        }
    }
}

impl ReloadConfig {
    /// Build a configuration from process arguments.
    ///
    /// Flags may be written with one or two leading dashes and are matched case
    /// insensitively. An empty `-dumpasms=` value is ignored.
    #[must_use]
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();

        for arg in args {
            let arg = arg.as_ref().trim();
            let flag = arg.trim_start_matches('-');
            if flag.len() == arg.len() {
                continue;
            }

            let (name, value) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.trim())),
                None => (flag, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "verbose" => config.verbose = true,
                "patchandexit" => config.patch_and_exit = true,
                "dumpasms" => {
                    if let Some(dir) = value.filter(|dir| !dir.is_empty()) {
                        config.dump_dir = Some(PathBuf::from(dir));
                    }
                }
                _ => {}
            }
        }

        config
    }

    /// Configuration for debugging a pass: verbose output and a dump of modified modules.
    #[must_use]
    pub fn debugging(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            verbose: true,
            dump_dir: Some(dump_dir.into()),
            ..Self::default()
        }
    }

    /// Enable or disable verbose diagnostics.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Exit after a completed pass.
    #[must_use]
    pub fn with_patch_and_exit(mut self, patch_and_exit: bool) -> Self {
        self.patch_and_exit = patch_and_exit;
        self
    }

    /// Dump modified modules into `dir`.
    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Set the prefix of diagnostic lines.
    #[must_use]
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    /// Replace the patch exempt name suffixes.
    #[must_use]
    pub fn with_patch_exempt_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patch_exempt_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the namespaces whose load hooks are neutralized.
    #[must_use]
    pub fn with_interop_hook_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interop_hook_namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if an extension module called `name` must not be patched.
    #[must_use]
    pub fn is_patch_exempt(&self, name: &str) -> bool {
        self.patch_exempt_suffixes
            .iter()
            .any(|suffix| name.ends_with(suffix.as_str()))
    }

    /// Returns true if a load hook owned by `namespace` must be neutralized.
    #[must_use]
    pub fn is_interop_namespace(&self, namespace: &str) -> bool {
        self.interop_hook_namespaces
            .iter()
            .any(|prefix| namespace.starts_with(prefix.as_str()))
    }
}
