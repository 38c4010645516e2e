//! Loadable, mutable modules and the set they are collected in.
//!
//! A [`Module`] wraps one parsed [`Image`] together with everything the reload pass needs
//! to put it back into the process: the raw bytes it was read from (so untouched modules
//! can be handed back byte for byte), its debug symbols, the live handle it came from, and
//! the flags that decide whether patches may touch it and whether it has to be reloaded.
//!
//! # Lifecycle
//!
//! 1. Created from a path or a live handle; symbols are loaded on a best-effort basis.
//! 2. Edited through [`Module::image_mut`], each accepted edit reported with
//!    [`Module::mark_modified`].
//! 3. Serialized exactly once with [`Module::serialize`]. After that the module is frozen:
//!    further edits and a second serialization fail with [`Error::AlreadySerialized`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotswap::Module;
//! use std::path::Path;
//!
//! let mut module = Module::from_path("System", "Lib", Path::new("Managed/Lib.dll"), "pdb")?;
//! let serialized = module.serialize()?;
//! println!("{} bytes, symbols: {}", serialized.image.len(), serialized.symbols.is_some());
//! # Ok::<(), dotswap::Error>(())
//! ```

mod set;

pub use set::ModuleSet;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    image::Image,
    runtime::ModuleHandleRc,
    symbols::{self, PortableSymbols, SymbolFormat},
    Error, Result,
};

/// Where the symbols of a module were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    /// A sidecar file next to the module binary
    Sidecar,
    /// A compressed stream embedded into the image
    Embedded,
}

/// Outcome of loading the symbols of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStatus {
    /// Symbols were parsed and attached to the instructions
    Loaded(SymbolSource),
    /// The module has neither sidecar nor embedded symbols
    Missing,
    /// The symbols are in a format that cannot be written back (legacy native)
    Unsupported,
    /// The symbols could not be parsed or do not match the image
    Invalid(String),
}

/// Bytes produced by [`Module::serialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedModule {
    /// The module image
    pub image: Vec<u8>,
    /// A portable symbol stream matching `image`
    pub symbols: Option<Vec<u8>>,
    /// False when `image` are the original bytes, handed back unchanged
    pub reencoded: bool,
}

#[derive(Debug, Clone)]
struct ModuleSymbols {
    // Documents and entry point of the loaded symbols, without methods
    source: PortableSymbols,
    // Original sidecar stream, valid together with the original image bytes
    sidecar: Option<Vec<u8>>,
}

/// One module taking part in a reload pass.
pub struct Module {
    owner: String,
    friendly_name: String,
    source_location: Option<PathBuf>,
    handle: Option<ModuleHandleRc>,
    image: Image,
    raw: Option<Vec<u8>>,
    symbols: Option<ModuleSymbols>,
    symbol_status: SymbolStatus,
    /// Free patches may rewrite this module
    pub allow_patches: bool,
    /// Custom attributes must be reconciled against the main module
    pub process_attributes: bool,
    modified: bool,
    needs_reload: bool,
    serialized: Option<SerializedModule>,
}

impl Module {
    /// Read a module from a file, with symbols from the sidecar
    /// `<path>.<symbol_extension>` or embedded into the image.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the image cannot be parsed. Symbol
    /// problems never fail construction; see [`Module::symbol_status`].
    pub fn from_path(
        owner: impl Into<String>,
        friendly_name: impl Into<String>,
        path: &Path,
        symbol_extension: &str,
    ) -> Result<Module> {
        let data = std::fs::read(path)?;
        let sidecar = read_sidecar(path, symbol_extension);

        let mut module = Module::from_bytes(owner, friendly_name, data, sidecar)?;
        module.source_location = Some(path.to_path_buf());
        Ok(module)
    }

    /// Create a module from a live handle.
    ///
    /// Handles with a location are parsed from that file, so sidecar symbols can be picked
    /// up; the raw image held by the runtime is still preferred for passthrough. Handles
    /// without a location are parsed from the raw image and can only carry embedded
    /// symbols.
    ///
    /// # Errors
    /// Returns an error if the handle has neither a location nor a raw image, or the image
    /// cannot be read or parsed.
    pub fn from_handle(
        owner: impl Into<String>,
        friendly_name: impl Into<String>,
        handle: ModuleHandleRc,
        symbol_extension: &str,
    ) -> Result<Module> {
        let raw = handle.raw_image().map(<[u8]>::to_vec);

        let mut module = match handle.location() {
            Some(location) => {
                let data = std::fs::read(location)?;
                let sidecar = read_sidecar(location, symbol_extension);
                let mut module = Module::from_bytes(owner, friendly_name, data, sidecar)?;
                if raw.is_some() {
                    module.raw = raw;
                }
                module
            }
            None => {
                let Some(raw) = raw else {
                    return Err(malformed_error!(
                        "Module '{}' has neither a location nor a raw image",
                        handle.name()
                    ));
                };
                Module::from_bytes(owner, friendly_name, raw, None)?
            }
        };

        module.source_location = handle.location().map(Path::to_path_buf);
        module.handle = Some(handle);
        Ok(module)
    }

    /// Create a module from an in-memory image and an optional sidecar symbol stream.
    ///
    /// # Errors
    /// Returns an error if `data` is empty or cannot be parsed.
    pub fn from_bytes(
        owner: impl Into<String>,
        friendly_name: impl Into<String>,
        data: Vec<u8>,
        sidecar: Option<Vec<u8>>,
    ) -> Result<Module> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let mut image = Image::parse(&data)?;
        let (symbols, symbol_status) = load_symbols(&mut image, sidecar);

        Ok(Module {
            owner: owner.into(),
            friendly_name: friendly_name.into(),
            source_location: None,
            handle: None,
            image,
            raw: Some(data),
            symbols,
            symbol_status,
            allow_patches: true,
            process_attributes: false,
            modified: false,
            needs_reload: false,
            serialized: None,
        })
    }

    /// Logical name of the module, the simple name of its identity.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.image.identity.name
    }

    /// Name of the owner (`System`, the application, or an extension).
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Name used in diagnostics.
    #[must_use]
    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Path the module content originally came from.
    #[must_use]
    pub fn source_location(&self) -> Option<&Path> {
        self.source_location.as_deref()
    }

    /// Override the source location, e.g. with a path found by duplicate resolution.
    pub fn set_source_location(&mut self, location: Option<PathBuf>) {
        self.source_location = location;
    }

    /// The live handle this module was created from.
    #[must_use]
    pub fn handle(&self) -> Option<&ModuleHandleRc> {
        self.handle.as_ref()
    }

    /// Read access to the image.
    #[must_use]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Write access to the image.
    ///
    /// # Errors
    /// Returns [`Error::AlreadySerialized`] once the module has been serialized.
    pub fn image_mut(&mut self) -> Result<&mut Image> {
        if self.serialized.is_some() {
            return Err(Error::AlreadySerialized(self.friendly_name.clone()));
        }
        Ok(&mut self.image)
    }

    /// Record that the image was changed structurally.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Returns true once any rewrite changed the image.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Force the module to be reloaded even if it was not modified.
    pub fn set_needs_reload(&mut self) {
        self.needs_reload = true;
    }

    /// Returns true if the module has to be serialized and loaded again.
    #[must_use]
    pub fn needs_reload(&self) -> bool {
        self.needs_reload || self.modified
    }

    /// Returns true if symbols were loaded and will be written back.
    #[must_use]
    pub fn symbols_available(&self) -> bool {
        self.symbols.is_some()
    }

    /// How loading the symbols went.
    #[must_use]
    pub fn symbol_status(&self) -> &SymbolStatus {
        &self.symbol_status
    }

    /// Serialize the module.
    ///
    /// Unmodified modules with raw bytes return those bytes unchanged, together with the
    /// original sidecar symbols if any. Modified modules are re-encoded; if symbols are
    /// available a matching symbol stream is produced alongside. Re-encoded images never
    /// carry embedded symbols, the stream is always returned separately.
    ///
    /// # Errors
    /// Returns [`Error::AlreadySerialized`] on a second call, and an encoding error if the
    /// image or the symbols cannot be written.
    pub fn serialize(&mut self) -> Result<&SerializedModule> {
        if self.serialized.is_some() {
            return Err(Error::AlreadySerialized(self.friendly_name.clone()));
        }

        let serialized = match self.raw.take() {
            Some(raw) if !self.modified => {
                log::debug!("Module not modified, passing through: {}", self.friendly_name);
                SerializedModule {
                    image: raw,
                    symbols: self.symbols.as_mut().and_then(|s| s.sidecar.take()),
                    reencoded: false,
                }
            }
            _ => self.encode()?,
        };

        Ok(self.serialized.insert(serialized))
    }

    /// The result of [`Module::serialize`].
    ///
    /// # Errors
    /// Returns [`Error::NotSerialized`] if the module has not been serialized yet.
    pub fn serialized(&self) -> Result<&SerializedModule> {
        self.serialized
            .as_ref()
            .ok_or_else(|| Error::NotSerialized(self.friendly_name.clone()))
    }

    /// Switch the live module this one was created from to reflection-only.
    ///
    /// Returns the handle that was switched, `None` for modules without a handle.
    pub fn set_source_reflection_only(&self) -> Option<ModuleHandleRc> {
        let handle = self.handle.as_ref()?;
        log::debug!("Setting reflection-only: {}", self.friendly_name);
        handle.set_reflection_only(true);
        Some(handle.clone())
    }

    fn encode(&mut self) -> Result<SerializedModule> {
        log::debug!("Serializing: {}", self.friendly_name);

        // Points travel with the instructions; a stale embedded stream would not match
        self.image.embedded_symbols = None;
        let written = self.image.to_bytes()?;

        let symbols = match &self.symbols {
            Some(loaded) => {
                let portable = symbols::extract(&self.image, &written.layouts, &loaded.source)?;
                Some(portable.to_bytes()?)
            }
            None => None,
        };

        Ok(SerializedModule {
            image: written.bytes,
            symbols,
            reencoded: true,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friendly_name)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("owner", &self.owner)
            .field("friendly_name", &self.friendly_name)
            .field("source_location", &self.source_location)
            .field("allow_patches", &self.allow_patches)
            .field("process_attributes", &self.process_attributes)
            .field("modified", &self.modified)
            .field("needs_reload", &self.needs_reload())
            .field("symbol_status", &self.symbol_status)
            .finish_non_exhaustive()
    }
}

fn read_sidecar(path: &Path, symbol_extension: &str) -> Option<Vec<u8>> {
    let sidecar = path.with_extension(symbol_extension);
    if !sidecar.is_file() {
        return None;
    }

    match std::fs::read(&sidecar) {
        Ok(data) => Some(data),
        Err(e) => {
            log::debug!("Failed to read symbols {}: {}", sidecar.display(), e);
            None
        }
    }
}

fn load_symbols(
    image: &mut Image,
    sidecar: Option<Vec<u8>>,
) -> (Option<ModuleSymbols>, SymbolStatus) {
    let (data, source) = match (sidecar, &image.embedded_symbols) {
        (Some(data), _) => (data, SymbolSource::Sidecar),
        (None, Some(embedded)) => (embedded.clone(), SymbolSource::Embedded),
        (None, None) => return (None, SymbolStatus::Missing),
    };

    if SymbolFormat::detect(&data) == SymbolFormat::Native {
        return (None, SymbolStatus::Unsupported);
    }

    let portable = match symbols::read_symbols(&data) {
        Ok(portable) => portable,
        Err(Error::NotSupported) => return (None, SymbolStatus::Unsupported),
        Err(e) => return (None, SymbolStatus::Invalid(e.to_string())),
    };

    // Attaching is all or nothing, a failure leaves the image as parsed
    if let Err(e) = symbols::attach(image, &portable) {
        return (None, SymbolStatus::Invalid(e.to_string()));
    }

    let sidecar = match source {
        SymbolSource::Sidecar => Some(data),
        SymbolSource::Embedded => None,
    };

    (
        Some(ModuleSymbols {
            source: PortableSymbols {
                methods: Vec::new(),
                ..portable
            },
            sidecar,
        }),
        SymbolStatus::Loaded(source),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        assembly::{opcodes, Instruction, Operand},
        image::Token,
        runtime::ModuleHandle,
        symbols::{compress, Document, MethodSymbols, SequencePoint, NATIVE_SIGNATURE},
        test::{ImageBuilder, MockModule},
    };

    fn image() -> Image {
        ImageBuilder::new("Lib")
            .type_def("Lib", "Helper")
            .method(
                "Foo",
                vec![
                    Instruction::new(opcodes::NOP, Operand::None),
                    Instruction::ret(),
                ],
            )
            .build()
    }

    fn portable(image: &Image) -> PortableSymbols {
        let mut symbols = PortableSymbols::new(image.pdb_id(), vec![Document::new("Helper.cs")]);
        symbols.type_system_rows = image.table_rows();
        symbols.methods = vec![MethodSymbols::new(
            Token::new(0x0600_0001),
            vec![
                (0, SequencePoint::new(0, 4, 9, 4, 15)),
                (1, SequencePoint::new(0, 5, 5, 5, 6)),
            ],
        )];
        symbols
    }

    fn bytes(image: &Image) -> Vec<u8> {
        image.to_bytes().unwrap().bytes
    }

    #[test]
    fn unmodified_passthrough() {
        let image = image();
        let sidecar = portable(&image).to_bytes().unwrap();
        let original = bytes(&image);

        let mut module =
            Module::from_bytes("System", "Lib", original.clone(), Some(sidecar.clone())).unwrap();
        assert_eq!(module.symbol_status(), &SymbolStatus::Loaded(SymbolSource::Sidecar));
        assert!(!module.needs_reload());

        let serialized = module.serialize().unwrap();
        assert!(!serialized.reencoded);
        assert_eq!(serialized.image, original);
        assert_eq!(serialized.symbols.as_deref(), Some(sidecar.as_slice()));
    }

    #[test]
    fn serialize_exactly_once() {
        let mut module = Module::from_bytes("System", "Lib", bytes(&image()), None).unwrap();
        module.serialize().unwrap();

        assert!(matches!(module.serialize(), Err(Error::AlreadySerialized(_))));
        assert!(matches!(module.image_mut(), Err(Error::AlreadySerialized(_))));
        assert!(module.serialized().is_ok());

        let fresh = Module::from_bytes("System", "Lib", bytes(&image()), None).unwrap();
        assert!(matches!(fresh.serialized(), Err(Error::NotSerialized(_))));
    }

    #[test]
    fn modified_reencodes_with_symbols() {
        let image = image();
        let sidecar = portable(&image).to_bytes().unwrap();
        let mut module = Module::from_bytes("Mod", "Lib", bytes(&image), Some(sidecar)).unwrap();

        let body = module.image_mut().unwrap().methods[0].body.as_mut().unwrap();
        body.instructions.remove(0);
        module.mark_modified();
        assert!(module.needs_reload());

        let serialized = module.serialize().unwrap().clone();
        assert!(serialized.reencoded);

        let reparsed = Image::parse(&serialized.image).unwrap();
        assert_eq!(reparsed.methods[0].body.as_ref().unwrap().instructions.len(), 1);

        let symbols = PortableSymbols::parse(&serialized.symbols.unwrap()).unwrap();
        assert_eq!(symbols.pdb_id, reparsed.pdb_id());
        assert_eq!(symbols.type_system_rows, reparsed.table_rows());
        assert_eq!(symbols.methods[0].points.len(), 1);
        assert_eq!(symbols.methods[0].points[0].0, 0);
        assert_eq!(symbols.methods[0].points[0].1.start_line, 5);
    }

    #[test]
    fn embedded_symbols_are_written_as_sidecar() {
        let mut image = image();
        image.embedded_symbols = Some(compress(&portable(&image).to_bytes().unwrap()).unwrap());

        let mut module = Module::from_bytes("Mod", "Lib", bytes(&image), None).unwrap();
        assert_eq!(module.symbol_status(), &SymbolStatus::Loaded(SymbolSource::Embedded));

        module.set_needs_reload();
        module.mark_modified();
        let serialized = module.serialize().unwrap();

        let reparsed = Image::parse(&serialized.image).unwrap();
        assert!(reparsed.embedded_symbols.is_none());
        assert!(serialized.symbols.is_some());
    }

    #[test]
    fn native_symbols_are_unavailable() {
        let mut native = NATIVE_SIGNATURE.to_vec();
        native.extend_from_slice(&[0u8; 64]);

        let mut module = Module::from_bytes("Mod", "Lib", bytes(&image()), Some(native)).unwrap();
        assert_eq!(module.symbol_status(), &SymbolStatus::Unsupported);
        assert!(!module.symbols_available());

        module.mark_modified();
        assert!(module.serialize().unwrap().symbols.is_none());
    }

    #[test]
    fn mismatched_symbols_are_invalid() {
        let image = image();
        let mut symbols = portable(&image);
        symbols.pdb_id.guid = uguid::guid!("11111111-2222-3333-4444-555555555555");

        let module = Module::from_bytes(
            "Mod",
            "Lib",
            bytes(&image),
            Some(symbols.to_bytes().unwrap()),
        )
        .unwrap();
        assert!(matches!(module.symbol_status(), SymbolStatus::Invalid(_)));
        assert!(module.image().methods[0].body.as_ref().unwrap().instructions[0]
            .sequence_point
            .is_none());
    }

    #[test]
    fn from_path_reads_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let image = image();
        let path = dir.path().join("Lib.dll");
        std::fs::write(&path, bytes(&image)).unwrap();
        std::fs::write(dir.path().join("Lib.pdb"), portable(&image).to_bytes().unwrap()).unwrap();

        let module = Module::from_path("System", "Lib", &path, "pdb").unwrap();
        assert_eq!(module.name(), "Lib");
        assert_eq!(module.source_location(), Some(path.as_path()));
        assert!(module.symbols_available());

        let missing = Module::from_path("System", "Lib", &path, "mdb").unwrap();
        assert_eq!(missing.symbol_status(), &SymbolStatus::Missing);

        assert!(Module::from_path("System", "Lib", &dir.path().join("Nope.dll"), "pdb").is_err());
    }

    #[test]
    fn from_handle() {
        let raw = bytes(&image());
        let handle = Arc::new(MockModule::in_memory("Lib", raw.clone()));

        let mut module = Module::from_handle("Mod", "Lib", handle.clone(), "pdb").unwrap();
        assert!(module.source_location().is_none());
        assert!(module.handle().is_some());

        assert!(module.set_source_reflection_only().is_some());
        assert!(handle.is_reflection_only());
        assert_eq!(module.serialize().unwrap().image, raw);

        let empty = Arc::new(MockModule::detached("Ghost"));
        assert!(Module::from_handle("Mod", "Ghost", empty, "pdb").is_err());
    }

    #[test]
    fn from_handle_with_location() {
        let dir = tempfile::tempdir().unwrap();
        let image = image();
        let path = dir.path().join("Lib.dll");
        std::fs::write(&path, bytes(&image)).unwrap();
        std::fs::write(dir.path().join("Lib.pdb"), portable(&image).to_bytes().unwrap()).unwrap();

        let handle = Arc::new(MockModule::on_disk("Lib", &path));
        let module = Module::from_handle("Mod", "Lib", handle, "pdb").unwrap();
        assert_eq!(module.source_location(), Some(path.as_path()));
        assert_eq!(module.symbol_status(), &SymbolStatus::Loaded(SymbolSource::Sidecar));
    }
}
