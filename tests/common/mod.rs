//! Shared fixtures for the integration tests: a scripted host process and small module
//! images built through the public image API.

#![allow(dead_code)]

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use dotswap::{
    assembly::{opcodes, Instruction, Operand},
    image::{
        Image, MemberRef, MethodAttributes, MethodBody, MethodDef, ModuleIdentity, Token,
        TypeAttributes, TypeDef, TypeRef,
    },
    runtime::{
        Extension, Host, ImageLoader, LoadHook, LoadHooks, ModuleHandle, ModuleHandleRc,
        ModuleInventory, ModuleResolver, SystemModule,
    },
};

/// A live module in the scripted process.
#[derive(Debug)]
pub struct LiveModule {
    name: String,
    full_name: String,
    location: Option<PathBuf>,
    raw: Option<Vec<u8>>,
    reflection_only: AtomicBool,
    toggles: AtomicUsize,
}

impl LiveModule {
    fn new(name: &str, location: Option<PathBuf>, raw: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(LiveModule {
            name: name.to_string(),
            full_name: ModuleIdentity::new(name).display_name(),
            location,
            raw,
            reflection_only: AtomicBool::new(false),
            toggles: AtomicUsize::new(0),
        })
    }

    pub fn from_memory(name: &str, raw: Vec<u8>) -> Arc<Self> {
        Self::new(name, None, Some(raw))
    }

    pub fn from_file(name: &str, path: &Path) -> Arc<Self> {
        Self::new(name, Some(path.to_path_buf()), std::fs::read(path).ok())
    }

    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }
}

impl ModuleHandle for LiveModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn raw_image(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    fn set_reflection_only(&self, reflection_only: bool) {
        self.toggles.fetch_add(1, Ordering::SeqCst);
        self.reflection_only.store(reflection_only, Ordering::SeqCst);
    }

    fn is_reflection_only(&self) -> bool {
        self.reflection_only.load(Ordering::SeqCst)
    }
}

/// An image handed to [`ImageLoader::load`].
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub name: String,
    pub image: Vec<u8>,
    pub symbols: Option<Vec<u8>>,
}

/// A scripted host process.
pub struct ScriptedHost {
    main: Arc<LiveModule>,
    system: Vec<SystemModule>,
    extensions: Vec<Extension>,
    others: Vec<ModuleHandleRc>,
    hooks: Mutex<Vec<LoadHook>>,
    resolver: Mutex<Option<Arc<dyn ModuleResolver>>>,
    loaded: Mutex<Vec<LoadedImage>>,
    rejected: HashSet<String>,
    exit: AtomicBool,
}

impl ScriptedHost {
    pub fn new(main: Arc<LiveModule>) -> Self {
        ScriptedHost {
            main,
            system: Vec::new(),
            extensions: Vec::new(),
            others: Vec::new(),
            hooks: Mutex::new(Vec::new()),
            resolver: Mutex::new(None),
            loaded: Mutex::new(Vec::new()),
            rejected: HashSet::new(),
            exit: AtomicBool::new(false),
        }
    }

    pub fn main(&self) -> Arc<LiveModule> {
        self.main.clone()
    }

    pub fn system(mut self, friendly_name: &str, path: &Path) -> Self {
        self.system.push(SystemModule {
            friendly_name: friendly_name.to_string(),
            path: path.to_path_buf(),
        });
        self
    }

    pub fn extension(
        mut self,
        name: &str,
        files: Vec<PathBuf>,
        loaded: Vec<Arc<LiveModule>>,
    ) -> Self {
        let loaded = loaded
            .into_iter()
            .map(|module| module as ModuleHandleRc)
            .collect();
        self.extensions.push(Extension::new(name, files, loaded));
        self
    }

    /// A module loaded by something other than an extension.
    pub fn other(mut self, module: Arc<LiveModule>) -> Self {
        self.others.push(module);
        self
    }

    pub fn hook(self, owner_namespace: &str, captured: Vec<Arc<LiveModule>>) -> Self {
        self.hooks.lock().unwrap().push(LoadHook {
            owner_namespace: owner_namespace.to_string(),
            captured: captured.into_iter().map(|m| m as ModuleHandleRc).collect(),
        });
        self
    }

    pub fn reject(mut self, name: &str) -> Self {
        self.rejected.insert(name.to_string());
        self
    }

    pub fn loaded(&self) -> Vec<LoadedImage> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded().into_iter().map(|image| image.name).collect()
    }

    pub fn loaded_image(&self, name: &str) -> Option<LoadedImage> {
        self.loaded().into_iter().find(|image| image.name == name)
    }

    pub fn resolver(&self) -> Option<Arc<dyn ModuleResolver>> {
        self.resolver.lock().unwrap().clone()
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

impl ModuleInventory for ScriptedHost {
    fn main_module(&self) -> ModuleHandleRc {
        self.main.clone()
    }

    fn system_modules(&self) -> Vec<SystemModule> {
        self.system.clone()
    }

    fn extensions(&self) -> Vec<Extension> {
        self.extensions.clone()
    }

    fn live_modules(&self) -> Vec<ModuleHandleRc> {
        let mut live: Vec<ModuleHandleRc> = vec![self.main.clone()];
        for extension in &self.extensions {
            live.extend(extension.loaded.iter().cloned());
        }
        live.extend(self.others.iter().cloned());
        live
    }
}

impl ImageLoader for ScriptedHost {
    fn load(&self, image: &[u8], symbols: Option<&[u8]>) -> Result<ModuleHandleRc, String> {
        let identity = ModuleIdentity::read_from_bytes(image).map_err(|e| e.to_string())?;
        if self.rejected.contains(&identity.name) {
            return Err(format!("{} could not be loaded", identity.name));
        }

        self.loaded.lock().unwrap().push(LoadedImage {
            name: identity.name.clone(),
            image: image.to_vec(),
            symbols: symbols.map(<[u8]>::to_vec),
        });
        Ok(LiveModule::from_memory(&identity.name, image.to_vec()))
    }
}

impl LoadHooks for ScriptedHost {
    fn registered(&self) -> Vec<LoadHook> {
        self.hooks.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.hooks.lock().unwrap().clear();
    }

    fn install(&self, resolver: Arc<dyn ModuleResolver>) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }
}

impl Host for ScriptedHost {
    fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }
}

/// An image named `name` that references each of `references`.
pub fn module_image(name: &str, references: &[&str]) -> Image {
    let mut image = Image::new(ModuleIdentity::new(name), mvid(name));
    for reference in references {
        image.assembly_refs.push(ModuleIdentity::new(*reference));
    }
    image
}

/// An image named `name` whose `Entry::Start` calls `Factory::Create` of `main`.
pub fn caller_image(name: &str, main: &str) -> Image {
    let mut image = module_image(name, &[main]);
    image.type_refs.push(TypeRef {
        scope: Token::from_parts(Token::ASSEMBLY_REF, 1),
        namespace: main.to_string(),
        name: "Factory".to_string(),
    });
    image.member_refs.push(MemberRef {
        parent: Token::from_parts(Token::TYPE_REF, 1),
        name: "Create".to_string(),
        signature: vec![0x00, 0x00, 0x01],
    });
    image.type_defs.push(TypeDef {
        flags: TypeAttributes::PUBLIC,
        namespace: name.to_string(),
        name: "Entry".to_string(),
        enclosing: None,
        method_count: 1,
    });
    image.methods.push(MethodDef {
        flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
        name: "Start".to_string(),
        signature: vec![0x00, 0x00, 0x01],
        body: Some(MethodBody::new(vec![
            Instruction::new(opcodes::NOP, Operand::None),
            Instruction::new(
                opcodes::CALL,
                Operand::Token(Token::from_parts(Token::MEMBER_REF, 1)),
            ),
            Instruction::ret(),
        ])),
    });
    image
}

pub fn bytes(image: &Image) -> Vec<u8> {
    image.to_bytes().unwrap().bytes
}

/// Write `image` as `<dir>/<file>` and return the path.
pub fn write_module(dir: &Path, file: &str, image: &Image) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, bytes(image)).unwrap();
    path
}

fn mvid(name: &str) -> uguid::Guid {
    let mut bytes = [0u8; 16];
    for (slot, byte) in bytes.iter_mut().zip(name.bytes().cycle()) {
        *slot = byte;
    }
    uguid::Guid::from_bytes(bytes)
}
