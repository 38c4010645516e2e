// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' maps module files into memory

//! # dotswap
//!
//! Re-serialize, patch and hot-swap the .NET modules of a running process before it
//! finishes starting up.
//!
//! A host process (a game, a plugin host) loads its main module, the runtime's system
//! modules and a set of third party extensions. `dotswap` takes that inventory, collapses
//! extension modules that are really copies of something already loaded, applies
//! declarative instruction-level patches, stages every affected module as a fresh image and
//! loads the new images back into the process, main module last. Finally it replaces the
//! process's module load hook so that late load requests land on the new modules instead
//! of stale files on disk.
//!
//! ## Features
//!
//! - **Byte-exact passthrough** - Modules that were not changed are reloaded from their
//!   original bytes
//! - **Symbols that follow the code** - Sequence points are attached to instructions, so
//!   rewritten methods keep matching debug information
//! - **Free patches** - Redirect calls, cut method bodies short and rename types
//!   without writing IL by hand
//! - **Duplicate resolution** - Extension modules loaded from memory are mapped back to the
//!   files they came from, and duplicate copies are redirected
//! - **Host agnostic** - Everything the pass needs from the process goes through the traits
//!   in [`runtime`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dotswap::prelude::*;
//!
//! fn on_startup(host: &impl Host) {
//!     let mut patches = PatchRegistry::new();
//!     patches.register(FreePatch::rename_type(
//!         "RenameDriver",
//!         ModuleTarget::Any,
//!         "Game.Cameras.CameraDriver",
//!         "Game.Cameras.CameraDriver_Replaced",
//!     ));
//!
//!     let config = ReloadConfig::from_args(std::env::args());
//!     match Reloader::new(host, config, patches).run() {
//!         PassOutcome::Complete(report) => log::info!("{} modules reloaded", report.loaded.len()),
//!         PassOutcome::Failed { state, error, .. } => log::error!("{state}: {error}"),
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - Byte sources, the cursor [`Parser`] and the matching writer
//! - [`assembly`] - The CIL instruction set, decoding and encoding of instruction streams
//! - [`metadata`] - The CLI header, metadata root, heaps and table stream of a PE image
//! - [`image`] - The module image: identity, metadata tables and method bodies
//! - [`symbols`] - Portable and embedded symbol streams
//! - [`module`] - [`Module`], the mutable unit of a pass, and the [`ModuleSet`]
//! - [`patch`] - Free patch descriptors and the engine that applies them
//! - [`reload`] - The pass state machine, duplicate resolution and the installed resolver
//! - [`runtime`] - The traits a host implements
//! - [`config`] and [`diagnostics`] - Settings and logging of a pass

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

/// Commonly used types and traits.
pub mod prelude;

pub mod assembly;
pub mod config;
pub mod diagnostics;
pub mod file;
pub mod image;
pub mod metadata;
pub mod module;
pub mod patch;
pub mod reload;
pub mod runtime;
pub mod symbols;

/// The error type of every fallible operation in this crate.
///
/// # Example
///
/// ```rust,no_run
/// use dotswap::{Error, Module};
///
/// let path = std::path::Path::new("Managed/UnityEngine.dll");
/// match Module::from_path("System", "UnityEngine", path, "pdb") {
///     Ok(module) => println!("Loaded {module}"),
///     Err(Error::NotSupported) => println!("Not a module image"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {message}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// ```
pub use error::Error;

/// The result type of every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use config::ReloadConfig;
pub use file::{parser::Parser, File};
pub use module::{Module, ModuleSet};
pub use patch::{FreePatch, PatchRegistry};
pub use reload::{PassOutcome, Reloader};
