//! Shared helpers for unit tests: image factories and an in-memory host.


pub use builders::*;
pub use mocks::*;

use crate::{image::Image, module::Module};

// Helper function to create a module with an empty image named `name`
pub fn module(owner: &str, name: &str) -> Module {
    module_from_image(owner, ImageBuilder::new(name).build())
}

// Helper function to create a module from a built image
pub fn module_from_image(owner: &str, image: Image) -> Module {
    let name = image.identity.name.clone();
    let bytes = image.to_bytes().unwrap().bytes;
    Module::from_bytes(owner, name, bytes, None).unwrap()
}
