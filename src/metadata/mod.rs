//! ECMA-335 metadata structures: the CLI header, the metadata root, its heaps and the table
//! stream.
//!
//! These are the raw building blocks that [`crate::image`] reads a module image from and
//! writes it back to. Rows are kept as plain column values here; turning them into types,
//! methods and references is the job of the image layer.
//!
//! # Key Components
//!
//! - [`cor20header::Cor20Header`] - The CLI header found through the PE data directory
//! - [`root::Root`] - The `BSJB` metadata root and its stream directory
//! - [`streams`] - `#Strings`, `#Blob`, `#GUID` and `#US` readers plus append-only builders
//! - [`tables::TablesStream`] - The `#~` table stream with raw rows for every table

pub mod cor20header;
pub mod root;
pub mod streams;
pub mod tables;
