use std::path::PathBuf;

use thiserror::Error;

use crate::reload::PassState;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three groups. Structural errors come out of the image, body and symbol
/// codecs. Module errors guard the lifecycle of a [`crate::Module`] (serialize exactly once,
/// no edits afterwards). Pass errors are raised by the [`crate::reload::Reloader`] and are
/// caught once at the top of a pass, where they turn into a [`crate::reload::PassOutcome::Failed`].
///
/// Per-module degradations (missing symbols, a patch whose target does not exist in this
/// version of a module, a duplicate that could not be located) are never reported through
/// this type; they are logged and the pass continues.
///
/// # Error Categories
///
/// ## Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid image, body or symbol structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::NotSupported`] - Unsupported format or format version
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::GoblinErr`] - The PE container is damaged
///
/// ## I/O Errors
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Module Lifecycle Errors
/// - [`Error::AlreadySerialized`] - A module was serialized twice or edited after serialization
/// - [`Error::NotSerialized`] - Serialized bytes were requested before serialization
/// - [`Error::DuplicateModule`] - A name was registered twice in a [`crate::ModuleSet`]
///
/// ## Pass Errors
/// - [`Error::RedirectCycle`] - A redirect entry would make the redirect table cyclic
/// - [`Error::LoadFailed`] - The host could not load a serialized image
/// - [`Error::InvalidTransition`] - The pass state machine was driven out of order
#[derive(Error, Debug)]
pub enum Error {
    /// The data is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This format or format version is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The PE container could not be parsed.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// The module has already been serialized; it can neither be serialized again nor edited.
    #[error("Module '{0}' has already been serialized")]
    AlreadySerialized(String),

    /// Serialized bytes were requested for a module that was never serialized.
    #[error("Module '{0}' has not been serialized")]
    NotSerialized(String),

    /// A module with the same name is already part of the set.
    #[error("A module named '{0}' is already registered")]
    DuplicateModule(String),

    /// Recording this redirect would make the redirect table cyclic.
    #[error("Redirect {from:?} -> {to:?} would form a cycle")]
    RedirectCycle {
        /// The path that would be redirected
        from: PathBuf,
        /// The path it would be redirected to
        to: PathBuf,
    },

    /// The host refused to load a serialized module image.
    #[error("Failed to load module '{module}': {message}")]
    LoadFailed {
        /// Friendly name of the module that failed to load
        module: String,
        /// Host supplied failure description
        message: String,
    },

    /// The reload pass was asked to move backwards or skip a state.
    #[error("Invalid pass transition {from} -> {to}")]
    InvalidTransition {
        /// State the pass was in
        from: PassState,
        /// State that was requested
        to: PassState,
    },
}
