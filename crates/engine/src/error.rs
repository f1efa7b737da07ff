use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read the read-only function list `{}`", path.display())]
    ReadOnlyList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("module has no entry function")]
    MissingEntry,

    #[error("entry function `{0}` has no body")]
    EntryIsDeclaration(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// An access that leaves the emulated arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{size} byte access at {addr:#x} is out of bounds")]
pub struct OutOfBounds {
    pub addr: u64,
    pub size: u64,
}
