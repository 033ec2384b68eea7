//! Error types shared by the store, the controller, and the registry.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::controller::ControllerState;
use crate::link::LinkError;

/// Errors surfaced to callers of the store and controller.
#[derive(Error, Debug)]
pub enum Error {
    /// Named program (or queue head) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Filesystem error while reading or writing a store file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Store file exists but could not be parsed
    #[error("Corrupt store file {}: {source}", path.display())]
    CorruptFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Operation not permitted in the controller's current state
    #[error("{operation} is not valid while {state}")]
    InvalidArgument {
        state: ControllerState,
        operation: &'static str,
    },

    /// Serial link failure reported to a request caller
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Bounded pool is full
    #[error("Resource exhausted: capacity of {0} reached")]
    ResourceExhausted(usize),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Controller task has stopped
    #[error("Controller offline")]
    ControllerOffline,
}

/// Convenient Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
