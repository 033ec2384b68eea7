//! Program store and serial connection controller for addressable LED
//! hardware.
//!
//! The [`store::ProgramStore`] holds named lighting programs. The
//! [`controller::Controller`] owns the single device session and streams
//! a program's frames over a [`link::SerialLink`] under a bounded
//! acknowledgment window.

pub mod authoring;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod link;
pub mod program;
pub mod registry;
pub mod store;
pub mod tracing;

pub use error::{Error, Result};
