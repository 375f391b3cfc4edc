//! Proclife Core - Platform-independent process lifecycle abstractions
//!
//! This crate provides the record and registry types, the output collector, the
//! seam traits implemented by the platform crates, configuration and error types.

mod capture;
mod config;
mod error;
mod process;
mod registry;

pub use capture::*;
pub use config::*;
pub use error::*;
pub use process::*;
pub use registry::*;
