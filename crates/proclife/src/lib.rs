//! Bounded-concurrency process lifecycle management.
//!
//! [`ProcessManager`] spawns and supervises external processes, capturing their
//! stdout line by line. [`PidWatcher`] observes a process by name and reacts when
//! it goes away.

mod factory;
pub mod logging;
mod manager;
mod process_table;
mod watcher;

pub use factory::PlatformFactory;
pub use manager::ProcessManager;
pub use process_table::SysinfoProcessTable;
pub use watcher::{PidWatcher, WatchCallback, WatchEvent, WatchState, WatchTarget};

// Re-export core functionality
pub use proclife_core::*;
