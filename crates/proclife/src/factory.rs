use proclife_core::{ProcessLauncher, TerminationController};
use std::sync::Arc;
use tracing::debug;

#[cfg(unix)]
use proclife_unix::UnixPlatformFactory as HostFactory;

#[cfg(windows)]
use proclife_windows::WindowsPlatformFactory as HostFactory;

#[cfg(not(any(unix, windows)))]
compile_error!("Unsupported platform: only Unix and Windows are currently supported");

/// Platform-independent factory that selects the host implementation at compile time
pub struct PlatformFactory;

impl PlatformFactory {
    pub fn create_launcher() -> Arc<dyn ProcessLauncher> {
        debug!(platform = Self::platform_name(), "Creating process launcher");
        Arc::new(HostFactory::create_launcher())
    }

    pub fn create_termination_controller() -> Arc<dyn TerminationController> {
        Arc::new(HostFactory::create_termination_controller())
    }

    pub fn platform_name() -> &'static str {
        HostFactory::platform_name()
    }
}
