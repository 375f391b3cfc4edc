//! Windows-specific process lifecycle implementation

mod windows_process_platform;

pub use windows_process_platform::{WindowsProcessLauncher, WindowsTerminationController};

/// Windows-specific platform factory
pub struct WindowsPlatformFactory;

impl WindowsPlatformFactory {
    pub fn create_launcher() -> WindowsProcessLauncher {
        WindowsProcessLauncher
    }

    pub fn create_termination_controller() -> WindowsTerminationController {
        WindowsTerminationController
    }

    pub fn platform_name() -> &'static str {
        "Windows"
    }
}
