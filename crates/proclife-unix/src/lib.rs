mod unix_process_platform;

pub use unix_process_platform::{UnixProcessLauncher, UnixTerminationController};

pub struct UnixPlatformFactory;

impl UnixPlatformFactory {
    pub fn create_launcher() -> UnixProcessLauncher {
        UnixProcessLauncher
    }

    pub fn create_termination_controller() -> UnixTerminationController {
        UnixTerminationController
    }

    pub fn platform_name() -> &'static str {
        "Unix"
    }
}
