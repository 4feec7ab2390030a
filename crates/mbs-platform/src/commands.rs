#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Suppress the console window Windows would open for a console child.
pub trait HideWindow {
    fn hide_window(&mut self) -> &mut Self;
}

impl HideWindow for tokio::process::Command {
    #[cfg(windows)]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW)
    }

    #[cfg(not(windows))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

/// Spawn configuration for processes that must outlive the current one.
///
/// On Windows the child gets its own visible console and process group, so
/// closing the parent does not take it down. On Unix it is moved into a new
/// process group, away from the parent's job-control signals.
pub trait DetachProcess {
    fn detach(&mut self) -> &mut Self;
}

impl DetachProcess for std::process::Command {
    #[cfg(windows)]
    fn detach(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NEW_CONSOLE | CREATE_NEW_PROCESS_GROUP)
    }

    #[cfg(unix)]
    fn detach(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt as _;
        self.process_group(0)
    }

    #[cfg(not(any(windows, unix)))]
    fn detach(&mut self) -> &mut Self {
        self
    }
}
