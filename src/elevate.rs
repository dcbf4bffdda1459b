use thiserror::Error;

use windows::core::PCWSTR;
use windows::Win32::UI::Shell::ShellExecuteW;
use windows::Win32::UI::WindowsAndMessaging::{SHOW_WINDOW_CMD, SW_HIDE, SW_SHOW};

#[derive(Debug, Error)]
pub enum ElevateError {
    /// The user dismissed the UAC prompt.
    #[error("elevation cancelled by user")]
    Cancelled,
    #[error("elevation failed with code {0}")]
    Failed(isize),
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Run a program through the `runas` verb, raising a UAC prompt. Returns as
/// soon as the elevated process has been started.
pub fn shell_execute_elevated(
    path: &str,
    parameters: &str,
    show: SHOW_WINDOW_CMD,
) -> Result<(), ElevateError> {
    let verb = wide("runas");
    let path = wide(path);
    let parameters = wide(parameters);

    let instance = unsafe {
        ShellExecuteW(
            None,
            PCWSTR(verb.as_ptr()),
            PCWSTR(path.as_ptr()),
            PCWSTR(parameters.as_ptr()),
            PCWSTR::null(),
            show,
        )
    };

    // ShellExecute reports success as a value greater than 32.
    let code = instance.0 as isize;
    if code > 32 {
        return Ok(());
    }
    let last_error = unsafe { windows::Win32::Foundation::GetLastError() };
    if last_error == windows::Win32::Foundation::ERROR_CANCELLED {
        return Err(ElevateError::Cancelled);
    }
    Err(ElevateError::Failed(code))
}

/// Relaunch ourselves elevated to install the manager service.
pub fn run_elevated_manager_installer() -> Result<(), ElevateError> {
    let exe = std::env::current_exe().map_err(|_| ElevateError::Failed(0))?;
    shell_execute_elevated(&exe.to_string_lossy(), "/installmanagerservice", SW_SHOW)
}

/// Start a stopped service through an elevated `net start`.
pub fn run_elevated_service_start(service_name: &str) -> Result<(), ElevateError> {
    shell_execute_elevated(
        "cmd.exe",
        &format!("/c net start \"{service_name}\""),
        SW_HIDE,
    )
}
