use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use windows::core::{Error as WinError, PCWSTR};
use windows::Win32::Foundation::{
    ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_MARKED_FOR_DELETE, WIN32_ERROR,
};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows::Win32::System::Services::{
    ChangeServiceConfig2W, CloseServiceHandle, ControlService, CreateServiceW, DeleteService,
    OpenSCManagerW, OpenServiceW, QueryServiceStatus, StartServiceW, SC_HANDLE,
    SC_MANAGER_ALL_ACCESS, SERVICE_ALL_ACCESS, SERVICE_CONFIG_SERVICE_SID_INFO,
    SERVICE_CONTROL_STOP, SERVICE_DEMAND_START, SERVICE_ERROR_NORMAL, SERVICE_RUNNING,
    SERVICE_SID_INFO, SERVICE_SID_TYPE_UNRESTRICTED, SERVICE_START_PENDING, SERVICE_STATUS,
    SERVICE_STOPPED, SERVICE_WIN32_OWN_PROCESS,
};

use crate::config;

const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(333);
const DEFAULT_TUNNEL_NAME: &str = "pangolin-tunnel";
const SERVICE_NAME_LIMIT: usize = 80;

/// Tunnel config files are readable by SYSTEM and Administrators only; they
/// carry the session token and device secret.
const TUNNEL_CONFIG_SDDL: &str = "D:PAI(A;;FA;;;SY)(A;;FA;;;BA)";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Manager already installed and running")]
    ManagerAlreadyRunning,
    #[error("Tunnel already installed and running")]
    TunnelAlreadyRunning,
    #[error("{0}")]
    Other(String),
}

impl From<WinError> for InstallError {
    fn from(err: WinError) -> Self {
        InstallError::Other(err.message().to_string())
    }
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

fn is_win32(err: &WinError, code: WIN32_ERROR) -> bool {
    err.code() == code.to_hresult()
}

struct ScHandle(SC_HANDLE);

impl Drop for ScHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

fn service_manager() -> Result<ScHandle, InstallError> {
    let handle = unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_ALL_ACCESS) }?;
    Ok(ScHandle(handle))
}

pub fn manager_service_name() -> String {
    format!("{}Manager", config::APP_NAME)
}

pub fn tunnel_service_name(name: &str) -> String {
    let mut service_name = format!("{}Tunnel${}", config::APP_NAME, sanitize_service_name(name));
    service_name.truncate(SERVICE_NAME_LIMIT);
    service_name
}

/// Windows service names allow letters, digits, and `-_()[]{}`.
pub fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '(' | ')' | '[' | ']' | '{' | '}')
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn tunnel_config_path(name: &str) -> PathBuf {
    config::tunnels_dir().join(format!("{}.json", sanitize_service_name(name)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerServiceStatus {
    NotInstalled,
    Stopped,
    Running,
    Transitioning,
}

/// For the bootstrap entry point: can we see the manager service, and is it
/// running?
pub fn query_manager_status() -> Result<ManagerServiceStatus, InstallError> {
    let scm = service_manager()?;
    let name = wide(&manager_service_name());
    let service = match unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) } {
        Ok(handle) => ScHandle(handle),
        Err(err) if is_win32(&err, ERROR_SERVICE_DOES_NOT_EXIST) => {
            return Ok(ManagerServiceStatus::NotInstalled)
        }
        Err(err) => return Err(err.into()),
    };

    let mut status = SERVICE_STATUS::default();
    unsafe { QueryServiceStatus(service.0, &mut status) }?;
    Ok(match status.dwCurrentState {
        SERVICE_STOPPED => ManagerServiceStatus::Stopped,
        SERVICE_RUNNING => ManagerServiceStatus::Running,
        _ => ManagerServiceStatus::Transitioning,
    })
}

pub fn start_manager_service() -> Result<(), InstallError> {
    let scm = service_manager()?;
    let name = wide(&manager_service_name());
    let service =
        ScHandle(unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) }?);
    unsafe { StartServiceW(service.0, None) }?;
    Ok(())
}

/// Install (or reinstall) the manager service and start it. A service in
/// START_PENDING is treated as success: the updater relaunches the manager
/// and then runs the executable to raise the UI.
pub fn install_manager() -> Result<(), InstallError> {
    let scm = service_manager()?;
    let path = std::env::current_exe().map_err(|err| InstallError::Other(err.to_string()))?;
    let service_name = manager_service_name();
    let name = wide(&service_name);

    if let Ok(existing) = unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) }
    {
        let existing = ScHandle(existing);
        let mut status = SERVICE_STATUS::default();
        unsafe { QueryServiceStatus(existing.0, &mut status) }?;
        if status.dwCurrentState != SERVICE_STOPPED {
            if status.dwCurrentState == SERVICE_START_PENDING {
                return Ok(());
            }
            return Err(InstallError::ManagerAlreadyRunning);
        }
        unsafe { DeleteService(existing.0) }?;
        drop(existing);
        wait_until_deleted(&scm, &name);
    }

    let display_name = wide(&format!("{} Manager", config::APP_NAME));
    let binary_path = wide(&format!("\"{}\" /managerservice", path.display()));
    let service = ScHandle(unsafe {
        CreateServiceW(
            scm.0,
            PCWSTR(name.as_ptr()),
            PCWSTR(display_name.as_ptr()),
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_DEMAND_START,
            SERVICE_ERROR_NORMAL,
            PCWSTR(binary_path.as_ptr()),
            PCWSTR::null(),
            None,
            PCWSTR::null(),
            PCWSTR::null(),
            PCWSTR::null(),
        )
    }?);

    if let Err(err) = unsafe { StartServiceW(service.0, None) } {
        warn!("manager service installed but failed to start: {err}");
    }
    info!("manager service {service_name} installed");
    Ok(())
}

pub fn uninstall_manager() -> Result<(), InstallError> {
    let scm = service_manager()?;
    let name = wide(&manager_service_name());
    let service =
        ScHandle(unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) }?);

    let mut status = SERVICE_STATUS::default();
    unsafe {
        let _ = ControlService(service.0, SERVICE_CONTROL_STOP, &mut status);
        DeleteService(service.0)?;
    }
    Ok(())
}

/// Create and start the per-tunnel worker service. The config lands in a
/// protected file that the worker reads at start.
pub fn install_tunnel(config_json: &str) -> Result<(), InstallError> {
    let parsed: serde_json::Value = serde_json::from_str(config_json)
        .map_err(|err| InstallError::Other(format!("failed to parse config: {err}")))?;
    let tunnel_name = parsed
        .get("name")
        .and_then(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_TUNNEL_NAME);

    let scm = service_manager()?;
    let path = std::env::current_exe().map_err(|err| InstallError::Other(err.to_string()))?;
    let service_name = tunnel_service_name(tunnel_name);
    let name = wide(&service_name);

    if let Ok(existing) = unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) }
    {
        let existing = ScHandle(existing);
        let mut status = SERVICE_STATUS::default();
        match unsafe { QueryServiceStatus(existing.0, &mut status) } {
            Ok(()) if status.dwCurrentState != SERVICE_STOPPED => {
                return Err(InstallError::TunnelAlreadyRunning);
            }
            Ok(()) => {}
            Err(err) if is_win32(&err, ERROR_SERVICE_MARKED_FOR_DELETE) => {}
            Err(err) => return Err(err.into()),
        }
        match unsafe { DeleteService(existing.0) } {
            Ok(()) => {}
            Err(err) if is_win32(&err, ERROR_SERVICE_MARKED_FOR_DELETE) => {}
            Err(err) => return Err(err.into()),
        }
        drop(existing);
        wait_until_deleted(&scm, &name);
    }

    let config_path = tunnel_config_path(tunnel_name);
    std::fs::create_dir_all(config::tunnels_dir())
        .map_err(|err| InstallError::Other(format!("failed to create config directory: {err}")))?;
    write_protected_file(&config_path, config_json.as_bytes())?;

    let display_name = wide(&format!("{} Tunnel: {}", config::APP_NAME, tunnel_name));
    let binary_path = wide(&format!(
        "\"{}\" /tunnelservice \"{}\"",
        path.display(),
        config_path.display()
    ));
    // Doubly null-terminated multi-string.
    let dependencies: Vec<u16> = "Nsi\0TcpIp\0"
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let service = ScHandle(unsafe {
        CreateServiceW(
            scm.0,
            PCWSTR(name.as_ptr()),
            PCWSTR(display_name.as_ptr()),
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_DEMAND_START,
            SERVICE_ERROR_NORMAL,
            PCWSTR(binary_path.as_ptr()),
            PCWSTR::null(),
            None,
            PCWSTR(dependencies.as_ptr()),
            PCWSTR::null(),
            PCWSTR::null(),
        )
    }?);

    let sid_info = SERVICE_SID_INFO {
        dwServiceSidType: SERVICE_SID_TYPE_UNRESTRICTED,
    };
    unsafe {
        ChangeServiceConfig2W(
            service.0,
            SERVICE_CONFIG_SERVICE_SID_INFO,
            Some(&sid_info as *const _ as *const core::ffi::c_void),
        )
    }?;

    unsafe { StartServiceW(service.0, None) }?;
    info!("tunnel service {service_name} installed and started");
    Ok(())
}

/// Stop and remove a worker service; missing services count as success.
pub fn uninstall_tunnel(name: &str) -> Result<(), InstallError> {
    let scm = service_manager()?;
    let service_name = tunnel_service_name(name);
    let wide_name = wide(&service_name);

    let service =
        match unsafe { OpenServiceW(scm.0, PCWSTR(wide_name.as_ptr()), SERVICE_ALL_ACCESS) } {
            Ok(handle) => ScHandle(handle),
            Err(err) if is_win32(&err, ERROR_SERVICE_DOES_NOT_EXIST) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

    let mut status = SERVICE_STATUS::default();
    unsafe {
        let _ = ControlService(service.0, SERVICE_CONTROL_STOP, &mut status);
        match DeleteService(service.0) {
            Ok(()) => {}
            Err(err) if is_win32(&err, ERROR_SERVICE_MARKED_FOR_DELETE) => {}
            Err(err) => return Err(err.into()),
        }
    }

    if let Err(err) = std::fs::remove_file(tunnel_config_path(name)) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove tunnel config: {err}");
        }
    }
    info!("tunnel service {service_name} uninstalled");
    Ok(())
}

fn wait_until_deleted(scm: &ScHandle, name: &[u16]) {
    loop {
        match unsafe { OpenServiceW(scm.0, PCWSTR(name.as_ptr()), SERVICE_ALL_ACCESS) } {
            Ok(handle) => {
                drop(ScHandle(handle));
                std::thread::sleep(DELETE_POLL_INTERVAL);
            }
            Err(_) => return,
        }
    }
}

fn write_protected_file(path: &std::path::Path, contents: &[u8]) -> Result<(), InstallError> {
    use std::io::Write;
    use std::os::windows::io::FromRawHandle;
    use windows::Win32::Foundation::{GENERIC_WRITE, HLOCAL, LocalFree};
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, CREATE_ALWAYS, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_NONE,
    };

    let sddl = wide(TUNNEL_CONFIG_SDDL);
    let mut descriptor = PSECURITY_DESCRIPTOR::default();
    unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            PCWSTR(sddl.as_ptr()),
            SDDL_REVISION_1,
            &mut descriptor,
            None,
        )
    }
    .map_err(|err| InstallError::Other(format!("bad security descriptor: {err}")))?;

    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0,
        bInheritHandle: false.into(),
    };

    let path_wide = wide(&path.to_string_lossy());
    let handle = unsafe {
        CreateFileW(
            PCWSTR(path_wide.as_ptr()),
            GENERIC_WRITE.0,
            FILE_SHARE_NONE,
            Some(&attributes),
            CREATE_ALWAYS,
            FILE_ATTRIBUTE_NORMAL,
            None,
        )
    };
    unsafe {
        let _ = LocalFree(HLOCAL(descriptor.0));
    }
    let handle =
        handle.map_err(|err| InstallError::Other(format!("failed to write config file: {err}")))?;

    let mut file = unsafe { std::fs::File::from_raw_handle(handle.0 as _) };
    file.write_all(contents)
        .map_err(|err| InstallError::Other(format!("failed to write config file: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitization_replaces_invalid_characters() {
        assert_eq!(sanitize_service_name("olm"), "olm");
        assert_eq!(sanitize_service_name("my tunnel/1"), "my_tunnel_1");
        assert_eq!(sanitize_service_name("a-b_c(1)[2]{3}"), "a-b_c(1)[2]{3}");
    }

    #[test]
    fn tunnel_service_name_is_prefixed_and_capped() {
        assert_eq!(tunnel_service_name("olm"), "PangolinTunnel$olm");
        let long = "x".repeat(120);
        let name = tunnel_service_name(&long);
        assert_eq!(name.len(), SERVICE_NAME_LIMIT);
        assert!(name.starts_with("PangolinTunnel$"));
    }

    #[test]
    fn manager_service_name_uses_app_name() {
        assert_eq!(manager_service_name(), "PangolinManager");
    }
}
