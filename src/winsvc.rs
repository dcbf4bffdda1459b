//! Thin channel-based wrapper over the Windows service control dispatcher.
//! A service body receives SCM controls on a tokio channel and reports
//! status through a [`StatusReporter`], which keeps the bodies testable
//! without a service host.

use std::sync::OnceLock;

use tokio::sync::mpsc;
use tracing::error;

use windows::core::PCWSTR;
use windows::Win32::System::RemoteDesktop::WTSSESSION_NOTIFICATION;
use windows::Win32::System::Services::{
    RegisterServiceCtrlHandlerExW, SetServiceStatus, StartServiceCtrlDispatcherW,
    SERVICE_ACCEPT_SESSIONCHANGE, SERVICE_ACCEPT_SHUTDOWN, SERVICE_ACCEPT_STOP,
    SERVICE_CONTROL_INTERROGATE, SERVICE_CONTROL_SESSIONCHANGE, SERVICE_CONTROL_SHUTDOWN,
    SERVICE_CONTROL_STOP, SERVICE_RUNNING, SERVICE_START_PENDING, SERVICE_STATUS,
    SERVICE_STATUS_CURRENT_STATE, SERVICE_STATUS_HANDLE, SERVICE_STOPPED, SERVICE_STOP_PENDING,
    SERVICE_TABLE_ENTRYW, SERVICE_WIN32_OWN_PROCESS,
};

pub const ACCEPT_STOP: u32 = SERVICE_ACCEPT_STOP;
pub const ACCEPT_SHUTDOWN: u32 = SERVICE_ACCEPT_SHUTDOWN;
pub const ACCEPT_SESSION_CHANGE: u32 = SERVICE_ACCEPT_SESSIONCHANGE;

/// Session logon/logoff notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub event: u32,
    pub session_id: u32,
}

pub const WTS_SESSION_LOGON: u32 = 5;
pub const WTS_SESSION_LOGOFF: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControl {
    Stop,
    Shutdown,
    Interrogate,
    SessionChange(SessionChange),
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    StopPending,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Bitmask of ACCEPT_* values, meaningful while Running.
    pub accepts: u32,
}

impl ServiceStatus {
    pub fn start_pending() -> Self {
        Self {
            state: ServiceState::StartPending,
            accepts: 0,
        }
    }

    pub fn running(accepts: u32) -> Self {
        Self {
            state: ServiceState::Running,
            accepts,
        }
    }

    pub fn stop_pending() -> Self {
        Self {
            state: ServiceState::StopPending,
            accepts: 0,
        }
    }
}

/// Status sink; the SCM-backed implementation is used in production, tests
/// record what the body reported.
pub trait StatusReporter: Send + Sync {
    fn set(&self, status: ServiceStatus);
}

/// A service body: runs to completion and returns a service-specific exit
/// code (0 = clean).
pub type ServiceBody =
    Box<dyn FnOnce(mpsc::UnboundedReceiver<ServiceControl>, Box<dyn StatusReporter>) -> u32 + Send>;

struct ServiceSpec {
    name: Vec<u16>,
    body: std::sync::Mutex<Option<ServiceBody>>,
}

static SERVICE: OnceLock<ServiceSpec> = OnceLock::new();

struct HandlerContext {
    controls: mpsc::UnboundedSender<ServiceControl>,
}

struct ScmStatusReporter {
    handle: SERVICE_STATUS_HANDLE,
}

// SERVICE_STATUS_HANDLE is a process-local opaque handle; SetServiceStatus
// is callable from any thread.
unsafe impl Send for ScmStatusReporter {}
unsafe impl Sync for ScmStatusReporter {}

impl ScmStatusReporter {
    fn set_raw(&self, state: SERVICE_STATUS_CURRENT_STATE, accepts: u32, exit_code: u32) {
        let status = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: state,
            dwControlsAccepted: accepts,
            dwWin32ExitCode: if exit_code == 0 { 0 } else { 1066 }, // ERROR_SERVICE_SPECIFIC_ERROR
            dwServiceSpecificExitCode: exit_code,
            dwCheckPoint: 0,
            dwWaitHint: 0,
        };
        if let Err(err) = unsafe { SetServiceStatus(self.handle, &status) } {
            error!("SetServiceStatus failed: {err}");
        }
    }
}

impl StatusReporter for ScmStatusReporter {
    fn set(&self, status: ServiceStatus) {
        let (state, accepts) = match status.state {
            ServiceState::StartPending => (SERVICE_START_PENDING, 0),
            ServiceState::Running => (SERVICE_RUNNING, status.accepts),
            ServiceState::StopPending => (SERVICE_STOP_PENDING, 0),
            ServiceState::Stopped => (SERVICE_STOPPED, 0),
        };
        self.set_raw(state, accepts, 0);
    }
}

/// Connect this process to the SCM and run `body` as the service `name`.
/// Blocks until the service stops. One service per process.
pub fn run(name: &str, body: ServiceBody) -> Result<(), String> {
    let spec = ServiceSpec {
        name: name.encode_utf16().chain(std::iter::once(0)).collect(),
        body: std::sync::Mutex::new(Some(body)),
    };
    if SERVICE.set(spec).is_err() {
        return Err("service dispatcher already started in this process".to_string());
    }
    let spec = SERVICE.get().expect("just set");

    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: windows::core::PWSTR(spec.name.as_ptr() as *mut _),
            lpServiceProc: Some(service_main),
        },
        SERVICE_TABLE_ENTRYW::default(),
    ];
    unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) }
        .map_err(|err| format!("StartServiceCtrlDispatcher failed: {err}"))
}

extern "system" fn service_main(_argc: u32, _argv: *mut windows::core::PWSTR) {
    let Some(spec) = SERVICE.get() else { return };
    let Some(body) = spec.body.lock().unwrap().take() else {
        return;
    };

    let (controls_tx, controls_rx) = mpsc::unbounded_channel();
    let context = Box::into_raw(Box::new(HandlerContext {
        controls: controls_tx,
    }));

    let handle = match unsafe {
        RegisterServiceCtrlHandlerExW(
            PCWSTR(spec.name.as_ptr()),
            Some(control_handler),
            Some(context as *const _),
        )
    } {
        Ok(handle) => handle,
        Err(err) => {
            error!("RegisterServiceCtrlHandlerEx failed: {err}");
            drop(unsafe { Box::from_raw(context) });
            return;
        }
    };

    let reporter = ScmStatusReporter { handle };
    reporter.set(ServiceStatus::start_pending());

    let exit_code = body(controls_rx, Box::new(ScmStatusReporter { handle }));

    reporter.set_raw(SERVICE_STOPPED, 0, exit_code);
    // The handler context stays alive for the lifetime of the process; the
    // SCM may still deliver INTERROGATE after stop.
}

extern "system" fn control_handler(
    control: u32,
    event_type: u32,
    event_data: *mut core::ffi::c_void,
    context: *mut core::ffi::c_void,
) -> u32 {
    let context = unsafe { &*(context as *const HandlerContext) };
    let message = match control {
        SERVICE_CONTROL_STOP => ServiceControl::Stop,
        SERVICE_CONTROL_SHUTDOWN => ServiceControl::Shutdown,
        SERVICE_CONTROL_INTERROGATE => ServiceControl::Interrogate,
        SERVICE_CONTROL_SESSIONCHANGE => {
            if event_data.is_null() {
                return 87; // ERROR_INVALID_PARAMETER
            }
            let notification = unsafe { &*(event_data as *const WTSSESSION_NOTIFICATION) };
            if notification.cbSize as usize != std::mem::size_of::<WTSSESSION_NOTIFICATION>() {
                error!(
                    "unexpected WTSSESSION_NOTIFICATION size: {}",
                    notification.cbSize
                );
                return 0;
            }
            ServiceControl::SessionChange(SessionChange {
                event: event_type,
                session_id: notification.dwSessionId,
            })
        }
        other => ServiceControl::Other(other),
    };
    let _ = context.controls.send(message);
    0
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every status the body reports, in order.
    #[derive(Default)]
    pub struct RecordingReporter {
        pub statuses: Mutex<Vec<ServiceStatus>>,
    }

    impl StatusReporter for RecordingReporter {
        fn set(&self, status: ServiceStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }
}
