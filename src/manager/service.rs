use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::launch::{
    analyze_session_user, create_ui_pipes, launch_ui_process, SessionUser, UiProcess,
};
use super::{
    manager_service_name, uninstall_manager, ManagerState, ScmTunnelLifecycle, UI_LAUNCH_PIPE,
};
use crate::config;
use crate::ipc::IpcServer;
use crate::updater::{self, UpdateState};
use crate::winsvc::{
    self, ServiceControl, ServiceStatus, StatusReporter, ACCEPT_SESSION_CHANGE, ACCEPT_STOP,
    WTS_SESSION_LOGOFF, WTS_SESSION_LOGON,
};

const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const LAUNCH_QUEUE_DEPTH: usize = 8;

/// Launch-pipe protocol responses.
const RESPONSE_LAUNCHING: u32 = 0;
const RESPONSE_ALREADY_RUNNING: u32 = 1;
const RESPONSE_SESSION_NOT_FOUND: u32 = 2;

struct UiRecord {
    process: Arc<UiProcess>,
    /// Keeps the session's tokens alive while the UI is attached.
    _user: Arc<SessionUser>,
}

#[derive(Default)]
struct SessionTable {
    procs: HashMap<u32, UiRecord>,
    alive: HashSet<u32>,
    stopping: bool,
}

type Sessions = Arc<Mutex<SessionTable>>;

/// Service entry for `/managerservice`.
pub fn run() -> Result<(), String> {
    winsvc::run(
        &manager_service_name(),
        Box::new(|controls, status| {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("failed to build manager runtime: {err}");
                    return 1;
                }
            };
            runtime.block_on(execute(controls, status.as_ref()))
        }),
    )
}

async fn execute(
    mut controls: mpsc::UnboundedReceiver<ServiceControl>,
    status: &dyn StatusReporter,
) -> u32 {
    info!("manager service starting");
    status.set(ServiceStatus::start_pending());

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            error!("failed to determine executable path: {err}");
            return 1;
        }
    };

    let ipc = IpcServer::new();
    let (quit_tx, mut quit_rx) = mpsc::channel(1);
    let state = ManagerState::new(ipc.clone(), Arc::new(ScmTunnelLifecycle), quit_tx);
    let sessions: Sessions = Arc::new(Mutex::new(SessionTable::default()));

    // Background update discovery; found candidates flip the shared state
    // and fan out an UpdateFound event.
    let checker_state = state.clone();
    let checker_ipc = ipc.clone();
    let checker = tokio::spawn(updater::run_background_checker(
        UPDATE_CHECK_INTERVAL,
        move |update| {
            info!("update available: {}", update.name);
            checker_state.set_update_state(UpdateState::FoundUpdate);
            let ipc = checker_ipc.clone();
            tokio::spawn(async move {
                ipc.notify_update_found(UpdateState::FoundUpdate).await;
            });
        },
    ));

    let (launch_tx, mut launch_rx) = mpsc::channel::<u32>(LAUNCH_QUEUE_DEPTH);

    // Standard users cause UI launches through the named pipe; the service
    // keeps running without it if creation fails.
    let listener = match spawn_launch_listener(sessions.clone(), launch_tx.clone()) {
        Ok(task) => Some(task),
        Err(err) => {
            error!("failed to create UI launch pipe listener: {err}");
            None
        }
    };

    status.set(ServiceStatus::running(ACCEPT_STOP | ACCEPT_SESSION_CHANGE));

    // After an MSI update the previous manager wrote a flag asking us to
    // bring the UI back for the console session.
    {
        let sessions = sessions.clone();
        let launch_tx = launch_tx.clone();
        tokio::spawn(async move {
            let flag = config::restart_ui_flag_path();
            if !flag.exists() {
                return;
            }
            let session_id = unsafe {
                windows::Win32::System::RemoteDesktop::WTSGetActiveConsoleSessionId()
            };
            if session_id == 0 {
                info!("restart-ui flag present but no active console session");
                let _ = std::fs::remove_file(&flag);
                return;
            }
            sessions.lock().unwrap().alive.insert(session_id);
            let _ = launch_tx.send(session_id).await;
            match std::fs::remove_file(&flag) {
                Ok(()) => info!("launched UI for session {session_id} after update"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => error!("failed to remove restart-ui flag: {err}"),
            }
        });
    }

    let accepts = ACCEPT_STOP | ACCEPT_SESSION_CHANGE;
    let mut uninstall = false;
    loop {
        tokio::select! {
            session_id = launch_rx.recv() => {
                let Some(session_id) = session_id else { break };
                let should_start = {
                    let table = sessions.lock().unwrap();
                    !table.stopping
                        && !table.procs.contains_key(&session_id)
                        && table.alive.contains(&session_id)
                };
                if should_start {
                    let exe = exe.clone();
                    let ipc = ipc.clone();
                    let state = state.clone();
                    let sessions = sessions.clone();
                    tokio::spawn(async move {
                        run_ui_for_session(session_id, exe, ipc, state, sessions).await;
                    });
                }
            }
            _ = quit_rx.recv() => {
                uninstall = true;
                sessions.lock().unwrap().stopping = true;
                break;
            }
            control = controls.recv() => {
                match control {
                    None | Some(ServiceControl::Stop) => break,
                    Some(ServiceControl::Shutdown) => break,
                    Some(ServiceControl::Interrogate) => {
                        status.set(ServiceStatus::running(accepts));
                    }
                    Some(ServiceControl::SessionChange(change)) => match change.event {
                        WTS_SESSION_LOGON => {
                            sessions.lock().unwrap().alive.insert(change.session_id);
                            // UI starts only on demand, not at logon.
                        }
                        WTS_SESSION_LOGOFF => {
                            let record = {
                                let mut table = sessions.lock().unwrap();
                                table.alive.remove(&change.session_id);
                                table.procs.remove(&change.session_id)
                            };
                            if let Some(record) = record {
                                info!("session {} logged off, terminating its UI", change.session_id);
                                record.process.kill();
                            }
                        }
                        _ => {}
                    },
                    Some(other) => {
                        warn!("unexpected service control request: {other:?}");
                    }
                }
            }
        }
    }

    status.set(ServiceStatus::stop_pending());
    sessions.lock().unwrap().stopping = true;
    ipc.notify_manager_stopping().await;
    {
        let table = sessions.lock().unwrap();
        for record in table.procs.values() {
            record.process.kill();
        }
    }
    if let Some(listener) = listener {
        listener.abort();
    }
    checker.abort();

    if uninstall {
        match tokio::task::spawn_blocking(uninstall_manager).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("unable to uninstall manager when quitting: {err}"),
            Err(err) => error!("failed to join uninstall task: {err}"),
        }
    }

    info!("manager service stopped");
    0
}

/// Launch one UI process for the session and babysit it until exit. UIs are
/// never auto-restarted; the user reruns the executable to get a new one.
async fn run_ui_for_session(
    session_id: u32,
    exe: PathBuf,
    ipc: Arc<IpcServer>,
    state: Arc<ManagerState>,
    sessions: Sessions,
) {
    let user = match tokio::task::spawn_blocking(move || analyze_session_user(session_id)).await {
        Ok(Ok(user)) => Arc::new(user),
        Ok(Err(err)) => {
            error!("unable to inspect session {session_id}: {err}");
            sessions.lock().unwrap().alive.remove(&session_id);
            return;
        }
        Err(err) => {
            error!("session inspection task failed: {err}");
            return;
        }
    };

    {
        let table = sessions.lock().unwrap();
        if table.stopping || !table.alive.contains(&session_id) {
            return;
        }
    }

    let pipes = match create_ui_pipes() {
        Ok(pipes) => pipes,
        Err(err) => {
            error!("unable to create UI pipes: {err}");
            return;
        }
    };

    let elevated_token = user
        .elevated_token
        .as_ref()
        .map(|token| token.raw())
        .unwrap_or(0);
    ipc.attach(
        state,
        tokio::fs::File::from_std(pipes.our_reader),
        tokio::fs::File::from_std(pipes.our_writer),
        tokio::fs::File::from_std(pipes.our_events),
        elevated_token,
    );

    use std::os::windows::io::AsRawHandle;
    let args = vec![
        exe.to_string_lossy().to_string(),
        "/ui".to_string(),
        (pipes.their_reader.as_raw_handle() as usize).to_string(),
        (pipes.their_writer.as_raw_handle() as usize).to_string(),
        (pipes.their_events.as_raw_handle() as usize).to_string(),
    ];

    info!(
        "starting UI process for user '{}@{}' in session {session_id}",
        user.username, user.domain
    );
    let process = match launch_ui_process(&exe, &args, &user.profile_dir, &user.run_token) {
        Ok(process) => Arc::new(process),
        Err(err) => {
            error!(
                "unable to start UI for '{}@{}' in session {session_id}: {err}",
                user.username, user.domain
            );
            sessions.lock().unwrap().alive.remove(&session_id);
            return;
        }
    };
    // The child owns its pipe ends now.
    drop(pipes.their_reader);
    drop(pipes.their_writer);
    drop(pipes.their_events);

    sessions.lock().unwrap().procs.insert(
        session_id,
        UiRecord {
            process: process.clone(),
            _user: user.clone(),
        },
    );

    match process.wait().await {
        Ok(code) => info!(
            "UI process for '{}@{}' in session {session_id} exited with status {code:#x}",
            user.username, user.domain
        ),
        Err(err) => error!("unable to wait for UI process in session {session_id}: {err}"),
    }

    let mut table = sessions.lock().unwrap();
    table.procs.remove(&session_id);
    table.alive.remove(&session_id);
}

fn spawn_launch_listener(
    sessions: Sessions,
    launch_tx: mpsc::Sender<u32>,
) -> Result<tokio::task::JoinHandle<()>, String> {
    let mut server = create_launch_pipe(true)?;
    Ok(tokio::spawn(async move {
        loop {
            if let Err(err) = server.connect().await {
                debug!("launch pipe accept failed: {err}");
                return;
            }
            let connected = server;
            server = match create_launch_pipe(false) {
                Ok(next) => next,
                Err(err) => {
                    error!("failed to recreate launch pipe: {err}");
                    handle_launch_conn(connected, sessions.clone(), launch_tx.clone()).await;
                    return;
                }
            };
            let sessions = sessions.clone();
            let launch_tx = launch_tx.clone();
            tokio::spawn(async move {
                handle_launch_conn(connected, sessions, launch_tx).await;
            });
        }
    }))
}

/// Everyone may connect; the payload is a single session id this process
/// validates itself.
fn create_launch_pipe(first: bool) -> Result<NamedPipeServer, String> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{HLOCAL, LocalFree};
    use windows::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

    let sddl: Vec<u16> = "D:(A;;GA;;;WD)"
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut descriptor = PSECURITY_DESCRIPTOR::default();
    unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            PCWSTR(sddl.as_ptr()),
            SDDL_REVISION_1,
            &mut descriptor,
            None,
        )
    }
    .map_err(|err| format!("bad launch pipe descriptor: {err}"))?;

    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0,
        bInheritHandle: false.into(),
    };

    let result = unsafe {
        ServerOptions::new()
            .first_pipe_instance(first)
            .create_with_security_attributes_raw(
                UI_LAUNCH_PIPE,
                &mut attributes as *mut _ as *mut core::ffi::c_void,
            )
    };
    unsafe {
        let _ = LocalFree(HLOCAL(descriptor.0));
    }
    result.map_err(|err| format!("failed to create launch pipe: {err}"))
}

async fn handle_launch_conn(mut pipe: NamedPipeServer, sessions: Sessions, launch_tx: mpsc::Sender<u32>) {
    // Less than four bytes is a protocol violation; the connection is simply
    // dropped.
    let mut request = [0u8; 4];
    if let Err(err) = pipe.read_exact(&mut request).await {
        debug!("launch pipe: failed to read session id: {err}");
        return;
    }
    let session_id = u32::from_le_bytes(request);

    let response = {
        let (stopping, already_running) = {
            let table = sessions.lock().unwrap();
            (table.stopping, table.procs.contains_key(&session_id))
        };
        if stopping {
            // Launches are refused during shutdown.
            RESPONSE_SESSION_NOT_FOUND
        } else if already_running {
            RESPONSE_ALREADY_RUNNING
        } else if !session_is_active(session_id).await {
            RESPONSE_SESSION_NOT_FOUND
        } else {
            sessions.lock().unwrap().alive.insert(session_id);
            match launch_tx.try_send(session_id) {
                Ok(()) => RESPONSE_LAUNCHING,
                Err(_) => RESPONSE_SESSION_NOT_FOUND,
            }
        }
    };

    if let Err(err) = pipe.write_all(&response.to_le_bytes()).await {
        debug!("launch pipe: failed to write response: {err}");
    }
    let _ = pipe.flush().await;
}

/// A session is active when it has a user token we could query.
async fn session_is_active(session_id: u32) -> bool {
    tokio::task::spawn_blocking(move || {
        use windows::Win32::Foundation::{CloseHandle, HANDLE};
        use windows::Win32::System::RemoteDesktop::WTSQueryUserToken;

        let mut token = HANDLE::default();
        match unsafe { WTSQueryUserToken(session_id, &mut token) } {
            Ok(()) => {
                unsafe {
                    let _ = CloseHandle(token);
                }
                true
            }
            Err(_) => false,
        }
    })
    .await
    .unwrap_or(false)
}
