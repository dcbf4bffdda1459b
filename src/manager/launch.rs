use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT, WAIT_OBJECT_0,
};
use windows::Win32::Security::{
    CheckTokenMembership, CreateWellKnownSid, DuplicateTokenEx, GetTokenInformation,
    LookupAccountSidW, SecurityImpersonation, TokenElevation, TokenImpersonation, TokenLinkedToken,
    TokenUser, WinBuiltinAdministratorsSid, PSID, SECURITY_ATTRIBUTES, SID_NAME_USE,
    TOKEN_ALL_ACCESS, TOKEN_DUPLICATE, TOKEN_ELEVATION, TOKEN_LINKED_TOKEN, TOKEN_QUERY,
    TOKEN_USER,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::RemoteDesktop::{ProcessIdToSessionId, WTSGetActiveConsoleSessionId, WTSQueryUserToken};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, GetCurrentProcessId, GetExitCodeProcess, TerminateProcess,
    WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION, STARTUPINFOW,
};
use windows::Win32::UI::Shell::GetUserProfileDirectoryW;

use super::UI_LAUNCH_PIPE;
use crate::updater::RawToken;

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Access token owned by this process; closed on drop.
pub struct OwnedToken(HANDLE);

unsafe impl Send for OwnedToken {}
unsafe impl Sync for OwnedToken {}

impl OwnedToken {
    pub fn raw(&self) -> RawToken {
        self.0 .0 as RawToken
    }
}

impl Drop for OwnedToken {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Result of inspecting a session's user token: which token the UI runs
/// under, and a separately owned elevated token when the user can act as
/// an administrator right now.
pub struct SessionUser {
    pub username: String,
    pub domain: String,
    pub profile_dir: PathBuf,
    pub run_token: OwnedToken,
    /// None for standard users; the IPC server refuses privileged methods
    /// for them.
    pub elevated_token: Option<OwnedToken>,
}

fn token_is_elevated(token: HANDLE) -> bool {
    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned = 0u32;
    let ok = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    ok.is_ok() && elevation.TokenIsElevated != 0
}

fn linked_token(token: HANDLE) -> Option<OwnedToken> {
    let mut linked = TOKEN_LINKED_TOKEN::default();
    let mut returned = 0u32;
    let ok = unsafe {
        GetTokenInformation(
            token,
            TokenLinkedToken,
            Some(&mut linked as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_LINKED_TOKEN>() as u32,
            &mut returned,
        )
    };
    if ok.is_ok() && !linked.LinkedToken.is_invalid() {
        Some(OwnedToken(linked.LinkedToken))
    } else {
        None
    }
}

fn token_is_admin_member(token: HANDLE) -> bool {
    let mut sid_buffer = [0u8; 68]; // SECURITY_MAX_SID_SIZE
    let mut sid_size = sid_buffer.len() as u32;
    let sid = PSID(sid_buffer.as_mut_ptr() as *mut _);
    if unsafe { CreateWellKnownSid(WinBuiltinAdministratorsSid, None, sid, &mut sid_size) }
        .is_err()
    {
        return false;
    }

    // CheckTokenMembership wants an impersonation token.
    let mut impersonation = HANDLE::default();
    if unsafe {
        DuplicateTokenEx(
            token,
            TOKEN_QUERY,
            None,
            SecurityImpersonation,
            TokenImpersonation,
            &mut impersonation,
        )
    }
    .is_err()
    {
        return false;
    }
    let impersonation = OwnedToken(impersonation);

    let mut is_member = windows::Win32::Foundation::FALSE;
    let ok = unsafe { CheckTokenMembership(impersonation.0, sid, &mut is_member) };
    ok.is_ok() && is_member.as_bool()
}

fn duplicate_primary(token: HANDLE) -> Result<OwnedToken, String> {
    use windows::Win32::Security::TokenPrimary;

    let mut duplicate = HANDLE::default();
    unsafe {
        DuplicateTokenEx(
            token,
            TOKEN_ALL_ACCESS,
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut duplicate,
        )
    }
    .map_err(|err| format!("failed to duplicate token: {err}"))?;
    Ok(OwnedToken(duplicate))
}

fn token_account(token: HANDLE) -> Result<(String, String, SID_NAME_USE), String> {
    let mut size = 0u32;
    let _ = unsafe { GetTokenInformation(token, TokenUser, None, 0, &mut size) };
    let mut buffer = vec![0u8; size as usize];
    unsafe {
        GetTokenInformation(
            token,
            TokenUser,
            Some(buffer.as_mut_ptr() as *mut _),
            size,
            &mut size,
        )
    }
    .map_err(|err| format!("failed to query token user: {err}"))?;
    let token_user = unsafe { &*(buffer.as_ptr() as *const TOKEN_USER) };

    let mut name = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain = [0u16; 256];
    let mut domain_len = domain.len() as u32;
    let mut use_type = SID_NAME_USE::default();
    unsafe {
        LookupAccountSidW(
            PCWSTR::null(),
            token_user.User.Sid,
            PWSTR(name.as_mut_ptr()),
            &mut name_len,
            PWSTR(domain.as_mut_ptr()),
            &mut domain_len,
            &mut use_type,
        )
    }
    .map_err(|err| format!("failed to look up account: {err}"))?;

    Ok((
        String::from_utf16_lossy(&name[..name_len as usize]),
        String::from_utf16_lossy(&domain[..domain_len as usize]),
        use_type,
    ))
}

fn profile_directory(token: HANDLE) -> Result<PathBuf, String> {
    let mut size = 0u32;
    let _ = unsafe { GetUserProfileDirectoryW(token, PWSTR::null(), &mut size) };
    let mut buffer = vec![0u16; size as usize];
    unsafe { GetUserProfileDirectoryW(token, PWSTR(buffer.as_mut_ptr()), &mut size) }
        .map_err(|err| format!("failed to query profile directory: {err}"))?;
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    Ok(PathBuf::from(String::from_utf16_lossy(&buffer[..len])))
}

/// Inspect the interactive session's user: pick the token to run the UI
/// under (the elevated one when available) and expose a separate elevated
/// token for privileged IPC when the user has one.
pub fn analyze_session_user(session_id: u32) -> Result<SessionUser, String> {
    use windows::Win32::Security::SidTypeUser;

    let mut raw_token = HANDLE::default();
    unsafe { WTSQueryUserToken(session_id, &mut raw_token) }
        .map_err(|err| format!("failed to query session user token: {err}"))?;
    let user_token = OwnedToken(raw_token);

    let (username, domain, use_type) = token_account(user_token.0)?;
    if use_type != SidTypeUser {
        return Err("session token does not belong to a user account".to_string());
    }

    let user_elevated = token_is_elevated(user_token.0);
    let linked = linked_token(user_token.0);
    let linked_elevated = linked
        .as_ref()
        .map(|token| token_is_elevated(token.0))
        .unwrap_or(false);
    let admin_member =
        user_elevated || linked_elevated || token_is_admin_member(user_token.0);

    let (run_token, elevated_token) = if user_elevated {
        let elevated = duplicate_primary(user_token.0)?;
        (user_token, Some(elevated))
    } else if admin_member && linked_elevated {
        let linked = linked.expect("linked_elevated implies linked token");
        let elevated = duplicate_primary(linked.0)?;
        (linked, Some(elevated))
    } else {
        // Admin-group members without an elevated token still get a UI; the
        // manager refuses their privileged requests.
        (user_token, None)
    };

    let profile_dir = profile_directory(run_token.0)?;

    Ok(SessionUser {
        username,
        domain,
        profile_dir,
        run_token,
        elevated_token,
    })
}

/// The manager-side and UI-side ends of the three IPC pipes.
pub struct UiPipes {
    pub our_reader: std::fs::File,
    pub our_writer: std::fs::File,
    pub our_events: std::fs::File,
    pub their_reader: OwnedHandle,
    pub their_writer: OwnedHandle,
    pub their_events: OwnedHandle,
}

/// Three anonymous pipe pairs: requests (UI writes), responses (manager
/// writes), events (manager writes). Only the UI-side ends are inheritable.
pub fn create_ui_pipes() -> Result<UiPipes, String> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };

    let pipe = |ours_is_read: bool| -> Result<(OwnedHandle, OwnedHandle), String> {
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        unsafe { CreatePipe(&mut read, &mut write, Some(&attributes), 0) }
            .map_err(|err| format!("unable to create pipe: {err}"))?;
        let (ours, theirs) = if ours_is_read {
            (read, write)
        } else {
            (write, read)
        };
        // Our end must not leak into the child.
        unsafe { SetHandleInformation(ours, HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0)) }
            .map_err(|err| format!("unable to clear inherit flag: {err}"))?;
        Ok(unsafe {
            (
                OwnedHandle::from_raw_handle(ours.0 as _),
                OwnedHandle::from_raw_handle(theirs.0 as _),
            )
        })
    };

    let (our_reader, their_writer) = pipe(true)?;
    let (our_writer, their_reader) = pipe(false)?;
    let (our_events, their_events) = pipe(false)?;

    Ok(UiPipes {
        our_reader: std::fs::File::from(our_reader),
        our_writer: std::fs::File::from(our_writer),
        our_events: std::fs::File::from(our_events),
        their_reader,
        their_writer,
        their_events,
    })
}

/// A launched UI process.
pub struct UiProcess {
    handle: OwnedHandle,
}

impl UiProcess {
    pub async fn wait(&self) -> Result<u32, String> {
        let raw = self.handle.as_raw_handle() as isize;
        tokio::task::spawn_blocking(move || {
            let handle = HANDLE(raw as _);
            let wait = unsafe { WaitForSingleObject(handle, INFINITE) };
            if wait != WAIT_OBJECT_0 {
                return Err("failed to wait for UI process".to_string());
            }
            let mut code = 0u32;
            unsafe { GetExitCodeProcess(handle, &mut code) }
                .map_err(|err| format!("failed to read UI exit code: {err}"))?;
            Ok(code)
        })
        .await
        .map_err(|err| err.to_string())?
    }

    pub fn kill(&self) {
        let handle = HANDLE(self.handle.as_raw_handle() as _);
        unsafe {
            let _ = TerminateProcess(handle, 1);
        }
    }
}

/// Start the UI executable in the user's session with the inheritable pipe
/// handles in argv.
pub fn launch_ui_process(
    exe: &std::path::Path,
    args: &[String],
    workdir: &std::path::Path,
    token: &OwnedToken,
) -> Result<UiProcess, String> {
    let application = wide(&exe.to_string_lossy());
    let command_line = args
        .iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    let mut command_line = wide(&command_line);
    let workdir = wide(&workdir.to_string_lossy());
    let desktop = wide("winsta0\\default");

    let mut environment: *mut core::ffi::c_void = std::ptr::null_mut();
    unsafe { CreateEnvironmentBlock(&mut environment, token.0, false.into()) }
        .map_err(|err| format!("failed to create environment block: {err}"))?;

    let startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        lpDesktop: PWSTR(desktop.as_ptr() as *mut _),
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    let result = unsafe {
        CreateProcessAsUserW(
            token.0,
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            true.into(),
            CREATE_UNICODE_ENVIRONMENT,
            Some(environment as *const _),
            PCWSTR(workdir.as_ptr()),
            &startup,
            &mut process_info,
        )
    };
    unsafe {
        let _ = DestroyEnvironmentBlock(environment);
    }
    result.map_err(|err| format!("failed to launch UI process: {err}"))?;

    unsafe {
        let _ = CloseHandle(process_info.hThread);
    }
    Ok(UiProcess {
        handle: unsafe { OwnedHandle::from_raw_handle(process_info.hProcess.0 as _) },
    })
}

/// Response codes of the UI-launch pipe protocol.
const LAUNCHING: u32 = 0;
const ALREADY_RUNNING: u32 = 1;
const SESSION_NOT_FOUND: u32 = 2;

/// Ask the running manager to raise a UI in this session. Used by the plain
/// executable entry point.
pub fn request_ui_launch() -> bool {
    use std::io::{Read, Write};

    let mut session_id = 0u32;
    if unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) }.is_err() {
        session_id = unsafe { WTSGetActiveConsoleSessionId() };
        debug!("falling back to active console session {session_id}");
    }
    if session_id == 0 {
        error!("failed to determine current session id");
        return false;
    }

    let mut pipe = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(UI_LAUNCH_PIPE)
    {
        Ok(pipe) => pipe,
        Err(err) => {
            debug!("failed to connect to manager launch pipe: {err}");
            return false;
        }
    };

    if let Err(err) = pipe.write_all(&session_id.to_le_bytes()) {
        error!("failed to send session id to manager: {err}");
        return false;
    }
    let mut response = [0u8; 4];
    if let Err(err) = pipe.read_exact(&mut response) {
        error!("failed to read manager launch response: {err}");
        return false;
    }

    match u32::from_le_bytes(response) {
        LAUNCHING => {
            info!("UI launch requested for session {session_id}");
            true
        }
        ALREADY_RUNNING => {
            info!("UI already running for session {session_id}");
            true
        }
        SESSION_NOT_FOUND => {
            error!("session {session_id} not found or not active");
            false
        }
        other => {
            error!("unexpected launch response {other}");
            false
        }
    }
}

/// Retry [`request_ui_launch`] with exponential backoff (200 ms doubling,
/// capped at 2 s) until it succeeds or the timeout elapses.
pub fn request_ui_launch_with_retry(timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut attempt: u32 = 0;
    while Instant::now() < deadline {
        if request_ui_launch() {
            return true;
        }
        let backoff = Duration::from_millis((200u64 << attempt.min(4)).min(2000));
        if Instant::now() + backoff > deadline {
            break;
        }
        std::thread::sleep(backoff);
        attempt += 1;
    }
    debug!("gave up requesting UI launch after {attempt} attempts");
    false
}
