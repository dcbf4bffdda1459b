use std::os::windows::io::FromRawHandle;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::{error, info};

use super::UpdateError;

/// SYSTEM gets full access, Administrators read; nobody else sees the file.
const MSI_TEMP_SDDL: &str = "O:SYD:PAI(A;;FA;;;SY)(A;;FR;;;BA)";

/// Raw access token handle passed across module boundaries. Zero means "no
/// token".
pub type RawToken = isize;

/// Randomly named MSI staging file under `%WinDir%\Temp`, created with a
/// restrictive descriptor and scheduled for deletion at reboot in case the
/// process dies mid-update.
pub(crate) struct MsiTempFile {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl MsiTempFile {
    pub(crate) fn create() -> Result<Self, UpdateError> {
        use windows::core::PCWSTR;
        use windows::Win32::Foundation::{GENERIC_WRITE, HLOCAL, LocalFree};
        use windows::Win32::Security::Authorization::{
            ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
        };
        use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
        use windows::Win32::Storage::FileSystem::{
            CreateFileW, MoveFileExW, CREATE_NEW, DELETE, FILE_ATTRIBUTE_TEMPORARY,
            FILE_SHARE_NONE, MOVEFILE_DELAY_UNTIL_REBOOT,
        };

        let mut rand_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut rand_bytes);
        let name = hex::encode(rand_bytes);

        let windir = std::env::var("WINDIR").map_err(|_| {
            UpdateError::Io("WINDIR is not set".to_string())
        })?;
        let path = PathBuf::from(windir).join("Temp").join(name);
        info!("msi staging file {}", path.display());

        let sddl: Vec<u16> = MSI_TEMP_SDDL
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
        .map_err(|err| UpdateError::Io(format!("bad security descriptor: {err}")))?;

        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor.0,
            bInheritHandle: false.into(),
        };

        let path_wide: Vec<u16> = path.as_os_str().encode_wide_nul();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path_wide.as_ptr()),
                GENERIC_WRITE.0 | DELETE.0,
                FILE_SHARE_NONE,
                Some(&attributes),
                CREATE_NEW,
                FILE_ATTRIBUTE_TEMPORARY,
                None,
            )
        };
        unsafe {
            let _ = LocalFree(HLOCAL(descriptor.0));
        }
        let handle =
            handle.map_err(|err| UpdateError::Io(format!("failed to create temp file: {err}")))?;

        // Belt and braces: if the process dies before Delete runs, the file
        // goes away at the next reboot.
        unsafe {
            let _ = MoveFileExW(PCWSTR(path_wide.as_ptr()), PCWSTR::null(), MOVEFILE_DELAY_UNTIL_REBOOT);
        }

        let file = unsafe { std::fs::File::from_raw_handle(handle.0 as _) };

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub(crate) fn take_file(&mut self) -> Option<std::fs::File> {
        self.file.take()
    }

    pub(crate) fn put_back(&mut self, file: std::fs::File) {
        self.file = Some(file);
    }

    /// msiexec requires an unshared file; drop our handle and hand out the
    /// path.
    pub(crate) fn exclusive_path(&mut self) -> &Path {
        self.file = None;
        &self.path
    }

    pub(crate) fn delete(mut self) {
        self.file = None;
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("failed to delete msi temp file: {err}");
            }
        }
        // Drop impl has nothing left to do.
        std::mem::forget(self);
    }
}

impl Drop for MsiTempFile {
    fn drop(&mut self) {
        self.file = None;
        let _ = std::fs::remove_file(&self.path);
    }
}

trait EncodeWideNul {
    fn encode_wide_nul(&self) -> Vec<u16>;
}

impl EncodeWideNul for std::ffi::OsStr {
    fn encode_wide_nul(&self) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        self.encode_wide().chain(std::iter::once(0)).collect()
    }
}

/// Run `msiexec.exe /qb!- /i <file>` under the given user token and wait for
/// it. Blocking; callers run it on a blocking thread.
pub(crate) fn run_msi(msi_path: &Path, user_token: RawToken) -> Result<(), UpdateError> {
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{
        CreateProcessAsUserW, GetExitCodeProcess, WaitForSingleObject, CREATE_NO_WINDOW, INFINITE,
        PROCESS_INFORMATION, STARTUPINFOW,
    };

    if user_token == 0 {
        return Err(UpdateError::Io(
            "update requires an elevated user token".to_string(),
        ));
    }

    let system32 = std::env::var("SYSTEMROOT")
        .map(|root| PathBuf::from(root).join("System32"))
        .map_err(|_| UpdateError::Io("SYSTEMROOT is not set".to_string()))?;
    let msiexec = system32.join("msiexec.exe");
    let workdir = msi_path
        .parent()
        .ok_or_else(|| UpdateError::Io("msi path has no parent".to_string()))?;
    let basename = msi_path
        .file_name()
        .ok_or_else(|| UpdateError::Io("msi path has no file name".to_string()))?;

    let application = msiexec.as_os_str().encode_wide_nul();
    let mut command_line: Vec<u16> = format!(
        "\"{}\" /qb!- /i {}",
        msiexec.display(),
        basename.to_string_lossy()
    )
    .encode_utf16()
    .chain(std::iter::once(0))
    .collect();
    let workdir_wide = workdir.as_os_str().encode_wide_nul();

    let startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    info!("starting msiexec for {}", msi_path.display());
    unsafe {
        CreateProcessAsUserW(
            HANDLE(user_token as _),
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false.into(),
            CREATE_NO_WINDOW,
            None,
            PCWSTR(workdir_wide.as_ptr()),
            &startup,
            &mut process_info,
        )
    }
    .map_err(|err| UpdateError::Io(format!("failed to start msiexec: {err}")))?;

    let exit_code = unsafe {
        let wait = WaitForSingleObject(process_info.hProcess, INFINITE);
        let mut code: u32 = 0;
        let result = GetExitCodeProcess(process_info.hProcess, &mut code);
        let _ = CloseHandle(process_info.hThread);
        let _ = CloseHandle(process_info.hProcess);
        if wait != WAIT_OBJECT_0 || result.is_err() {
            return Err(UpdateError::Io("failed to wait for msiexec".to_string()));
        }
        code
    };

    if exit_code != 0 {
        error!("msiexec failed with exit code {exit_code}");
        return Err(UpdateError::MsiExit(exit_code));
    }
    info!("msi installation completed");
    Ok(())
}
