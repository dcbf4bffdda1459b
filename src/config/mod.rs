mod accounts;
mod store;

pub use accounts::{Account, AccountStore};
pub use store::ConfigStore;

use std::path::PathBuf;

pub const APP_NAME: &str = "Pangolin";
pub const DEFAULT_HOSTNAME: &str = "https://app.pangolin.net";
pub const CONFIG_FILE_NAME: &str = "pangolin.json";
pub const ACCOUNTS_FILE_NAME: &str = "accounts.json";
pub const DEFAULT_PRIMARY_DNS: &str = "9.9.9.9";
pub const DEFAULT_DNS_OVERRIDE: bool = true;
pub const DEFAULT_DNS_TUNNEL: bool = false;

/// Per-user settings directory under Local AppData, created on first use.
pub fn local_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("APPDATA"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base).join(APP_NAME)
}

/// Machine-wide state directory. The installer creates this.
pub fn program_data_dir() -> PathBuf {
    let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
    PathBuf::from(base).join(APP_NAME)
}

pub fn log_dir() -> PathBuf {
    program_data_dir().join("logs")
}

pub fn tunnels_dir() -> PathBuf {
    program_data_dir().join("Tunnels")
}

pub fn restart_ui_flag_path() -> PathBuf {
    program_data_dir().join("restart-ui-after-update.flag")
}

/// Log level for the whole application; overridable for support captures.
pub fn log_level() -> String {
    std::env::var("PANGOLIN_LOG").unwrap_or_else(|_| "debug".to_string())
}

/// "Windows Laptop" or "Windows Desktop", by battery presence.
pub fn friendly_device_name() -> String {
    if has_battery() {
        "Windows Laptop".to_string()
    } else {
        "Windows Desktop".to_string()
    }
}

fn has_battery() -> bool {
    use windows::Win32::System::Power::{GetSystemPowerStatus, SYSTEM_POWER_STATUS};

    let mut status = SYSTEM_POWER_STATUS::default();
    if unsafe { GetSystemPowerStatus(&mut status) }.is_err() {
        return false;
    }
    // 128 = no battery, 255 = unknown
    !matches!(status.BatteryFlag, 128 | 255 | 0)
}
