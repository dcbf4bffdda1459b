use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::version;

const SYSTEM_INFORMATION_KEY: &str = r"SYSTEM\CurrentControlSet\Control\SystemInformation";
const CPU_KEY: &str = r"HARDWARE\DESCRIPTION\System\CentralProcessor\0";

/// Host identity reported to the backend and pushed into the tunnel engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub username: String,
    pub hostname: String,
    pub platform: String,
    pub os_version: String,
    pub kernel_version: String,
    #[serde(rename = "arch")]
    pub architecture: String,
    pub device_model: String,
    pub serial_number: String,
    pub platform_fingerprint: String,
}

/// Security posture booleans the server uses for policy decisions.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureChecks {
    pub disk_encrypted: bool,
    pub firewall_enabled: bool,
    pub tpm_available: bool,
    pub windows_antivirus_enabled: bool,
}

pub fn gather_fingerprint_info() -> Fingerprint {
    let (os_version, kernel_version) = windows_version();
    let (device_model, serial_number) = model_and_serial();

    Fingerprint {
        username: whoami::username(),
        hostname: whoami::fallible::hostname().unwrap_or_default(),
        platform: "windows".to_string(),
        os_version,
        kernel_version,
        architecture: version::arch().to_string(),
        device_model,
        serial_number,
        platform_fingerprint: compute_platform_fingerprint(),
    }
}

/// All four checks shell out to PowerShell; run them concurrently.
pub async fn gather_posture_checks() -> PostureChecks {
    let (disk_encrypted, firewall_enabled, tpm_available, windows_antivirus_enabled) = tokio::join!(
        disk_encrypted(),
        firewall_enabled(),
        tpm_available(),
        antivirus_active(),
    );

    PostureChecks {
        disk_encrypted,
        firewall_enabled,
        tpm_available,
        windows_antivirus_enabled,
    }
}

impl Fingerprint {
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        to_map(self)
    }
}

impl PostureChecks {
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        to_map(self)
    }
}

fn to_map<T: Serialize>(value: &T) -> HashMap<String, serde_json::Value> {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

fn windows_version() -> (String, String) {
    use windows::Wdk::System::SystemServices::RtlGetVersion;
    use windows::Win32::System::SystemInformation::OSVERSIONINFOW;

    let mut info = OSVERSIONINFOW {
        dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
        ..Default::default()
    };
    let _ = unsafe { RtlGetVersion(&mut info) };

    let version = format!(
        "Windows {} {} Build {}",
        info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber
    );
    (version.clone(), version)
}

fn model_and_serial() -> (String, String) {
    (
        read_registry_string(SYSTEM_INFORMATION_KEY, "SystemProductName").unwrap_or_default(),
        read_registry_string(SYSTEM_INFORMATION_KEY, "BIOSSerialNumber").unwrap_or_default(),
    )
}

fn read_registry_string(subkey: &str, value: &str) -> Option<String> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Registry::{RegGetValueW, HKEY_LOCAL_MACHINE, RRF_RT_REG_SZ};

    let subkey_wide: Vec<u16> = subkey.encode_utf16().chain(std::iter::once(0)).collect();
    let value_wide: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();

    let mut size: u32 = 0;
    let status = unsafe {
        RegGetValueW(
            HKEY_LOCAL_MACHINE,
            PCWSTR(subkey_wide.as_ptr()),
            PCWSTR(value_wide.as_ptr()),
            RRF_RT_REG_SZ,
            None,
            None,
            Some(&mut size),
        )
    };
    if status != ERROR_SUCCESS || size == 0 {
        return None;
    }

    let mut buffer = vec![0u8; size as usize];
    let status = unsafe {
        RegGetValueW(
            HKEY_LOCAL_MACHINE,
            PCWSTR(subkey_wide.as_ptr()),
            PCWSTR(value_wide.as_ptr()),
            RRF_RT_REG_SZ,
            None,
            Some(buffer.as_mut_ptr() as *mut _),
            Some(&mut size),
        )
    };
    if status != ERROR_SUCCESS {
        return None;
    }

    let wide: Vec<u16> = buffer
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&c| c != 0)
        .collect();
    Some(String::from_utf16_lossy(&wide))
}

fn compute_platform_fingerprint() -> String {
    fingerprint_from_parts(version::arch(), &cpu_fingerprint(), &dmi_fingerprint())
}

/// Deterministic over normalized inputs: empty sections are dropped before
/// joining, so a machine without DMI data still fingerprints stably.
fn fingerprint_from_parts(arch: &str, cpu: &str, dmi: &str) -> String {
    let raw = ["windows", arch, cpu, dmi]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn cpu_fingerprint() -> String {
    let mut parts = Vec::new();
    if let Some(v) = read_registry_string(CPU_KEY, "VendorIdentifier") {
        parts.push(format!("vendor={}", normalize(&v)));
    }
    if let Some(v) = read_registry_string(CPU_KEY, "ProcessorNameString") {
        parts.push(format!("model_name={}", normalize(&v)));
    }
    if let Some(v) = read_registry_string(CPU_KEY, "Identifier") {
        parts.push(format!("identifier={}", normalize(&v)));
    }
    parts.join("|")
}

fn dmi_fingerprint() -> String {
    let mut parts = Vec::new();
    let mut read = |name: &str, key: &str| {
        if let Some(v) = read_registry_string(SYSTEM_INFORMATION_KEY, name) {
            if !v.is_empty() {
                parts.push(format!("{key}={}", normalize(&v)));
            }
        }
    };
    read("SystemManufacturer", "sys_vendor");
    read("SystemProductName", "product_name");
    read("SystemSKU", "sku");
    read("BaseBoardManufacturer", "board_vendor");
    read("BaseBoardProduct", "board_name");
    parts.join("|")
}

fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

async fn powershell(command: &str) -> Option<String> {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let mut cmd = std::process::Command::new("powershell.exe");
    cmd.args(["-Command", command])
        .creation_flags(CREATE_NO_WINDOW);
    let output = tokio::process::Command::from(cmd).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn disk_encrypted() -> bool {
    let out = powershell(
        "Get-BitLockerVolume -MountPoint 'C:' | Select-Object -ExpandProperty VolumeStatus",
    )
    .await;
    match out {
        Some(status) => {
            debug!("posture: disk encryption status {status:?}");
            status == "FullyEncrypted" || status == "EncryptionInProgress"
        }
        None => false,
    }
}

async fn firewall_enabled() -> bool {
    let out = powershell("(Get-NetFirewallProfile | Where-Object { $_.Enabled -eq $true }).Count -gt 0")
        .await;
    matches!(out.as_deref(), Some("True"))
}

async fn tpm_available() -> bool {
    let out = powershell("Get-Tpm | Select-Object -ExpandProperty TpmPresent").await;
    matches!(out.as_deref(), Some("True"))
}

async fn antivirus_active() -> bool {
    let out = powershell(
        "Get-CimInstance -Namespace 'root/SecurityCenter2' -ClassName AntiVirusProduct | Select-Object -ExpandProperty productState",
    )
    .await;
    let Some(out) = out else { return false };
    out.lines().any(product_state_active)
}

/// Security Center productState: hex, zero-padded to six digits; characters
/// 2-3 are the realtime status. "10"/"11" mean an active product.
fn product_state_active(line: &str) -> bool {
    let line = line.trim();
    let Ok(state) = line.parse::<u64>() else {
        return false;
    };
    let hex = format!("{state:06X}");
    if hex.len() < 4 {
        return false;
    }
    matches!(&hex[2..4], "10" | "11")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize("  GenuineIntel  "), "genuineintel");
        assert_eq!(normalize("Intel(R)  Core(TM)\tCPU"), "intel(r) core(tm) cpu");
    }

    #[test]
    fn fingerprint_is_deterministic_and_normalization_invariant() {
        let a = fingerprint_from_parts(
            "amd64",
            &format!("vendor={}", normalize("GenuineIntel")),
            "sys_vendor=dell",
        );
        let b = fingerprint_from_parts(
            "amd64",
            &format!("vendor={}", normalize("  genuineintel ")),
            "sys_vendor=dell",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_skips_empty_sections() {
        let with_empty = fingerprint_from_parts("amd64", "", "");
        let expected = hex::encode(Sha256::digest(b"windows|amd64"));
        assert_eq!(with_empty, expected);
    }

    #[test]
    fn product_state_parses_hex_status_digits() {
        // 397568 -> 0x061100 -> digits "11" -> active
        assert!(product_state_active("397568"));
        // 401664 -> 0x062100 -> digits "21" -> passive
        assert!(!product_state_active("401664"));
        assert!(!product_state_active("garbage"));
        assert!(!product_state_active(""));
    }

    #[test]
    fn posture_map_uses_camel_case_keys() {
        let checks = PostureChecks {
            disk_encrypted: true,
            firewall_enabled: false,
            tpm_available: true,
            windows_antivirus_enabled: false,
        };
        let map = checks.to_map();
        assert_eq!(map.get("diskEncrypted"), Some(&serde_json::json!(true)));
        assert_eq!(map.get("firewallEnabled"), Some(&serde_json::json!(false)));
    }
}
