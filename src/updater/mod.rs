mod downloader;
mod manifest;
mod msi;
mod versions;

pub use downloader::{check_for_update, download_verify_and_execute, DownloadProgress};
pub use manifest::UpdateCandidate;
pub use msi::RawToken;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// Ed25519 release key, signify-framed: 10 bytes of keyid ahead of the
/// 32-byte public key, base64 as a whole.
pub(crate) const RELEASE_PUBLIC_KEY_BASE64: &str =
    "RWQWK7GF/RR35J1NETi57nk9cbngz7sBDsCrC3yce2CcKfACMpIcpvKV";
pub(crate) const UPDATE_SERVER: &str = "https://static.pangolin.net";
pub(crate) const LATEST_VERSION_PATH: &str = "/windows-client/latest.sig";
pub(crate) const MSI_ARCH_PREFIX: &str = "pangolin-";
pub(crate) const MSI_SUFFIX: &str = ".msi";
pub(crate) const MANIFEST_LIMIT: usize = 512 * 1024;
pub(crate) const DOWNLOAD_LIMIT: u64 = 100 * 1024 * 1024;

const INITIAL_CHECK_DELAY: Duration = Duration::from_secs(30);

/// The manager owns the single authoritative value; UIs only read it over
/// IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    Idle,
    Checking,
    FoundUpdate,
    NoUpdate,
    DisabledUnofficialBuild,
    DownloadInProgress,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("{0}")]
    ManifestFormat(&'static str),
    #[error("Signature is invalid")]
    BadSignature,
    #[error("Version length is too long")]
    VersionTooLong,
    #[error("{0}")]
    Version(&'static str),
    #[error("The downloaded update has the wrong hash")]
    HashMismatch,
    #[error("The downloaded update exceeds the size limit")]
    TooLarge,
    #[error("An update is already in progress")]
    AlreadyInProgress,
    #[error("No update was found")]
    NoUpdate,
    #[error("download location not specified in manifest")]
    MissingDownloadLocation,
    #[error("msiexec exited with code {0}")]
    MsiExit(u32),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Io(String),
}

/// Periodic update discovery. Waits ~30 s after service start, then checks on
/// the given interval forever; network failures are logged and retried at the
/// next tick. The callback fires once per discovered candidate.
pub async fn run_background_checker<F>(interval: Duration, on_found: F)
where
    F: Fn(UpdateCandidate) + Send + Sync + 'static,
{
    tokio::time::sleep(INITIAL_CHECK_DELAY).await;
    loop {
        info!("background update check: checking for updates");
        match check_for_update().await {
            Ok(Some(update)) => {
                info!("background update check: update found: {}", update.name);
                on_found(update);
            }
            Ok(None) => info!("background update check: no update available"),
            Err(err) => error!("background update check failed: {err}"),
        }
        tokio::time::sleep(interval).await;
    }
}
