use std::sync::atomic::{AtomicBool, Ordering};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::manifest::{read_file_list, UpdateCandidate};
use super::msi::{run_msi, MsiTempFile, RawToken};
use super::versions::find_candidate;
use super::{UpdateError, DOWNLOAD_LIMIT, LATEST_VERSION_PATH, MANIFEST_LIMIT, UPDATE_SERVER};
use crate::config;
use crate::version;

type Blake2b256 = Blake2b<U32>;

/// Progress frames streamed to the UI while an update runs. A frame with
/// `error` set or `complete` true is terminal.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    pub activity: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub error: Option<String>,
    pub complete: bool,
}

impl DownloadProgress {
    fn activity(activity: &str) -> Self {
        Self {
            activity: activity.to_string(),
            ..Self::default()
        }
    }

    fn failure(err: &UpdateError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

static UPDATE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

struct InProgressGuard;

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        UPDATE_IN_PROGRESS.store(false, Ordering::SeqCst);
    }
}

fn update_client() -> Result<reqwest::Client, UpdateError> {
    reqwest::Client::builder()
        .user_agent(version::user_agent())
        .build()
        .map_err(|err| UpdateError::Network(err.to_string()))
}

/// Fetch and verify the signed manifest, then pick the first newer installer
/// for this architecture.
pub async fn check_for_update() -> Result<Option<UpdateCandidate>, UpdateError> {
    let url = format!("{UPDATE_SERVER}{LATEST_VERSION_PATH}");
    info!("fetching update manifest from {url}");
    let response = update_client()?
        .get(&url)
        .send()
        .await
        .map_err(|err| UpdateError::Network(err.to_string()))?;
    if !response.status().is_success() {
        return Err(UpdateError::Network(format!(
            "manifest fetch returned {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| UpdateError::Network(err.to_string()))?;
    let body = &body[..body.len().min(MANIFEST_LIMIT)];

    let entries = read_file_list(body)?;
    find_candidate(&entries)
}

/// Download, verify, and install the newest candidate, reporting progress on
/// the returned channel. The flow runs under the supplied elevated token;
/// exactly one update can be in flight at a time.
pub fn download_verify_and_execute(user_token: RawToken) -> mpsc::Receiver<DownloadProgress> {
    let (tx, rx) = mpsc::channel(128);

    if UPDATE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let _ = tx.try_send(DownloadProgress::failure(&UpdateError::AlreadyInProgress));
        return rx;
    }

    tokio::spawn(async move {
        let _guard = InProgressGuard;
        if let Err(err) = run_update(user_token, &tx).await {
            error!("update failed: {err}");
            let _ = tx.send(DownloadProgress::failure(&err)).await;
        }
    });

    rx
}

async fn run_update(
    user_token: RawToken,
    progress: &mpsc::Sender<DownloadProgress>,
) -> Result<(), UpdateError> {
    let send = |dp: DownloadProgress| {
        let progress = progress.clone();
        async move {
            let _ = progress.send(dp).await;
        }
    };

    send(DownloadProgress::activity("Checking for update")).await;
    let update = check_for_update().await?.ok_or(UpdateError::NoUpdate)?;
    info!("update found: {}", update.name);

    send(DownloadProgress::activity("Creating temporary file")).await;
    let mut temp = MsiTempFile::create()?;

    if update.download_location.is_empty() {
        return Err(UpdateError::MissingDownloadLocation);
    }
    let download_url = if update.download_location.starts_with("http://")
        || update.download_location.starts_with("https://")
    {
        update.download_location.clone()
    } else if update.download_location.starts_with('/') {
        format!("{UPDATE_SERVER}{}", update.download_location)
    } else {
        format!("{UPDATE_SERVER}/{}", update.download_location)
    };

    info!("downloading update from {download_url}");
    let mut dp = DownloadProgress::activity("Downloading update");
    send(dp.clone()).await;

    let response = update_client()?
        .get(&download_url)
        .send()
        .await
        .map_err(|err| UpdateError::Network(err.to_string()))?;
    if !response.status().is_success() {
        return Err(UpdateError::Network(format!(
            "download returned {}",
            response.status()
        )));
    }
    if let Some(length) = response.content_length() {
        dp.bytes_total = length;
        send(dp.clone()).await;
    }

    let std_file = temp
        .take_file()
        .ok_or_else(|| UpdateError::Io("temp file handle missing".to_string()))?;
    let mut file = tokio::fs::File::from_std(std_file);
    let mut hasher = Blake2b256::new();
    let mut response = response;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| UpdateError::Network(err.to_string()))?
    {
        dp.bytes_downloaded += chunk.len() as u64;
        if dp.bytes_downloaded > DOWNLOAD_LIMIT {
            return Err(UpdateError::TooLarge);
        }
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|err| UpdateError::Io(err.to_string()))?;
        send(dp.clone()).await;
    }
    file.flush()
        .await
        .map_err(|err| UpdateError::Io(err.to_string()))?;
    temp.put_back(file.into_std().await);

    let calculated: [u8; 32] = hasher.finalize().into();
    if !bool::from(calculated.ct_eq(&update.hash)) {
        error!("hash verification failed for {}", update.name);
        return Err(UpdateError::HashMismatch);
    }
    info!("hash verification passed");

    send(DownloadProgress::activity("Installing update")).await;

    // The manager looks for this flag at startup to bring the UI back after
    // msiexec has replaced and restarted the service.
    let flag_path = config::restart_ui_flag_path();
    if let Err(err) = std::fs::create_dir_all(config::program_data_dir()) {
        error!("failed to create ProgramData dir for restart flag: {err}");
    } else if let Err(err) = std::fs::write(&flag_path, b"") {
        error!("failed to write restart-ui flag: {err}");
    }

    let msi_path = temp.exclusive_path().to_path_buf();
    let result =
        tokio::task::spawn_blocking(move || run_msi(&msi_path, user_token))
            .await
            .map_err(|err| UpdateError::Io(err.to_string()))?;
    if let Err(err) = result {
        if let Err(remove_err) = std::fs::remove_file(&flag_path) {
            if remove_err.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove restart-ui flag after MSI failure: {remove_err}");
            }
        }
        return Err(err);
    }
    temp.delete();

    info!("update process complete");
    let _ = progress
        .send(DownloadProgress {
            complete: true,
            ..DownloadProgress::default()
        })
        .await;
    Ok(())
}
