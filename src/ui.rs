//! The per-session UI process: attaches to the manager over the three
//! inherited pipe handles and assembles the application context the tray
//! shell renders from. The tray itself (menus, dialogs, log viewer) is a
//! separate layer built on [`AppContext`].

use std::os::windows::io::{FromRawHandle, RawHandle};
use std::sync::Arc;

use tracing::{error, info};

use crate::api::{Api, ApiClient};
use crate::auth::AuthManager;
use crate::config::{self, AccountStore, ConfigStore};
use crate::ipc::{IpcClient, Notification};
use crate::secrets::{KeyringSecretStore, SecretStore};
use crate::tunnel::{PipeStatusSource, TunnelManager};

/// Everything the tray needs, wired once at startup. No globals: widgets
/// receive this context and subscribe to its channels.
pub struct AppContext {
    pub api: Arc<dyn Api>,
    pub accounts: Arc<AccountStore>,
    pub config: Arc<ConfigStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub auth: Arc<AuthManager>,
    pub ipc: Arc<IpcClient>,
    pub tunnel: Arc<TunnelManager>,
}

impl AppContext {
    fn assemble(ipc: Arc<IpcClient>) -> Self {
        let accounts = Arc::new(AccountStore::new());
        let config = Arc::new(ConfigStore::new());
        let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new());

        let hostname = accounts
            .active_account()
            .map(|account| account.hostname)
            .unwrap_or_else(|| config::DEFAULT_HOSTNAME.to_string());
        let api: Arc<dyn Api> = Arc::new(ApiClient::new(&hostname, ""));

        let auth = AuthManager::new(api.clone(), accounts.clone(), secrets.clone());
        let tunnel = TunnelManager::new(
            ipc.clone(),
            auth.clone(),
            config.clone(),
            accounts.clone(),
            secrets.clone(),
            Arc::new(PipeStatusSource),
        );

        Self {
            api,
            accounts,
            config,
            secrets,
            auth,
            ipc,
            tunnel,
        }
    }
}

/// Entry point for `/ui <reader> <writer> <events>`: the three argv values
/// are inherited pipe handles.
pub fn run(reader_handle: u64, writer_handle: u64, events_handle: u64) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("failed to build UI runtime: {err}"))?;
    runtime.block_on(run_inner(reader_handle, writer_handle, events_handle))
}

async fn run_inner(
    reader_handle: u64,
    writer_handle: u64,
    events_handle: u64,
) -> Result<(), String> {
    let reader = file_from_handle(reader_handle);
    let writer = file_from_handle(writer_handle);
    let events = file_from_handle(events_handle);

    let ipc = IpcClient::new(
        tokio::fs::File::from_std(reader),
        tokio::fs::File::from_std(writer),
        tokio::fs::File::from_std(events),
    );
    info!("connected to manager service via IPC");

    let context = AppContext::assemble(ipc);
    if let Err(err) = context.auth.initialize().await {
        error!("failed to initialize auth manager: {err}");
    }

    // The tray shell runs on top of the context; this loop keeps the
    // process alive and tears it down when the manager goes away.
    let mut notifications = context.ipc.subscribe();
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(Notification::ManagerStopping) => {
                    info!("manager is stopping, exiting UI");
                    return Ok(());
                }
                Ok(other) => {
                    // Update and tunnel events are consumed by the tray's
                    // subscribers; nothing to do at the process level.
                    tracing::debug!("notification: {other:?}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("event stream closed, exiting UI");
                    return Ok(());
                }
            },
            _ = context.ipc.wait_closed() => {
                info!("manager connection lost, exiting UI");
                return Ok(());
            }
        }
    }
}

fn file_from_handle(handle: u64) -> std::fs::File {
    unsafe { std::fs::File::from_raw_handle(handle as usize as RawHandle) }
}
