mod install;
mod launch;
mod service;

pub use install::{
    install_manager, install_tunnel, manager_service_name, query_manager_status,
    sanitize_service_name, start_manager_service, tunnel_service_name, uninstall_manager,
    uninstall_tunnel, InstallError, ManagerServiceStatus,
};
pub use launch::{request_ui_launch, request_ui_launch_with_retry};
pub use service::run;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::ipc::{IpcServer, ManagerRpc};
use crate::tunnel::{self, TunnelLifecycle};
use crate::updater::{self, RawToken, UpdateState};
use crate::version;

/// Any logged-on user may connect to request a UI launch.
pub const UI_LAUNCH_PIPE: &str = r"\\.\pipe\pangolin-manager-ui-launch";

const DEFAULT_TUNNEL_NAME: &str = "pangolin-tunnel";
const UNOFFICIAL_BUILD_ERROR: &str = "Build is not official, so updates are disabled";

/// Tunnel lifecycle backed by the Windows service database.
pub struct ScmTunnelLifecycle;

impl TunnelLifecycle for ScmTunnelLifecycle {
    fn install(&self, config_json: &str) -> Result<(), String> {
        install_tunnel(config_json).map_err(|err| err.to_string())
    }

    fn uninstall(&self, name: &str) -> Result<(), String> {
        uninstall_tunnel(name).map_err(|err| err.to_string())
    }
}

/// Shared manager state: the authoritative update state, the set of tunnel
/// services believed installed, and the quit signal. Doubles as the RPC
/// handler for every attached UI.
pub struct ManagerState {
    ipc: Arc<IpcServer>,
    lifecycle: Arc<dyn TunnelLifecycle>,
    /// Shared with progress tasks that outlive the RPC call that spawned
    /// them.
    update_state: Arc<Mutex<UpdateState>>,
    tunnel_state: Mutex<tunnel::State>,
    active_tunnels: Mutex<HashSet<String>>,
    current_tunnel: Mutex<Option<String>>,
    have_quit: AtomicBool,
    quit_tx: mpsc::Sender<()>,
}

impl ManagerState {
    pub fn new(
        ipc: Arc<IpcServer>,
        lifecycle: Arc<dyn TunnelLifecycle>,
        quit_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ipc,
            lifecycle,
            update_state: Arc::new(Mutex::new(UpdateState::Idle)),
            tunnel_state: Mutex::new(tunnel::State::Stopped),
            active_tunnels: Mutex::new(HashSet::new()),
            current_tunnel: Mutex::new(None),
            have_quit: AtomicBool::new(false),
            quit_tx,
        })
    }

    pub fn set_update_state(&self, state: UpdateState) {
        *self.update_state.lock().unwrap() = state;
    }

    pub fn current_update_state(&self) -> UpdateState {
        *self.update_state.lock().unwrap()
    }

    pub fn tunnel_state(&self) -> tunnel::State {
        *self.tunnel_state.lock().unwrap()
    }

    pub fn active_tunnels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .active_tunnels
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    async fn publish_tunnel_state(&self, state: tunnel::State) {
        *self.tunnel_state.lock().unwrap() = state;
        self.ipc.notify_tunnel_state_change(state).await;
    }

    async fn install(&self, config_json: String) -> Result<(), String> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.install(&config_json))
            .await
            .map_err(|err| err.to_string())?
    }

    async fn uninstall(&self, name: String) -> Result<(), String> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.uninstall(&name))
            .await
            .map_err(|err| err.to_string())?
    }
}

#[async_trait]
impl ManagerRpc for ManagerState {
    async fn quit(&self, stop_tunnels: bool) -> (bool, String) {
        if self
            .have_quit
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return (true, String::new());
        }

        if stop_tunnels {
            info!("quit requested with stop_tunnels, stopping all tunnels");
            for name in self.active_tunnels() {
                info!("stopping tunnel {name}");
                if let Err(err) = self.uninstall(name.clone()).await {
                    error!("failed to stop tunnel {name}: {err}");
                }
            }
            self.active_tunnels.lock().unwrap().clear();
        }

        let _ = self.quit_tx.send(()).await;
        (false, String::new())
    }

    async fn update_state(&self) -> UpdateState {
        self.current_update_state()
    }

    async fn update(&self, elevated_token: RawToken) -> (UpdateState, String) {
        if !version::is_official_build() {
            self.set_update_state(UpdateState::DisabledUnofficialBuild);
            return (
                UpdateState::DisabledUnofficialBuild,
                UNOFFICIAL_BUILD_ERROR.to_string(),
            );
        }

        self.set_update_state(UpdateState::DownloadInProgress);
        let mut progress = updater::download_verify_and_execute(elevated_token);

        let ipc = self.ipc.clone();
        let state = self.update_state.clone();
        tokio::spawn(async move {
            while let Some(dp) = progress.recv().await {
                let failed = dp.error.is_some();
                let complete = dp.complete;
                ipc.notify_update_progress(&dp).await;
                if failed {
                    // The candidate is still out there; the UI may retry.
                    *state.lock().unwrap() = UpdateState::FoundUpdate;
                    return;
                }
                if complete {
                    *state.lock().unwrap() = UpdateState::Idle;
                    return;
                }
            }
        });

        (UpdateState::DownloadInProgress, String::new())
    }

    async fn start_tunnel(&self, config: tunnel::Config) -> String {
        info!("start tunnel requested: {}", config.name);
        self.publish_tunnel_state(tunnel::State::Registering).await;

        let config_json = match config.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("failed to encode tunnel config: {err}");
                self.publish_tunnel_state(tunnel::State::Stopped).await;
                return err;
            }
        };

        if let Err(err) = self.install(config_json).await {
            error!("failed to install tunnel service: {err}");
            self.publish_tunnel_state(tunnel::State::Stopped).await;
            return err;
        }

        self.active_tunnels
            .lock()
            .unwrap()
            .insert(config.name.clone());
        *self.current_tunnel.lock().unwrap() = Some(config.name);
        String::new()
    }

    async fn stop_tunnel(&self) -> String {
        info!("stop tunnel requested");
        self.publish_tunnel_state(tunnel::State::Stopping).await;

        let name = self
            .current_tunnel
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| DEFAULT_TUNNEL_NAME.to_string());

        let result = self.uninstall(name.clone()).await;
        if let Err(err) = &result {
            error!("failed to uninstall tunnel service: {err}");
        }

        self.active_tunnels.lock().unwrap().remove(&name);
        *self.current_tunnel.lock().unwrap() = None;
        self.publish_tunnel_state(tunnel::State::Stopped).await;

        result.err().unwrap_or_default()
    }

    async fn switch_org(&self, org_id: String) -> String {
        if org_id.is_empty() {
            return "org id cannot be empty".to_string();
        }
        info!("switching worker organization to {org_id}");
        match tunnel::switch_worker_org(&org_id).await {
            Ok(()) => String::new(),
            Err(err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Notification, Request, Response};
    use crate::ipc::{read_frame, write_frame};

    #[derive(Default)]
    struct RecordingLifecycle {
        installs: Mutex<Vec<String>>,
        uninstalls: Mutex<Vec<String>>,
        fail_install: bool,
    }

    impl TunnelLifecycle for RecordingLifecycle {
        fn install(&self, config_json: &str) -> Result<(), String> {
            if self.fail_install {
                return Err("install failed".to_string());
            }
            self.installs.lock().unwrap().push(config_json.to_string());
            Ok(())
        }

        fn uninstall(&self, name: &str) -> Result<(), String> {
            self.uninstalls.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn test_config(name: &str) -> tunnel::Config {
        tunnel::Config {
            name: name.to_string(),
            endpoint: "https://app.example.net".to_string(),
            id: "olm-1".to_string(),
            secret: "s".to_string(),
            mtu: 1280,
            dns: "9.9.9.9".to_string(),
            holepunch: true,
            ping_interval_seconds: 5,
            ping_timeout_seconds: 5,
            user_token: "T1".to_string(),
            org_id: "o1".to_string(),
            interface_name: "Pangolin".to_string(),
            upstream_dns: vec!["9.9.9.9:53".to_string()],
            override_dns: true,
            tunnel_dns: false,
        }
    }

    struct Fixture {
        state: Arc<ManagerState>,
        lifecycle: Arc<RecordingLifecycle>,
        quit_rx: mpsc::Receiver<()>,
        ipc: Arc<IpcServer>,
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingLifecycle::default())
    }

    fn fixture_with(lifecycle: RecordingLifecycle) -> Fixture {
        let ipc = IpcServer::new();
        let lifecycle = Arc::new(lifecycle);
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let state = ManagerState::new(ipc.clone(), lifecycle.clone(), quit_tx);
        Fixture {
            state,
            lifecycle,
            quit_rx,
            ipc,
        }
    }

    #[tokio::test]
    async fn start_then_stop_round_trips_tunnel_lifecycle() {
        let fx = fixture();

        let err = fx.state.start_tunnel(test_config("olm")).await;
        assert_eq!(err, "");
        assert_eq!(fx.state.active_tunnels(), vec!["olm".to_string()]);
        assert_eq!(fx.state.tunnel_state(), tunnel::State::Registering);
        assert_eq!(fx.lifecycle.installs.lock().unwrap().len(), 1);

        let err = fx.state.stop_tunnel().await;
        assert_eq!(err, "");
        assert!(fx.state.active_tunnels().is_empty());
        assert_eq!(fx.state.tunnel_state(), tunnel::State::Stopped);
        assert_eq!(
            *fx.lifecycle.uninstalls.lock().unwrap(),
            vec!["olm".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_install_rolls_back_to_stopped() {
        let fx = fixture_with(RecordingLifecycle {
            fail_install: true,
            ..RecordingLifecycle::default()
        });

        let err = fx.state.start_tunnel(test_config("olm")).await;
        assert_eq!(err, "install failed");
        assert!(fx.state.active_tunnels().is_empty());
        assert_eq!(fx.state.tunnel_state(), tunnel::State::Stopped);
    }

    #[tokio::test]
    async fn quit_stops_active_tunnels_once() {
        let mut fx = fixture();
        fx.state.start_tunnel(test_config("olm")).await;

        let (already, err) = fx.state.quit(true).await;
        assert!(!already);
        assert_eq!(err, "");
        assert_eq!(
            *fx.lifecycle.uninstalls.lock().unwrap(),
            vec!["olm".to_string()]
        );
        assert!(fx.quit_rx.recv().await.is_some());

        // Second quit short-circuits.
        let (already, _) = fx.state.quit(true).await;
        assert!(already);
        assert_eq!(fx.lifecycle.uninstalls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_changes_reach_attached_uis() {
        let fx = fixture();

        let (_req_tx, req_rx) = tokio::io::duplex(4096);
        let (resp_tx, _resp_rx) = tokio::io::duplex(4096);
        let (events_tx, mut events_rx) = tokio::io::duplex(4096);
        fx.ipc.attach(fx.state.clone(), req_rx, resp_tx, events_tx, 0);

        fx.state.start_tunnel(test_config("olm")).await;

        let event: Notification = read_frame(&mut events_rx).await.unwrap();
        assert_eq!(
            event,
            Notification::TunnelStateChange {
                state: tunnel::State::Registering
            }
        );
    }

    #[tokio::test]
    async fn full_rpc_flow_over_pipes() {
        let fx = fixture();

        let (mut req_tx, req_rx) = tokio::io::duplex(4096);
        let (resp_tx, mut resp_rx) = tokio::io::duplex(4096);
        let (events_tx, _events_rx) = tokio::io::duplex(4096);
        fx.ipc.attach(fx.state.clone(), req_rx, resp_tx, events_tx, 3);

        write_frame(
            &mut req_tx,
            &Request::StartTunnel {
                config: test_config("olm"),
            },
        )
        .await
        .unwrap();
        let response: Response = read_frame(&mut resp_rx).await.unwrap();
        assert_eq!(
            response,
            Response::StartTunnel { err: String::new() }
        );

        write_frame(&mut req_tx, &Request::UpdateState).await.unwrap();
        let response: Response = read_frame(&mut resp_rx).await.unwrap();
        assert_eq!(
            response,
            Response::UpdateState {
                state: UpdateState::Idle
            }
        );
    }
}
