use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{pipe_http, Config, State, TunnelControl, OLM_PIPE_PATH};
use crate::auth::{AuthError, AuthManager};
use crate::config::{AccountStore, ConfigStore};
use crate::secrets::SecretStore;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_MTU: u32 = 1280;
const DEFAULT_PING_INTERVAL_SECONDS: u64 = 5;
const DEFAULT_PING_TIMEOUT_SECONDS: u64 = 5;
const INTERFACE_NAME: &str = "Pangolin";
const TUNNEL_NAME: &str = "olm";

/// User-facing connection failure; the tray shows title and message
/// verbatim.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConnectionError {
    pub title: String,
    pub message: String,
    #[source]
    pub cause: Option<AuthError>,
}

impl ConnectionError {
    fn new(title: &str, message: String, cause: Option<AuthError>) -> Self {
        Self {
            title: title.to_string(),
            message,
            cause,
        }
    }
}

/// Status document served by the worker's control pipe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OlmStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "orgId", default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub peers: Option<serde_json::Value>,
    #[serde(rename = "networkSettings", default)]
    pub network_settings: Option<serde_json::Value>,
}

/// Where the manager reads tunnel liveness from; production is the worker's
/// named-pipe HTTP endpoint.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self) -> Result<OlmStatus, String>;
}

pub struct PipeStatusSource;

#[async_trait]
impl StatusSource for PipeStatusSource {
    async fn status(&self) -> Result<OlmStatus, String> {
        pipe_http::get_json(OLM_PIPE_PATH, "/status").await
    }
}

/// The slice of auth state the tunnel manager needs; implemented by
/// [`AuthManager`], mocked in tests.
#[async_trait]
pub trait AuthAccess: Send + Sync {
    fn current_org_id(&self) -> Option<String>;
    fn current_user_id(&self) -> Option<String>;
    async fn check_org_access(&self, org_id: &str) -> Result<bool, AuthError>;
    async fn ensure_olm_credentials(&self, user_id: &str) -> Result<(), AuthError>;
}

#[async_trait]
impl AuthAccess for AuthManager {
    fn current_org_id(&self) -> Option<String> {
        self.current_org().map(|org| org.id)
    }

    fn current_user_id(&self) -> Option<String> {
        AuthManager::current_user_id(self)
    }

    async fn check_org_access(&self, org_id: &str) -> Result<bool, AuthError> {
        AuthManager::check_org_access(self, org_id).await
    }

    async fn ensure_olm_credentials(&self, user_id: &str) -> Result<(), AuthError> {
        AuthManager::ensure_olm_credentials(self, user_id).await
    }
}

type StateCallback = Box<dyn Fn(State) + Send + Sync>;

struct Inner {
    current_state: State,
    is_connected: bool,
    callback: Option<Arc<StateCallback>>,
    /// Dropping the sender cancels the running poll task.
    poll_cancel: Option<watch::Sender<bool>>,
}

/// Bridge between tray actions and the tunnel lifecycle: composes the start
/// configuration, drives connect/disconnect over IPC, and merges IPC state
/// events with 1 Hz status polling into a single ordered view.
pub struct TunnelManager {
    inner: Mutex<Inner>,
    control: Arc<dyn TunnelControl>,
    auth: Arc<dyn AuthAccess>,
    config: Arc<ConfigStore>,
    accounts: Arc<AccountStore>,
    secrets: Arc<dyn SecretStore>,
    status: Arc<dyn StatusSource>,
}

impl TunnelManager {
    pub fn new(
        control: Arc<dyn TunnelControl>,
        auth: Arc<dyn AuthAccess>,
        config: Arc<ConfigStore>,
        accounts: Arc<AccountStore>,
        secrets: Arc<dyn SecretStore>,
        status: Arc<dyn StatusSource>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            inner: Mutex::new(Inner {
                current_state: State::Stopped,
                is_connected: false,
                callback: None,
                poll_cancel: None,
            }),
            control,
            auth,
            config,
            accounts,
            secrets,
            status,
        });

        // Manager-published transitions arrive here; polling-derived ones
        // come from the poll task. Both funnel through apply_state.
        let events = Arc::downgrade(&manager);
        let mut state_rx = manager.control.subscribe_state();
        tokio::spawn(async move {
            loop {
                let state = match state_rx.recv().await {
                    Ok(state) => state,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Some(manager) = events.upgrade() else { return };
                manager.apply_state(state, false);
            }
        });

        manager
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().current_state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().is_connected
    }

    /// The tray registers exactly one callback; it fires on every IPC-driven
    /// transition and on polling transitions that change the state.
    pub fn register_state_callback(&self, callback: impl Fn(State) + Send + Sync + 'static) {
        self.inner.lock().unwrap().callback = Some(Arc::new(Box::new(callback)));
    }

    fn apply_state(&self, state: State, only_on_change: bool) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            let changed = inner.current_state != state;
            inner.current_state = state;
            inner.is_connected = state == State::Running;
            if only_on_change && !changed {
                None
            } else {
                inner.callback.clone()
            }
        };
        if let Some(callback) = callback {
            callback(state);
        }
    }

    /// Start the tunnel. Rejected while a tunnel is active, when no org is
    /// selected, when access is denied, or when credentials cannot be
    /// assembled.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        match self.state() {
            State::Running => {
                info!("tunnel is already running");
                return Err(ConnectionError::new(
                    "Tunnel Already Running",
                    "The tunnel is already running. Please disconnect it before connecting again."
                        .to_string(),
                    None,
                ));
            }
            State::Starting | State::Registering | State::Registered => {
                info!("tunnel is already starting");
                return Err(ConnectionError::new(
                    "Tunnel Already Starting",
                    "The tunnel is already starting. Please wait for it to complete.".to_string(),
                    None,
                ));
            }
            _ => {}
        }

        let Some(org_id) = self.auth.current_org_id() else {
            error!("no organization selected, aborting connection");
            return Err(ConnectionError::new(
                "No Organization Selected",
                "Please select an organization before connecting.".to_string(),
                None,
            ));
        };

        match self.auth.check_org_access(&org_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ConnectionError::new(
                    "Access Denied",
                    "You do not have access to the selected organization.".to_string(),
                    None,
                ));
            }
            Err(err) => {
                error!("org access check failed: {err}");
                return Err(ConnectionError::new(
                    "Access Check Failed",
                    format!("Failed to verify access to the organization: {err}"),
                    Some(err),
                ));
            }
        }

        let Some(user_id) = self.auth.current_user_id() else {
            return Err(ConnectionError::new(
                "Authentication Error",
                "No user ID available. Please log in again.".to_string(),
                None,
            ));
        };
        if let Err(err) = self.auth.ensure_olm_credentials(&user_id).await {
            error!("failed to ensure OLM credentials: {err}");
            return Err(ConnectionError::new(
                "Device Credentials Error",
                format!("Failed to set up device credentials: {err}"),
                Some(err),
            ));
        }

        let config = self.build_config(&user_id, &org_id)?;
        info!(
            "connecting tunnel: name={}, endpoint={}",
            config.name, config.endpoint
        );

        if let Err(err) = self.control.start_tunnel(config).await {
            error!("failed to start tunnel: {err}");
            return Err(ConnectionError::new(
                "Connection Failed",
                format!("Failed to start the tunnel: {err}"),
                None,
            ));
        }

        self.start_status_polling();
        Ok(())
    }

    /// Stop the tunnel; a no-op when already stopped or stopping.
    pub async fn disconnect(&self) -> Result<(), String> {
        match self.state() {
            State::Stopped => {
                info!("tunnel is already stopped");
                return Ok(());
            }
            State::Stopping => {
                info!("tunnel is already stopping");
                return Ok(());
            }
            _ => {}
        }

        info!("disconnecting tunnel");
        self.control.stop_tunnel().await?;
        self.stop_status_polling();
        Ok(())
    }

    /// Move the running tunnel to another organization.
    pub async fn switch_org(&self, org_id: &str) -> Result<(), String> {
        if self.state() != State::Running {
            info!("tunnel is not running, cannot switch organization");
            return Err("tunnel is not running".to_string());
        }
        if org_id.is_empty() {
            return Err("org id cannot be empty".to_string());
        }
        info!("switching tunnel organization to {org_id}");
        self.control.switch_org(org_id).await
    }

    fn build_config(&self, user_id: &str, org_id: &str) -> Result<Config, ConnectionError> {
        let account = self.accounts.active_account().ok_or_else(|| {
            ConnectionError::new(
                "Authentication Error",
                "No active account. Please log in again.".to_string(),
                None,
            )
        })?;

        let user_token = self
            .secrets
            .session_token(user_id)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ConnectionError::new(
                    "Authentication Error",
                    "Session token not found. Please log in again.".to_string(),
                    None,
                )
            })?;

        let (olm_id, olm_secret) = self.secrets.olm_credentials(user_id).ok_or_else(|| {
            ConnectionError::new(
                "Device Credentials Error",
                "Device credentials not found. Please log in again.".to_string(),
                None,
            )
        })?;

        let primary_dns = self.config.primary_dns();
        let secondary_dns = self.config.secondary_dns();
        let mut upstream_dns = vec![format!("{primary_dns}:53")];
        if !secondary_dns.is_empty() {
            upstream_dns.push(format!("{secondary_dns}:53"));
        }

        Ok(Config {
            name: TUNNEL_NAME.to_string(),
            endpoint: account.hostname,
            id: olm_id,
            secret: olm_secret,
            mtu: DEFAULT_MTU,
            dns: primary_dns,
            holepunch: true,
            ping_interval_seconds: DEFAULT_PING_INTERVAL_SECONDS,
            ping_timeout_seconds: DEFAULT_PING_TIMEOUT_SECONDS,
            user_token,
            org_id: org_id.to_string(),
            interface_name: INTERFACE_NAME.to_string(),
            upstream_dns,
            override_dns: self.config.dns_override(),
            tunnel_dns: self.config.dns_tunnel(),
        })
    }

    /// Poll the worker's status endpoint at 1 Hz and fold the result into
    /// the state view. Starting a new poll cancels any running one.
    pub fn start_status_polling(self: &Arc<Self>) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock().unwrap();
            // Dropping the previous sender ends its task.
            inner.poll_cancel = Some(cancel_tx);
        }

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            debug!("status polling stopped");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { return };
                        let status = match manager.status.status().await {
                            Ok(status) => status,
                            Err(err) => {
                                debug!("status poll failed: {err}");
                                continue;
                            }
                        };
                        if status.terminated {
                            info!("worker reports terminated, disconnecting tunnel");
                            if let Err(err) = manager.disconnect().await {
                                error!("failed to disconnect after termination: {err}");
                            }
                            continue;
                        }
                        let new_state = if status.connected {
                            State::Running
                        } else if status.registered {
                            State::Registered
                        } else {
                            continue;
                        };
                        manager.apply_state(new_state, true);
                    }
                }
            }
        });
        info!("started tunnel status polling");
    }

    pub fn stop_status_polling(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.poll_cancel.take().is_some() {
            info!("stopped tunnel status polling");
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.inner.lock().unwrap().poll_cancel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Account;
    use crate::secrets::MemorySecretStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct MockControl {
        starts: Mutex<Vec<Config>>,
        stops: AtomicUsize,
        switches: Mutex<Vec<String>>,
        state_tx: broadcast::Sender<State>,
        start_error: Option<String>,
    }

    impl MockControl {
        fn new() -> Arc<Self> {
            let (state_tx, _) = broadcast::channel(32);
            Arc::new(Self {
                starts: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
                switches: Mutex::new(Vec::new()),
                state_tx,
                start_error: None,
            })
        }
    }

    #[async_trait]
    impl TunnelControl for MockControl {
        async fn start_tunnel(&self, config: Config) -> Result<(), String> {
            self.starts.lock().unwrap().push(config);
            match &self.start_error {
                Some(err) => Err(err.clone()),
                None => {
                    let _ = self.state_tx.send(State::Registering);
                    Ok(())
                }
            }
        }

        async fn stop_tunnel(&self) -> Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let _ = self.state_tx.send(State::Stopping);
            let _ = self.state_tx.send(State::Stopped);
            Ok(())
        }

        async fn switch_org(&self, org_id: &str) -> Result<(), String> {
            self.switches.lock().unwrap().push(org_id.to_string());
            Ok(())
        }

        fn subscribe_state(&self) -> broadcast::Receiver<State> {
            self.state_tx.subscribe()
        }
    }

    struct MockAuth {
        org_id: Option<String>,
        user_id: Option<String>,
        access: Result<bool, ()>,
    }

    #[async_trait]
    impl AuthAccess for MockAuth {
        fn current_org_id(&self) -> Option<String> {
            self.org_id.clone()
        }

        fn current_user_id(&self) -> Option<String> {
            self.user_id.clone()
        }

        async fn check_org_access(&self, _org_id: &str) -> Result<bool, AuthError> {
            match self.access {
                Ok(allowed) => Ok(allowed),
                Err(()) => Err(AuthError::Other("boom".to_string())),
            }
        }

        async fn ensure_olm_credentials(&self, _user_id: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    struct ScriptedStatus {
        responses: Mutex<Vec<Result<OlmStatus, String>>>,
    }

    #[async_trait]
    impl StatusSource for ScriptedStatus {
        async fn status(&self) -> Result<OlmStatus, String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }
    }

    struct Fixture {
        manager: Arc<TunnelManager>,
        control: Arc<MockControl>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(
        auth: MockAuth,
        status_responses: Vec<Result<OlmStatus, String>>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let accounts = Arc::new(AccountStore::with_path(dir.path().join("accounts.json")));
        accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                email: "a@b".to_string(),
                org_id: "o1".to_string(),
                username: String::new(),
                name: String::new(),
                hostname: "https://app.example.net".to_string(),
            })
            .unwrap();
        accounts.set_active_user("u1").unwrap();

        let config = Arc::new(ConfigStore::with_path(dir.path().join("pangolin.json")));
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.save_session_token("u1", "T1");
        secrets.save_olm_credentials("u1", "olm-1", "olm-secret");

        let control = MockControl::new();
        let status = Arc::new(ScriptedStatus {
            responses: Mutex::new(if status_responses.is_empty() {
                vec![Ok(OlmStatus::default())]
            } else {
                status_responses
            }),
        });

        let manager = TunnelManager::new(
            control.clone(),
            Arc::new(auth),
            config,
            accounts,
            secrets,
            status,
        );
        Fixture {
            manager,
            control,
            _dir: dir,
        }
    }

    fn allowed_auth() -> MockAuth {
        MockAuth {
            org_id: Some("o1".to_string()),
            user_id: Some("u1".to_string()),
            access: Ok(true),
        }
    }

    #[tokio::test]
    async fn connect_builds_expected_config() {
        let fx = fixture_with(allowed_auth(), Vec::new());
        assert!(fx.manager.config.set_primary_dns("1.1.1.1"));
        assert!(fx.manager.config.set_secondary_dns(""));

        fx.manager.connect().await.unwrap();

        let starts = fx.control.starts.lock().unwrap();
        assert_eq!(starts.len(), 1);
        let config = &starts[0];
        assert_eq!(config.name, "olm");
        assert_eq!(config.endpoint, "https://app.example.net");
        assert_eq!(config.id, "olm-1");
        assert_eq!(config.secret, "olm-secret");
        assert_eq!(config.user_token, "T1");
        assert_eq!(config.org_id, "o1");
        assert_eq!(config.dns, "1.1.1.1");
        assert_eq!(config.upstream_dns, vec!["1.1.1.1:53".to_string()]);
        assert_eq!(config.mtu, 1280);
        assert!(config.holepunch);
        assert_eq!(config.ping_interval_seconds, 5);
        assert_eq!(config.ping_timeout_seconds, 5);
        assert_eq!(config.interface_name, "Pangolin");
        assert!(config.override_dns);
        assert!(!config.tunnel_dns);
    }

    #[tokio::test]
    async fn connect_rejected_while_active() {
        let fx = fixture_with(allowed_auth(), Vec::new());
        fx.manager.apply_state(State::Running, false);
        let err = fx.manager.connect().await.unwrap_err();
        assert_eq!(err.title, "Tunnel Already Running");

        fx.manager.apply_state(State::Registering, false);
        let err = fx.manager.connect().await.unwrap_err();
        assert_eq!(err.title, "Tunnel Already Starting");
        assert!(fx.control.starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_requires_org_selection() {
        let fx = fixture_with(
            MockAuth {
                org_id: None,
                user_id: Some("u1".to_string()),
                access: Ok(true),
            },
            Vec::new(),
        );
        let err = fx.manager.connect().await.unwrap_err();
        assert_eq!(err.title, "No Organization Selected");
    }

    #[tokio::test]
    async fn connect_surfaces_access_denial() {
        let fx = fixture_with(
            MockAuth {
                org_id: Some("o1".to_string()),
                user_id: Some("u1".to_string()),
                access: Ok(false),
            },
            Vec::new(),
        );
        let err = fx.manager.connect().await.unwrap_err();
        assert_eq!(err.title, "Access Denied");
    }

    #[tokio::test]
    async fn disconnect_is_noop_when_stopped() {
        let fx = fixture_with(allowed_auth(), Vec::new());
        fx.manager.disconnect().await.unwrap();
        assert_eq!(fx.control.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn switch_org_requires_running_tunnel() {
        let fx = fixture_with(allowed_auth(), Vec::new());
        let err = fx.manager.switch_org("o2").await.unwrap_err();
        assert_eq!(err, "tunnel is not running");

        fx.manager.apply_state(State::Running, false);
        fx.manager.switch_org("o2").await.unwrap();
        assert_eq!(*fx.control.switches.lock().unwrap(), vec!["o2".to_string()]);
    }

    #[tokio::test]
    async fn ipc_state_events_drive_callback() {
        let fx = fixture_with(allowed_auth(), Vec::new());
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        fx.manager.register_state_callback(move |state| {
            let _ = seen_tx.send(state);
        });

        let _ = fx.control.state_tx.send(State::Registering);
        let _ = fx.control.state_tx.send(State::Running);

        assert_eq!(seen_rx.recv().await.unwrap(), State::Registering);
        assert_eq!(seen_rx.recv().await.unwrap(), State::Running);
        assert_eq!(fx.manager.state(), State::Running);
        assert!(fx.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_derives_states_and_reports_changes_once() {
        let fx = fixture_with(
            allowed_auth(),
            vec![
                Ok(OlmStatus {
                    registered: true,
                    ..OlmStatus::default()
                }),
                Ok(OlmStatus {
                    connected: true,
                    ..OlmStatus::default()
                }),
                Ok(OlmStatus {
                    connected: true,
                    ..OlmStatus::default()
                }),
            ],
        );
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        fx.manager.register_state_callback(move |state| {
            let _ = seen_tx.send(state);
        });

        fx.manager.start_status_polling();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(seen_rx.recv().await.unwrap(), State::Registered);
        assert_eq!(seen_rx.recv().await.unwrap(), State::Running);
        // The repeated connected status produced no further callback.
        assert!(seen_rx.try_recv().is_err());
        fx.manager.stop_status_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_status_triggers_disconnect() {
        let fx = fixture_with(
            allowed_auth(),
            vec![Ok(OlmStatus {
                terminated: true,
                ..OlmStatus::default()
            })],
        );
        fx.manager.apply_state(State::Running, false);

        fx.manager.start_status_polling();
        tokio::time::advance(Duration::from_millis(1100)).await;
        // Give the broadcast-driven transitions a chance to land.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(fx.control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fx.manager.state(), State::Stopped);
    }

    #[tokio::test]
    async fn start_failure_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = Arc::new(AccountStore::with_path(dir.path().join("accounts.json")));
        accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                hostname: "https://app.example.net".to_string(),
                ..Account::default()
            })
            .unwrap();
        accounts.set_active_user("u1").unwrap();
        let config = Arc::new(ConfigStore::with_path(dir.path().join("pangolin.json")));
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.save_session_token("u1", "T1");
        secrets.save_olm_credentials("u1", "olm-1", "olm-secret");

        let (state_tx, _) = broadcast::channel(32);
        let control = Arc::new(MockControl {
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
            state_tx,
            start_error: Some("interface creation failed".to_string()),
        });
        let status = Arc::new(ScriptedStatus {
            responses: Mutex::new(vec![Ok(OlmStatus::default())]),
        });
        let manager = TunnelManager::new(
            control,
            Arc::new(allowed_auth()),
            config,
            accounts,
            secrets,
            status,
        );

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.title, "Connection Failed");
        assert!(err.message.contains("interface creation failed"));
    }
}
