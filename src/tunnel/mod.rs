mod engine;
pub mod manager;
mod olm;
mod pipe_http;
pub mod service;

pub use engine::{EngineCallbacks, EngineConfig, OlmEngine};
pub use manager::{
    AuthAccess, ConnectionError, OlmStatus, PipeStatusSource, StatusSource, TunnelManager,
};
pub use olm::OlmLibrary;
pub use service::{EngineFactory, StatePublisher};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Control pipe the tunnel engine serves its local HTTP surface on.
pub const OLM_PIPE_PATH: &str = r"\\.\pipe\pangolin-olm";

/// Lifecycle of one tunnel across its worker service. `Error` is a sink for
/// start and initialization failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Registering,
    Registered,
    Running,
    Reconnecting,
    Stopping,
    Invalid,
    Error,
}

impl State {
    pub fn display_text(&self) -> &'static str {
        match self {
            State::Stopped => "Disconnected",
            State::Starting => "Connecting...",
            State::Registering => "Registering...",
            State::Registered => "Connecting...",
            State::Running => "Connected",
            State::Reconnecting => "Reconnecting...",
            State::Stopping => "Disconnecting...",
            State::Invalid => "Invalid",
            State::Error => "Error",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Registering => "registering",
            State::Registered => "registered",
            State::Running => "running",
            State::Reconnecting => "reconnecting",
            State::Stopping => "stopping",
            State::Invalid => "invalid",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot handed to the worker at start. Serialized to the
/// per-tunnel config file and across the IPC boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Also the basis of the Windows service name.
    pub name: String,
    pub endpoint: String,
    pub id: String,
    pub secret: String,
    pub mtu: u32,
    pub dns: String,
    pub holepunch: bool,
    #[serde(rename = "pingIntervalSeconds")]
    pub ping_interval_seconds: u64,
    #[serde(rename = "pingTimeoutSeconds")]
    pub ping_timeout_seconds: u64,
    #[serde(rename = "userToken")]
    pub user_token: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "interfaceName")]
    pub interface_name: String,
    #[serde(rename = "upstreamDns")]
    pub upstream_dns: Vec<String>,
    #[serde(rename = "overrideDns")]
    pub override_dns: bool,
    #[serde(rename = "tunnelDns")]
    pub tunnel_dns: bool,
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|err| err.to_string())
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|err| err.to_string())
    }
}

/// Ask the running worker to move to another organization over its control
/// pipe.
pub async fn switch_worker_org(org_id: &str) -> Result<(), String> {
    #[derive(Serialize)]
    struct SwitchOrgRequest<'a> {
        #[serde(rename = "orgId")]
        org_id: &'a str,
    }
    pipe_http::post_json(OLM_PIPE_PATH, "/switch-org", &SwitchOrgRequest { org_id }).await
}

/// Privileged side of the tunnel lifecycle: installing and removing the
/// per-tunnel worker services. Implemented by the manager, consumed by the
/// IPC layer, so neither module needs the other.
pub trait TunnelLifecycle: Send + Sync {
    fn install(&self, config_json: &str) -> Result<(), String>;
    fn uninstall(&self, name: &str) -> Result<(), String>;
}

/// UI-side handle to tunnel control, implemented by the IPC client against
/// the manager. The subscription carries manager-published state changes.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn start_tunnel(&self, config: Config) -> Result<(), String>;
    async fn stop_tunnel(&self) -> Result<(), String>;
    async fn switch_org(&self, org_id: &str) -> Result<(), String>;
    fn subscribe_state(&self) -> tokio::sync::broadcast::Receiver<State>;
}
