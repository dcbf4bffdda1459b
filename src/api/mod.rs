mod methods;
mod types;

pub use types::*;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error};

use crate::version;

const API_PREFIX: &str = "/api/v1";
const SESSION_COOKIE: &str = "p_session_token";
const CSRF_TOKEN: &str = "x-csrf-protection";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Failed to decode response: {0}")]
    Decoding(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

pub type UnauthorizedHook = Arc<dyn Fn() + Send + Sync>;

/// Typed surface the backend presents to the client. The auth and tunnel
/// layers depend on this trait only; the reqwest implementation below is the
/// production binding.
#[async_trait]
pub trait Api: Send + Sync {
    fn current_base_url(&self) -> String;
    fn update_base_url(&self, base_url: &str);
    fn update_session_token(&self, token: &str);
    fn set_on_unauthorized(&self, hook: UnauthorizedHook);
    /// A throwaway client against another host, used while a login attempt is
    /// still unconfirmed so the main client keeps its base URL.
    fn transient(&self, base_url: &str) -> Arc<dyn Api>;

    /// Password login. On success the session token from the
    /// `p_session_token` cookie rides along with the body.
    async fn login(
        &self,
        email: &str,
        password: &str,
        code: Option<String>,
    ) -> Result<(LoginResponse, Option<String>), ApiError>;
    async fn start_device_auth(
        &self,
        application_name: &str,
        device_name: Option<String>,
    ) -> Result<DeviceAuthStart, ApiError>;
    /// Returns the poll body plus the session token, sourced from the body or
    /// the session cookie.
    async fn poll_device_auth(&self, code: &str)
        -> Result<(DeviceAuthPoll, Option<String>), ApiError>;
    async fn get_user(&self) -> Result<User, ApiError>;
    async fn list_user_orgs(&self, user_id: &str) -> Result<Vec<Org>, ApiError>;
    async fn get_org(&self, org_id: &str) -> Result<OrgSummary, ApiError>;
    async fn check_org_user_access(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<OrgAccess, ApiError>;
    async fn create_olm(&self, user_id: &str, name: &str) -> Result<OlmCredentials, ApiError>;
    async fn get_user_olm(&self, user_id: &str, olm_id: &str) -> Result<Olm, ApiError>;
    async fn recover_olm_from_fingerprint(
        &self,
        user_id: &str,
        platform_fingerprint: &str,
    ) -> Result<OlmCredentials, ApiError>;
    async fn get_my_device(&self, olm_id: &str) -> Result<MyDevice, ApiError>;
    async fn get_server_info(&self) -> Result<ServerInfo, ApiError>;
    /// Ok(false) on connection failure rather than an error; callers treat
    /// both the same way.
    async fn check_health(&self) -> Result<bool, ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;
}

struct ClientState {
    base_url: String,
    session_token: String,
}

/// reqwest-backed [`Api`] implementation.
pub struct ApiClient {
    state: RwLock<ClientState>,
    on_unauthorized: RwLock<Option<UnauthorizedHook>>,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, session_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(version::user_agent())
            .build()
            .expect("reqwest client construction cannot fail with static options");

        let normalized = normalize_base_url(base_url);
        debug!("api client initialized with base url {normalized}");
        Self {
            state: RwLock::new(ClientState {
                base_url: normalized,
                session_token: session_token.to_string(),
            }),
            on_unauthorized: RwLock::new(None),
            client,
        }
    }

    fn api_url(&self, path: &str) -> Result<String, ApiError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let full = format!("{}{API_PREFIX}{path}", self.current_base_url());
        reqwest::Url::parse(&full).map_err(|_| ApiError::InvalidUrl)?;
        Ok(full)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(Vec<u8>, u16, Option<String>), ApiError> {
        let url = self.api_url(path)?;
        let session_token = self.state.read().unwrap().session_token.clone();

        let mut request = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-CSRF-Token", CSRF_TOKEN);
        if !session_token.is_empty() {
            request = request.header("Cookie", format!("{SESSION_COOKIE}={session_token}"));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        debug!("request {url}");
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                let base = self.current_base_url();
                ApiError::Http {
                    status: 0,
                    message: format!(
                        "Connection to {base} timed out. Please check your network connection."
                    ),
                }
            } else {
                ApiError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        // Older servers set `p_session` instead of the current cookie name.
        let cookie = extract_cookie(response.headers(), SESSION_COOKIE)
            .or_else(|| extract_cookie(response.headers(), "p_session"));
        let data = response
            .bytes()
            .await
            .map_err(|err| ApiError::InvalidResponse(err.to_string()))?
            .to_vec();

        if (status == 401 || status == 403) && !session_token.is_empty() {
            if let Some(hook) = self.on_unauthorized.read().unwrap().clone() {
                hook();
            }
        }

        Ok((data, status, cookie))
    }

    fn parse<T: DeserializeOwned>(data: &[u8], status: u16) -> Result<T, ApiError> {
        if !(200..300).contains(&status) {
            let message = serde_json::from_slice::<ApiResponse<serde_json::Value>>(data)
                .ok()
                .map(|wrapper| wrapper.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| default_http_error_message(status));
            return Err(ApiError::Http { status, message });
        }

        let wrapper: ApiResponse<T> = serde_json::from_slice(data)
            .map_err(|err| ApiError::Decoding(err.to_string()))?;

        if wrapper.success == Some(false) || wrapper.error == Some(true) {
            let message = if wrapper.message.is_empty() {
                "Request failed".to_string()
            } else {
                wrapper.message
            };
            let status = if wrapper.status == 0 {
                status
            } else {
                wrapper.status
            };
            return Err(ApiError::Http { status, message });
        }

        wrapper
            .data
            .ok_or_else(|| ApiError::InvalidResponse("No data in response".to_string()))
    }
}

pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return crate::config::DEFAULT_HOSTNAME.to_string();
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

fn default_http_error_message(status: u16) -> String {
    match status {
        401 | 403 => "Unauthorized".to_string(),
        404 => "Not found".to_string(),
        429 => "Rate limit exceeded".to_string(),
        500 => "Internal server error".to_string(),
        other => format!("HTTP error {other}"),
    }
}

fn extract_cookie(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for part in raw.split(';') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix(&format!("{name}=")) {
                return Some(value.to_string());
            }
        }
    }
    None
}
