use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::api::{Api, ApiError, MyDevice, Org, ServerInfo, User};
use crate::config::{self, Account, AccountStore};
use crate::fingerprint;
use crate::secrets::SecretStore;

const APPLICATION_NAME: &str = "Pangolin Windows Client";
const DEVICE_AUTH_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Two-factor authentication code required")]
    TwoFactorRequired,
    #[error("Email verification required")]
    EmailVerificationRequired,
    #[error("Device code expired. Please try again.")]
    DeviceCodeExpired,
    #[error("Invalid session token")]
    InvalidToken,
    #[error("Login cancelled")]
    Cancelled,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{0}")]
    Other(String),
}

#[derive(Default)]
struct AuthState {
    is_authenticated: bool,
    current_user: Option<User>,
    current_org: Option<Org>,
    organizations: Vec<Org>,
    is_initializing: bool,
    error_message: Option<String>,
    device_auth_code: Option<String>,
    device_auth_login_url: Option<String>,
    server_info: Option<ServerInfo>,
    is_server_down: bool,
    session_expired: bool,
    device_auth_in_progress: bool,
}

/// Owns login state, account switching, org selection, and device (OLM)
/// credential provisioning for the UI process. All state reads go through the
/// getters so the tray can render from any thread.
pub struct AuthManager {
    api: Arc<dyn Api>,
    accounts: Arc<AccountStore>,
    secrets: Arc<dyn SecretStore>,
    state: RwLock<AuthState>,
    poll_interval: Duration,
}

impl AuthManager {
    pub fn new(
        api: Arc<dyn Api>,
        accounts: Arc<AccountStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            api,
            accounts,
            secrets,
            state: RwLock::new(AuthState {
                is_initializing: true,
                ..AuthState::default()
            }),
            poll_interval: DEVICE_AUTH_POLL_INTERVAL,
        });

        let hook_target = Arc::downgrade(&manager);
        manager.api.set_on_unauthorized(Arc::new(move || {
            if let Some(manager) = hook_target.upgrade() {
                manager.mark_session_expired();
            }
        }));

        manager
    }

    #[cfg(test)]
    fn with_poll_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let mut inner = Arc::into_inner(self).expect("no other handles during construction");
        inner.poll_interval = interval;
        Arc::new(inner)
    }

    /// Restore the persisted session, tolerate an unreachable server, and mark
    /// an expired session instead of logging the user out.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        self.set_state(|state| state.is_initializing = true);
        let result = self.initialize_inner().await;
        self.set_state(|state| state.is_initializing = false);
        result
    }

    async fn initialize_inner(&self) -> Result<(), AuthError> {
        let Some(account) = self.accounts.active_account() else {
            self.set_state(|state| state.is_authenticated = false);
            return Ok(());
        };
        let Some(token) = self
            .secrets
            .session_token(&account.user_id)
            .filter(|token| !token.is_empty())
        else {
            self.set_state(|state| state.is_authenticated = false);
            return Ok(());
        };

        self.api.update_base_url(&account.hostname);
        self.api.update_session_token(&token);

        let _ = self.check_health_and_set_state().await;
        if self.is_server_down() {
            // Keep the logged-in shell visible; everything else waits for the
            // server to come back.
            self.set_state(|state| state.is_authenticated = true);
            return Ok(());
        }

        let user = match self.api.get_user().await {
            Ok(user) => user,
            Err(err) if err.is_unauthorized() => {
                self.mark_session_expired();
                self.set_state(|state| state.is_authenticated = true);
                return Ok(());
            }
            Err(_) => {
                self.set_state(|state| state.is_authenticated = false);
                return Ok(());
            }
        };

        let _ = self.accounts.update_account_user_info(
            &account.user_id,
            user.username.as_deref().unwrap_or_default(),
            user.name.as_deref().unwrap_or_default(),
        );

        self.handle_successful_auth(user, &account.hostname, &token)
            .await
    }

    /// Password login against the current or an overridden host. Surfaces
    /// two-factor and email-verification demands as typed errors so the UI
    /// can re-prompt with a code.
    pub async fn login_with_credentials(
        &self,
        email: &str,
        password: &str,
        code: Option<String>,
        hostname_override: Option<&str>,
    ) -> Result<(), AuthError> {
        let login_client: Arc<dyn Api> = match hostname_override {
            Some(hostname) if !hostname.is_empty() => self.api.transient(hostname),
            _ => self.api.clone(),
        };

        let (response, token) = match login_client.login(email, password, code).await {
            Ok(result) => result,
            Err(err) => {
                self.set_state(|state| state.error_message = Some(err.to_string()));
                return Err(err.into());
            }
        };

        if response.code_requested == Some(true) {
            return Err(AuthError::TwoFactorRequired);
        }
        if response.email_verification_required == Some(true) {
            return Err(AuthError::EmailVerificationRequired);
        }
        let token = token.ok_or(AuthError::InvalidToken)?;

        if let Some(hostname) = hostname_override {
            if !hostname.is_empty() {
                self.api.update_base_url(hostname);
            }
        }
        self.api.update_session_token(&token);

        let user = match self.api.get_user().await {
            Ok(user) => user,
            Err(err) => {
                self.set_state(|state| state.error_message = Some(err.to_string()));
                return Err(err.into());
            }
        };

        self.handle_successful_auth(user, &login_client.current_base_url(), &token)
            .await
    }

    /// Device-code login. The `cancel` receiver aborts polling; on cancel the
    /// displayed code and URL are cleared.
    pub async fn login_with_device_auth(
        &self,
        hostname_override: Option<&str>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<(), AuthError> {
        self.set_state(|state| state.device_auth_in_progress = true);
        let result = self.device_auth_inner(hostname_override, &mut cancel).await;
        self.set_state(|state| state.device_auth_in_progress = false);
        result
    }

    async fn device_auth_inner(
        &self,
        hostname_override: Option<&str>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<(), AuthError> {
        let login_client: Arc<dyn Api> = match hostname_override {
            Some(hostname) if !hostname.is_empty() => self.api.transient(hostname),
            _ => self.api.clone(),
        };

        let device_name = config::friendly_device_name();
        let start = match login_client
            .start_device_auth(APPLICATION_NAME, Some(device_name))
            .await
        {
            Ok(start) => start,
            Err(err) => {
                self.set_state(|state| state.error_message = Some(err.to_string()));
                return Err(err.into());
            }
        };

        let login_url = format!("{}/auth/login/device", login_client.current_base_url());
        self.set_state(|state| {
            state.device_auth_code = Some(start.code.clone());
            state.device_auth_login_url = Some(login_url);
        });

        let expires_at = tokio::time::Instant::now()
            + Duration::from_secs(start.expires_in_seconds);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        let mut session_token: Option<String> = None;
        while session_token.is_none() {
            if tokio::time::Instant::now() >= expires_at {
                self.clear_device_auth();
                return Err(AuthError::DeviceCodeExpired);
            }
            tokio::select! {
                _ = &mut *cancel => {
                    self.clear_device_auth();
                    return Err(AuthError::Cancelled);
                }
                _ = ticker.tick() => {
                    let (poll, token) = match login_client.poll_device_auth(&start.code).await {
                        Ok(result) => result,
                        Err(err) => {
                            debug!("device auth poll failed, retrying: {err}");
                            continue;
                        }
                    };
                    if poll.verified {
                        match token {
                            Some(token) => session_token = Some(token),
                            None => return Err(AuthError::InvalidToken),
                        }
                    } else if let Some(message) = poll.message {
                        if message.contains("expired") || message.contains("not found") {
                            self.clear_device_auth();
                            return Err(AuthError::DeviceCodeExpired);
                        }
                    }
                }
            }
        }
        let session_token = session_token.expect("loop exits only with a token");

        if let Some(hostname) = hostname_override {
            if !hostname.is_empty() {
                self.api.update_base_url(hostname);
            }
        }
        self.api.update_session_token(&session_token);

        let user = match self.api.get_user().await {
            Ok(user) => user,
            Err(err) => {
                self.set_state(|state| state.error_message = Some(err.to_string()));
                return Err(err.into());
            }
        };

        self.clear_device_auth();
        self.handle_successful_auth(user, &login_client.current_base_url(), &session_token)
            .await
    }

    async fn handle_successful_auth(
        &self,
        mut user: User,
        hostname: &str,
        token: &str,
    ) -> Result<(), AuthError> {
        self.api.update_base_url(hostname);
        self.api.update_session_token(token);

        if user.user_id.is_empty() {
            user.user_id = user.id.clone();
        }
        let user_id = user.user_id.clone();
        self.set_state(|state| state.current_user = Some(user.clone()));

        let existing_account = self.accounts.account(&user_id);
        let selected_org_id = self.ensure_org_is_selected(existing_account.as_ref()).await;

        if !self.secrets.save_session_token(&user_id, token) {
            warn!("failed to persist session token for {user_id}");
        }

        let account = Account {
            user_id: user_id.clone(),
            email: user.email.clone(),
            org_id: selected_org_id,
            username: user.username.clone().unwrap_or_default(),
            name: user.name.clone().unwrap_or_default(),
            hostname: self.api.current_base_url(),
        };
        let _ = self.accounts.add_account(account);
        let _ = self.accounts.set_active_user(&user_id);

        self.set_state(|state| {
            state.is_authenticated = true;
            state.session_expired = false;
        });

        let _ = self.fetch_server_info().await;
        Ok(())
    }

    /// Restore the account's stored org if it is still listed, otherwise pick
    /// the first available one. Persisting the choice is the caller's job.
    async fn ensure_org_is_selected(&self, account: Option<&Account>) -> String {
        let Some(user_id) = self.current_user_id() else {
            return String::new();
        };

        let orgs = match self.api.list_user_orgs(&user_id).await {
            Ok(orgs) => orgs,
            Err(err) => {
                error!("failed to load organizations: {err}");
                self.set_state(|state| state.organizations = Vec::new());
                return String::new();
            }
        };

        let stored_org_id = match account {
            Some(account) => account.org_id.clone(),
            None => self
                .accounts
                .active_account()
                .map(|account| account.org_id)
                .unwrap_or_default(),
        };

        let selected = orgs
            .iter()
            .find(|org| !stored_org_id.is_empty() && org.id == stored_org_id)
            .or_else(|| orgs.first())
            .cloned();

        let selected_id = selected
            .as_ref()
            .map(|org| org.id.clone())
            .unwrap_or_default();
        self.set_state(|state| {
            state.organizations = orgs;
            state.current_org = selected;
        });
        selected_id
    }

    /// Verify any locally stored OLM credentials against the server, recover
    /// by fingerprint, or mint new ones. On success both halves are in the
    /// secret store.
    pub async fn ensure_olm_credentials(&self, user_id: &str) -> Result<(), AuthError> {
        if let Some((olm_id, _)) = self.secrets.olm_credentials(user_id) {
            match self.api.get_user_olm(user_id, &olm_id).await {
                Ok(olm) if olm.olm_id == olm_id => {
                    info!("OLM credentials verified");
                    return Ok(());
                }
                Ok(olm) => {
                    error!(
                        "OLM id mismatch: server {} vs stored {olm_id}; discarding",
                        olm.olm_id
                    );
                    self.secrets.delete_olm_credentials(user_id);
                }
                Err(err) => {
                    error!("failed to verify OLM credentials: {err}");
                    self.secrets.delete_olm_credentials(user_id);
                }
            }
        }

        let fp = fingerprint::gather_fingerprint_info();
        if let Ok(recovered) = self
            .api
            .recover_olm_from_fingerprint(user_id, &fp.platform_fingerprint)
            .await
        {
            if !self
                .secrets
                .save_olm_credentials(user_id, &recovered.olm_id, &recovered.secret)
            {
                return Err(AuthError::Other("failed to save OLM credentials".to_string()));
            }
            return Ok(());
        }

        let created = self
            .api
            .create_olm(user_id, &config::friendly_device_name())
            .await
            .map_err(|err| AuthError::Other(format!("failed to create OLM: {err}")))?;
        if !self
            .secrets
            .save_olm_credentials(user_id, &created.olm_id, &created.secret)
        {
            return Err(AuthError::Other("failed to save OLM credentials".to_string()));
        }
        Ok(())
    }

    /// Access check with a policy "resolution URL" message when the server
    /// denies with 401/403.
    pub async fn check_org_access(&self, org_id: &str) -> Result<bool, AuthError> {
        match self.api.get_org(org_id).await {
            Ok(_) => return Ok(true),
            Err(err) if !err.is_unauthorized() => return Err(err.into()),
            Err(_) => {}
        }

        if let Some(user_id) = self.current_user_id() {
            if let Ok(access) = self.api.check_org_user_access(org_id, &user_id).await {
                if !access.allowed {
                    let hostname = self
                        .accounts
                        .active_account()
                        .map(|account| account.hostname)
                        .unwrap_or_else(|| config::DEFAULT_HOSTNAME.to_string());
                    let resolution_url = format!("{hostname}/{org_id}");
                    let mut message = match access.error {
                        Some(error) if !error.is_empty() => format!("Access denied: {error}"),
                        _ => "Access denied due to organization policy violations.".to_string(),
                    };
                    message.push_str(&format!(
                        "\n\nSee more and resolve the issues by visiting: {resolution_url}"
                    ));
                    return Err(AuthError::Other(message));
                }
                return Err(AuthError::Other(
                    "org policy preventing access to this org".to_string(),
                ));
            }
        }

        Err(AuthError::Other(
            "unauthorized access to this org. Contact your admin".to_string(),
        ))
    }

    pub async fn select_organization(&self, org: &Org) -> Result<(), AuthError> {
        if !self.check_org_access(&org.id).await? {
            return Err(AuthError::Other("access denied".to_string()));
        }

        self.set_state(|state| state.current_org = Some(org.clone()));
        if let Some(user_id) = self.current_user_id() {
            if let Err(err) = self.accounts.set_user_organization(&user_id, &org.id) {
                warn!("failed to persist selected org: {err}");
            }
        }
        Ok(())
    }

    /// Optimistic switch: local state flips immediately; server validation
    /// follows and flags session-expired or server-down without reverting.
    pub async fn switch_account(&self, user_id: &str) -> Result<(), AuthError> {
        let account = self
            .accounts
            .account(user_id)
            .ok_or_else(|| AuthError::Other("account does not exist".to_string()))?;
        let token = self
            .secrets
            .session_token(user_id)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                AuthError::Other("session token does not exist for this user".to_string())
            })?;

        let _ = self.accounts.set_active_user(user_id);
        self.api.update_base_url(&account.hostname);
        self.api.update_session_token(&token);

        self.set_state(|state| {
            state.current_user = None;
            state.current_org = None;
            state.organizations = Vec::new();
            state.server_info = None;
            state.is_authenticated = true;
            state.is_server_down = false;
            state.error_message = None;
            state.session_expired = false;
        });

        let _ = self.check_health_and_set_state().await;
        if self.is_server_down() {
            warn!("server appears to be down after account switch");
            return Ok(());
        }

        let user = match self.api.get_user().await {
            Ok(user) => user,
            Err(err) => {
                if err.is_unauthorized() {
                    self.mark_session_expired();
                } else {
                    self.set_state(|state| state.error_message = Some(err.to_string()));
                }
                error!("failed to fetch user after account switch: {err}");
                return Ok(());
            }
        };

        let _ = self.accounts.update_account_user_info(
            user_id,
            user.username.as_deref().unwrap_or_default(),
            user.name.as_deref().unwrap_or_default(),
        );
        self.set_state(|state| state.current_user = Some(user));

        let selected_org_id = self.ensure_org_is_selected(Some(&account)).await;
        let _ = self.accounts.set_user_organization(user_id, &selected_org_id);
        let _ = self.fetch_server_info().await;
        Ok(())
    }

    /// Best-effort server logout, then local teardown and auto-switch to the
    /// next known account if one remains.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _ = self.api.logout().await;

        let user_id = self.accounts.active_user_id();
        let next_account_id = self
            .accounts
            .accounts()
            .into_iter()
            .map(|account| account.user_id)
            .find(|id| id != &user_id);

        self.api.update_session_token("");
        self.set_state(|state| {
            state.is_authenticated = false;
            state.current_org = None;
            state.organizations = Vec::new();
            state.error_message = None;
            state.device_auth_code = None;
            state.device_auth_login_url = None;
        });

        self.secrets.delete_session_token(&user_id);
        // OLM credentials are kept so the device record survives re-login.
        let _ = self.accounts.remove_account(&user_id);

        if let Some(next) = next_account_id {
            if let Err(err) = self.switch_account(&next).await {
                warn!("failed to auto-switch account after logout: {err}");
            }
        }
        Ok(())
    }

    pub async fn refresh_organizations(&self) -> Result<(), AuthError> {
        let Some(user_id) = self.authenticated_user_id() else {
            return Ok(());
        };
        let orgs = self.api.list_user_orgs(&user_id).await.map_err(|err| {
            error!("failed to refresh organizations: {err}");
            err
        })?;

        let mut cleared_org = false;
        self.set_state(|state| {
            if let Some(current) = &state.current_org {
                match orgs.iter().find(|org| org.id == current.id) {
                    Some(org) => state.current_org = Some(org.clone()),
                    None => {
                        state.current_org = None;
                        cleared_org = true;
                    }
                }
            }
            state.organizations = orgs;
        });
        if cleared_org {
            if let Some(account) = self.accounts.active_account() {
                let _ = self.accounts.set_user_organization(&account.user_id, "");
            }
        }
        Ok(())
    }

    /// Refresh user and org state from the consolidated my-device endpoint.
    pub async fn refresh_from_my_device(&self, olm_id: &str) -> Result<MyDevice, AuthError> {
        let Some(_) = self.authenticated_user_id() else {
            return Err(AuthError::Other("not authenticated".to_string()));
        };

        let device = match self.api.get_my_device(olm_id).await {
            Ok(device) => device,
            Err(err) => {
                error!("failed to refresh from my-device: {err}");
                if err.status() == Some(401) {
                    self.set_state(|state| state.is_authenticated = false);
                }
                return Err(err.into());
            }
        };

        self.set_state(|state| {
            if let Some(user) = &mut state.current_user {
                if user.user_id == device.user.user_id {
                    user.email = device.user.email.clone();
                    user.username = device.user.username.clone();
                    user.name = device.user.name.clone();
                }
            }
            let orgs: Vec<Org> = device
                .orgs
                .iter()
                .map(|org| Org {
                    id: org.org_id.clone(),
                    name: org.org_name.clone(),
                })
                .collect();
            if let Some(current) = &state.current_org {
                state.current_org = orgs.iter().find(|org| org.id == current.id).cloned();
            }
            state.organizations = orgs;
            state.is_authenticated = true;
        });
        Ok(device)
    }

    pub async fn check_health_and_set_state(&self) -> Result<(), AuthError> {
        let healthy = match self.api.check_health().await {
            Ok(healthy) => healthy,
            Err(err) => {
                self.set_state(|state| {
                    state.is_server_down = true;
                    state.error_message = Some("The server appears to be down.".to_string());
                });
                return Err(err.into());
            }
        };
        self.set_state(|state| {
            state.is_server_down = !healthy;
            state.error_message = if healthy {
                None
            } else {
                Some("The server appears to be down.".to_string())
            };
        });
        Ok(())
    }

    pub async fn fetch_server_info(&self) -> Result<(), AuthError> {
        match self.api.get_server_info().await {
            Ok(info) => {
                self.set_state(|state| state.server_info = Some(info));
                Ok(())
            }
            Err(err) => {
                error!("failed to fetch server info: {err}");
                Err(err.into())
            }
        }
    }

    /// 401/403 on an authenticated request lands here: the shell stays
    /// logged-in but connect is disabled until re-auth.
    pub fn mark_session_expired(&self) {
        self.set_state(|state| {
            state.session_expired = true;
            state.error_message = None;
        });
    }

    pub fn olm_id(&self) -> Option<String> {
        let user_id = self.current_user_id()?;
        self.secrets
            .olm_credentials(&user_id)
            .map(|(olm_id, _)| olm_id)
    }

    pub fn clear_device_auth(&self) {
        self.set_state(|state| {
            state.device_auth_code = None;
            state.device_auth_login_url = None;
        });
    }

    // State getters the tray renders from.

    pub fn is_authenticated(&self) -> bool {
        self.state.read().unwrap().is_authenticated
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.read().unwrap().current_user.clone()
    }

    pub fn current_org(&self) -> Option<Org> {
        self.state.read().unwrap().current_org.clone()
    }

    pub fn organizations(&self) -> Vec<Org> {
        self.state.read().unwrap().organizations.clone()
    }

    pub fn is_initializing(&self) -> bool {
        self.state.read().unwrap().is_initializing
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.read().unwrap().error_message.clone()
    }

    pub fn device_auth_code(&self) -> Option<String> {
        self.state.read().unwrap().device_auth_code.clone()
    }

    pub fn device_auth_login_url(&self) -> Option<String> {
        self.state.read().unwrap().device_auth_login_url.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.state.read().unwrap().server_info.clone()
    }

    pub fn is_server_down(&self) -> bool {
        self.state.read().unwrap().is_server_down
    }

    pub fn session_expired(&self) -> bool {
        self.state.read().unwrap().session_expired
    }

    pub fn is_device_auth_in_progress(&self) -> bool {
        self.state.read().unwrap().device_auth_in_progress
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .current_user
            .as_ref()
            .map(|user| user.user_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| {
                let id = self.accounts.active_user_id();
                (!id.is_empty()).then_some(id)
            })
    }

    fn authenticated_user_id(&self) -> Option<String> {
        let state = self.state.read().unwrap();
        if !state.is_authenticated {
            return None;
        }
        state
            .current_user
            .as_ref()
            .map(|user| user.user_id.clone())
            .filter(|id| !id.is_empty())
    }

    fn set_state(&self, update: impl FnOnce(&mut AuthState)) {
        let mut state = self.state.write().unwrap();
        update(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        DeviceAuthPoll, DeviceAuthStart, LoginResponse, MyDevice, OlmCredentials, OrgAccess,
        OrgSummary, UnauthorizedHook,
    };
    use crate::secrets::MemorySecretStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scriptable backend double. Unset calls return errors.
    #[derive(Default)]
    struct MockApi {
        base_url: Mutex<String>,
        session_token: Mutex<String>,
        poll_count: AtomicUsize,
        polls_until_verified: usize,
        session_token_on_verify: Option<String>,
        user: Mutex<Option<Result<User, u16>>>,
        login_result: Option<(LoginResponse, Option<String>)>,
        orgs: Vec<Org>,
        org_access: Option<OrgAccess>,
        get_org_status: Option<u16>,
        user_olm: Option<Olm>,
        recovered: Option<OlmCredentials>,
        created: Option<OlmCredentials>,
        healthy: bool,
    }

    impl MockApi {
        fn into_arc(self) -> Arc<dyn Api> {
            Arc::new(self)
        }
    }

    fn api_err(status: u16) -> ApiError {
        ApiError::Http {
            status,
            message: "Unauthorized".to_string(),
        }
    }

    #[async_trait]
    impl Api for MockApi {
        fn current_base_url(&self) -> String {
            self.base_url.lock().unwrap().clone()
        }

        fn update_base_url(&self, base_url: &str) {
            *self.base_url.lock().unwrap() = base_url.to_string();
        }

        fn update_session_token(&self, token: &str) {
            *self.session_token.lock().unwrap() = token.to_string();
        }

        fn set_on_unauthorized(&self, _hook: UnauthorizedHook) {}

        fn transient(&self, _base_url: &str) -> Arc<dyn Api> {
            unimplemented!("tests log in without a hostname override")
        }

        async fn login(
            &self,
            _email: &str,
            _password: &str,
            _code: Option<String>,
        ) -> Result<(LoginResponse, Option<String>), ApiError> {
            self.login_result.clone().ok_or_else(|| api_err(401))
        }

        async fn start_device_auth(
            &self,
            _application_name: &str,
            _device_name: Option<String>,
        ) -> Result<DeviceAuthStart, ApiError> {
            Ok(DeviceAuthStart {
                code: "ABCD-EFGH".to_string(),
                expires_in_seconds: 600,
            })
        }

        async fn poll_device_auth(
            &self,
            _code: &str,
        ) -> Result<(DeviceAuthPoll, Option<String>), ApiError> {
            let count = self.poll_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.polls_until_verified {
                Ok((
                    DeviceAuthPoll {
                        verified: true,
                        token: self.session_token_on_verify.clone(),
                        message: None,
                    },
                    self.session_token_on_verify.clone(),
                ))
            } else {
                Ok((
                    DeviceAuthPoll {
                        verified: false,
                        token: None,
                        message: None,
                    },
                    None,
                ))
            }
        }

        async fn get_user(&self) -> Result<User, ApiError> {
            match self.user.lock().unwrap().clone() {
                Some(Ok(user)) => Ok(user),
                Some(Err(status)) => Err(api_err(status)),
                None => Err(api_err(500)),
            }
        }

        async fn list_user_orgs(&self, _user_id: &str) -> Result<Vec<Org>, ApiError> {
            Ok(self.orgs.clone())
        }

        async fn get_org(&self, org_id: &str) -> Result<OrgSummary, ApiError> {
            match self.get_org_status {
                Some(status) => Err(api_err(status)),
                None => Ok(OrgSummary {
                    id: org_id.to_string(),
                    name: "Org".to_string(),
                }),
            }
        }

        async fn check_org_user_access(
            &self,
            _org_id: &str,
            _user_id: &str,
        ) -> Result<OrgAccess, ApiError> {
            self.org_access.clone().ok_or_else(|| api_err(500))
        }

        async fn create_olm(
            &self,
            _user_id: &str,
            _name: &str,
        ) -> Result<OlmCredentials, ApiError> {
            self.created.clone().ok_or_else(|| api_err(500))
        }

        async fn get_user_olm(&self, _user_id: &str, _olm_id: &str) -> Result<Olm, ApiError> {
            self.user_olm.clone().ok_or_else(|| api_err(404))
        }

        async fn recover_olm_from_fingerprint(
            &self,
            _user_id: &str,
            _platform_fingerprint: &str,
        ) -> Result<OlmCredentials, ApiError> {
            self.recovered.clone().ok_or_else(|| api_err(404))
        }

        async fn get_my_device(&self, _olm_id: &str) -> Result<MyDevice, ApiError> {
            Err(api_err(500))
        }

        async fn get_server_info(&self) -> Result<ServerInfo, ApiError> {
            Ok(ServerInfo {
                version: Some("1.0".to_string()),
                host_meta: None,
            })
        }

        async fn check_health(&self) -> Result<bool, ApiError> {
            Ok(self.healthy)
        }

        async fn logout(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<AuthManager>,
        accounts: Arc<AccountStore>,
        secrets: Arc<MemorySecretStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(api: MockApi) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let accounts = Arc::new(AccountStore::with_path(dir.path().join("accounts.json")));
        let secrets = Arc::new(MemorySecretStore::new());
        let manager = AuthManager::new(
            api.into_arc(),
            accounts.clone(),
            secrets.clone() as Arc<dyn SecretStore>,
        )
        .with_poll_interval(Duration::from_millis(5));
        Fixture {
            manager,
            accounts,
            secrets,
            _dir: dir,
        }
    }

    fn test_user() -> User {
        User {
            id: "u1".to_string(),
            user_id: "u1".to_string(),
            email: "a@b".to_string(),
            username: None,
            name: Some("A".to_string()),
        }
    }

    #[tokio::test]
    async fn fresh_device_login_persists_account_and_token() {
        let mut api = MockApi::default();
        api.base_url = Mutex::new("https://app.example.net".to_string());
        api.polls_until_verified = 3;
        api.session_token_on_verify = Some("T1".to_string());
        api.user = Mutex::new(Some(Ok(test_user())));
        let fx = fixture(api);

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        fx.manager
            .login_with_device_auth(None, cancel_rx)
            .await
            .unwrap();

        assert!(fx.manager.is_authenticated());
        assert_eq!(fx.accounts.active_user_id(), "u1");
        let account = fx.accounts.active_account().unwrap();
        assert_eq!(account.hostname, "https://app.example.net");
        assert_eq!(account.org_id, "");
        assert_eq!(fx.secrets.session_token("u1").as_deref(), Some("T1"));
        // Login UI state is cleared once verified.
        assert!(fx.manager.device_auth_code().is_none());
    }

    #[tokio::test]
    async fn password_login_persists_session() {
        let mut api = MockApi::default();
        api.base_url = Mutex::new("https://app.example.net".to_string());
        api.login_result = Some((
            LoginResponse {
                user_id: "u1".to_string(),
                email: "a@b".to_string(),
                username: None,
                name: Some("A".to_string()),
                code_requested: None,
                email_verification_required: None,
            },
            Some("T1".to_string()),
        ));
        api.user = Mutex::new(Some(Ok(test_user())));
        let fx = fixture(api);

        fx.manager
            .login_with_credentials("a@b", "hunter2", None, None)
            .await
            .unwrap();

        assert!(fx.manager.is_authenticated());
        assert_eq!(fx.secrets.session_token("u1").as_deref(), Some("T1"));
        assert_eq!(fx.accounts.active_user_id(), "u1");
    }

    #[tokio::test]
    async fn password_login_demands_second_factor() {
        let mut api = MockApi::default();
        api.login_result = Some((
            LoginResponse {
                user_id: String::new(),
                email: "a@b".to_string(),
                username: None,
                name: None,
                code_requested: Some(true),
                email_verification_required: None,
            },
            None,
        ));
        let fx = fixture(api);

        let err = fx
            .manager
            .login_with_credentials("a@b", "hunter2", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TwoFactorRequired));
        assert!(!fx.manager.is_authenticated());
    }

    #[tokio::test]
    async fn device_login_cancellation_clears_code() {
        let mut api = MockApi::default();
        api.polls_until_verified = usize::MAX;
        let fx = fixture(api);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let manager = fx.manager.clone();
        let login = tokio::spawn(async move {
            manager.login_with_device_auth(None, cancel_rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(()).unwrap();

        let result = login.await.unwrap();
        assert!(matches!(result, Err(AuthError::Cancelled)));
        assert!(fx.manager.device_auth_code().is_none());
        assert!(fx.manager.device_auth_login_url().is_none());
    }

    #[tokio::test]
    async fn login_restores_stored_org_selection() {
        let mut api = MockApi::default();
        api.polls_until_verified = 1;
        api.session_token_on_verify = Some("T1".to_string());
        api.user = Mutex::new(Some(Ok(test_user())));
        api.orgs = vec![
            Org {
                id: "o1".to_string(),
                name: "Org1".to_string(),
            },
            Org {
                id: "o2".to_string(),
                name: "Org2".to_string(),
            },
        ];
        let fx = fixture(api);

        // A previous login selected o2.
        fx.accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                org_id: "o2".to_string(),
                ..Account::default()
            })
            .unwrap();

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        fx.manager
            .login_with_device_auth(None, cancel_rx)
            .await
            .unwrap();

        assert_eq!(fx.manager.current_org().unwrap().id, "o2");
        assert_eq!(fx.accounts.account("u1").unwrap().org_id, "o2");
    }

    #[tokio::test]
    async fn session_expiry_keeps_shell_authenticated() {
        let mut api = MockApi::default();
        api.healthy = true;
        api.user = Mutex::new(Some(Err(401)));
        let fx = fixture(api);

        fx.accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                hostname: "https://app.example.net".to_string(),
                ..Account::default()
            })
            .unwrap();
        fx.accounts.set_active_user("u1").unwrap();
        fx.secrets.save_session_token("u1", "T1");

        fx.manager.initialize().await.unwrap();

        assert!(fx.manager.session_expired());
        assert!(fx.manager.is_authenticated());
    }

    #[tokio::test]
    async fn ensure_olm_keeps_verified_credentials() {
        let mut api = MockApi::default();
        api.user_olm = Some(Olm {
            olm_id: "olm-1".to_string(),
            user_id: "u1".to_string(),
            name: None,
        });
        let fx = fixture(api);
        fx.secrets.save_olm_credentials("u1", "olm-1", "s1");

        fx.manager.ensure_olm_credentials("u1").await.unwrap();
        assert_eq!(
            fx.secrets.olm_credentials("u1"),
            Some(("olm-1".to_string(), "s1".to_string()))
        );
    }

    #[tokio::test]
    async fn ensure_olm_discards_mismatch_and_recovers() {
        let mut api = MockApi::default();
        api.user_olm = Some(Olm {
            olm_id: "olm-other".to_string(),
            user_id: "u1".to_string(),
            name: None,
        });
        api.recovered = Some(OlmCredentials {
            olm_id: "olm-2".to_string(),
            secret: "s2".to_string(),
        });
        let fx = fixture(api);
        fx.secrets.save_olm_credentials("u1", "olm-1", "s1");

        fx.manager.ensure_olm_credentials("u1").await.unwrap();
        assert_eq!(
            fx.secrets.olm_credentials("u1"),
            Some(("olm-2".to_string(), "s2".to_string()))
        );
    }

    #[tokio::test]
    async fn ensure_olm_creates_when_recovery_fails() {
        let mut api = MockApi::default();
        api.created = Some(OlmCredentials {
            olm_id: "olm-new".to_string(),
            secret: "s-new".to_string(),
        });
        let fx = fixture(api);

        fx.manager.ensure_olm_credentials("u1").await.unwrap();
        assert_eq!(
            fx.secrets.olm_credentials("u1"),
            Some(("olm-new".to_string(), "s-new".to_string()))
        );
    }

    #[tokio::test]
    async fn denied_org_access_carries_resolution_url() {
        let mut api = MockApi::default();
        api.get_org_status = Some(403);
        api.org_access = Some(OrgAccess {
            allowed: false,
            error: Some("two-factor required".to_string()),
        });
        api.user = Mutex::new(Some(Ok(test_user())));
        let fx = fixture(api);

        fx.accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                hostname: "https://app.example.net".to_string(),
                ..Account::default()
            })
            .unwrap();
        fx.accounts.set_active_user("u1").unwrap();
        fx.manager.set_state(|state| {
            state.current_user = Some(test_user());
        });

        let err = fx.manager.check_org_access("o1").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Access denied: two-factor required"));
        assert!(message.contains("https://app.example.net/o1"));
    }

    #[tokio::test]
    async fn logout_removes_account_and_token() {
        let mut api = MockApi::default();
        api.user = Mutex::new(Some(Ok(test_user())));
        let fx = fixture(api);

        fx.accounts
            .add_account(Account {
                user_id: "u1".to_string(),
                ..Account::default()
            })
            .unwrap();
        fx.accounts.set_active_user("u1").unwrap();
        fx.secrets.save_session_token("u1", "T1");
        fx.secrets.save_olm_credentials("u1", "olm-1", "s1");

        fx.manager.logout().await.unwrap();

        assert!(fx.secrets.session_token("u1").is_none());
        // Device credentials survive logout so the device record is reusable.
        assert!(fx.secrets.olm_credentials("u1").is_some());
        assert!(fx.accounts.account("u1").is_none());
        assert!(!fx.manager.is_authenticated());
    }
}
