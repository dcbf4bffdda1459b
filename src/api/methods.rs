use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;

use super::*;

#[async_trait]
impl Api for ApiClient {
    fn current_base_url(&self) -> String {
        self.state.read().unwrap().base_url.clone()
    }

    fn update_base_url(&self, base_url: &str) {
        self.state.write().unwrap().base_url = normalize_base_url(base_url);
    }

    fn update_session_token(&self, token: &str) {
        self.state.write().unwrap().session_token = token.to_string();
    }

    fn set_on_unauthorized(&self, hook: UnauthorizedHook) {
        *self.on_unauthorized.write().unwrap() = Some(hook);
    }

    fn transient(&self, base_url: &str) -> Arc<dyn Api> {
        Arc::new(ApiClient::new(base_url, ""))
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
        code: Option<String>,
    ) -> Result<(LoginResponse, Option<String>), ApiError> {
        let body = serde_json::to_value(LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
            code,
        })
        .map_err(|err| ApiError::Decoding(err.to_string()))?;
        let (data, status, cookie) = self.request(Method::POST, "/auth/login", Some(body)).await?;
        let response: LoginResponse = Self::parse(&data, status)?;
        Ok((response, cookie))
    }

    async fn start_device_auth(
        &self,
        application_name: &str,
        device_name: Option<String>,
    ) -> Result<DeviceAuthStart, ApiError> {
        let body = serde_json::to_value(DeviceAuthStartRequest {
            application_name: application_name.to_string(),
            device_name,
        })
        .map_err(|err| ApiError::Decoding(err.to_string()))?;
        let (data, status, _) = self
            .request(Method::POST, "/auth/device-web-auth/start", Some(body))
            .await?;
        Self::parse(&data, status)
    }

    async fn poll_device_auth(
        &self,
        code: &str,
    ) -> Result<(DeviceAuthPoll, Option<String>), ApiError> {
        let path = format!("/auth/device-web-auth/poll/{code}");
        let (data, status, cookie) = self.request(Method::GET, &path, None).await?;
        let poll: DeviceAuthPoll = Self::parse(&data, status)?;
        let token = if poll.verified && poll.token.is_some() {
            poll.token.clone()
        } else {
            cookie
        };
        Ok((poll, token))
    }

    async fn get_user(&self) -> Result<User, ApiError> {
        let (data, status, _) = self.request(Method::GET, "/user", None).await?;
        Self::parse(&data, status)
    }

    async fn list_user_orgs(&self, user_id: &str) -> Result<Vec<Org>, ApiError> {
        let path = format!("/user/{user_id}/orgs");
        let (data, status, _) = self.request(Method::GET, &path, None).await?;
        let response: ListUserOrgs = Self::parse(&data, status)?;
        Ok(response.orgs)
    }

    async fn get_org(&self, org_id: &str) -> Result<OrgSummary, ApiError> {
        let path = format!("/org/{org_id}");
        let (data, status, _) = self.request(Method::GET, &path, None).await?;
        Self::parse(&data, status)
    }

    async fn check_org_user_access(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<OrgAccess, ApiError> {
        let path = format!("/org/{org_id}/user/{user_id}/check");
        let (data, status, _) = self.request(Method::GET, &path, None).await?;
        Self::parse(&data, status)
    }

    async fn create_olm(&self, user_id: &str, name: &str) -> Result<OlmCredentials, ApiError> {
        let body = serde_json::to_value(CreateOlmRequest {
            name: name.to_string(),
        })
        .map_err(|err| ApiError::Decoding(err.to_string()))?;
        let path = format!("/user/{user_id}/olm");
        let (data, status, _) = self.request(Method::PUT, &path, Some(body)).await?;
        Self::parse(&data, status)
    }

    async fn get_user_olm(&self, user_id: &str, olm_id: &str) -> Result<Olm, ApiError> {
        let path = format!("/user/{user_id}/olm/{olm_id}");
        let (data, status, _) = self.request(Method::GET, &path, None).await?;
        Self::parse(&data, status)
    }

    async fn recover_olm_from_fingerprint(
        &self,
        user_id: &str,
        platform_fingerprint: &str,
    ) -> Result<OlmCredentials, ApiError> {
        let body = serde_json::to_value(RecoverOlmRequest {
            platform_fingerprint: platform_fingerprint.to_string(),
        })
        .map_err(|err| ApiError::Decoding(err.to_string()))?;
        let path = format!("/user/{user_id}/olm/recover");
        let (data, status, _) = self.request(Method::POST, &path, Some(body)).await?;
        Self::parse(&data, status)
    }

    async fn get_my_device(&self, olm_id: &str) -> Result<MyDevice, ApiError> {
        let path = format!("/my-device?olmId={olm_id}");
        let (data, status, _) = self.request(Method::GET, &path, None).await?;
        Self::parse(&data, status)
    }

    async fn get_server_info(&self) -> Result<ServerInfo, ApiError> {
        let (data, status, _) = self.request(Method::GET, "/server-info", None).await?;
        Self::parse(&data, status)
    }

    async fn check_health(&self) -> Result<bool, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let response = match client.head(self.current_base_url()).send().await {
            Ok(response) => response,
            Err(_) => return Ok(false),
        };
        let status = response.status().as_u16();
        Ok((200..300).contains(&status) || status == 404)
    }

    async fn logout(&self) -> Result<(), ApiError> {
        let (data, status, _) = self
            .request(Method::POST, "/auth/logout", Some(serde_json::json!({})))
            .await?;
        // A bare success wrapper with no data is fine here.
        if (200..300).contains(&status) {
            return Ok(());
        }
        Self::parse::<serde_json::Value>(&data, status).map(|_| ())
    }
}
