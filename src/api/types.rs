use serde::{Deserialize, Serialize};

/// Wrapper shape shared by every backend response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: Option<bool>,
    pub error: Option<bool>,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    pub username: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "codeRequested")]
    pub code_requested: Option<bool>,
    #[serde(rename = "emailVerificationRequired")]
    pub email_verification_required: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DeviceAuthStartRequest {
    #[serde(rename = "applicationName")]
    pub application_name: String,
    #[serde(rename = "deviceName", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthStart {
    pub code: String,
    #[serde(rename = "expiresInSeconds")]
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthPoll {
    pub verified: bool,
    pub token: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Org {
    #[serde(rename = "orgId")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ListUserOrgs {
    pub orgs: Vec<Org>,
}

#[derive(Debug, Serialize)]
pub struct CreateOlmRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RecoverOlmRequest {
    #[serde(rename = "platformFingerprint")]
    pub platform_fingerprint: String,
}

/// Freshly minted or recovered device credentials. The secret is returned
/// exactly once; it is never readable again from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct OlmCredentials {
    #[serde(rename = "olmId")]
    pub olm_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Olm {
    #[serde(rename = "olmId")]
    pub olm_id: String,
    #[serde(rename = "userId", default)]
    pub user_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrgSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgAccess {
    pub allowed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MyDeviceUser {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub email: String,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MyDeviceOrg {
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "orgName")]
    pub org_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MyDevice {
    pub user: MyDeviceUser,
    pub orgs: Vec<MyDeviceOrg>,
    pub olm: Option<Olm>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub version: Option<String>,
    #[serde(rename = "hostMeta")]
    pub host_meta: Option<serde_json::Value>,
}
