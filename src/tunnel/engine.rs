use std::collections::HashMap;

use serde::Serialize;

/// Engine bootstrap parameters, fixed for the life of the worker process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub log_level: String,
    pub enable_api: bool,
    pub socket_path: String,
    pub version: String,
    pub agent: String,
}

/// Lifecycle hooks the engine fires from its own threads.
pub struct EngineCallbacks {
    pub on_connected: Box<dyn Fn() + Send + Sync>,
    pub on_registered: Box<dyn Fn() + Send + Sync>,
    pub on_terminated: Box<dyn Fn() + Send + Sync>,
}

/// Contract the embedded tunnel engine presents to the worker. The real
/// binding is [`crate::tunnel::OlmLibrary`]; tests substitute a mock.
pub trait OlmEngine: Send + Sync {
    fn start_api(&self) -> Result<(), String>;
    /// Blocks until the tunnel stops; run it on its own thread.
    fn start_tunnel(&self, payload: &str) -> Result<(), String>;
    fn stop_api(&self);
    fn stop_tunnel(&self);
    fn set_fingerprint(&self, fingerprint: &HashMap<String, serde_json::Value>);
    fn set_postures(&self, postures: &HashMap<String, serde_json::Value>);
}

/// JSON payload handed to the engine at tunnel start: the tunnel config plus
/// the initial host identity and posture maps.
pub fn tunnel_start_payload(
    config: &super::Config,
    fingerprint: &HashMap<String, serde_json::Value>,
    postures: &HashMap<String, serde_json::Value>,
) -> Result<String, String> {
    let mut value = serde_json::to_value(config).map_err(|err| err.to_string())?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| "tunnel config is not an object".to_string())?;
    object.insert(
        "initialFingerprint".to_string(),
        serde_json::to_value(fingerprint).map_err(|err| err.to_string())?,
    );
    object.insert(
        "initialPostures".to_string(),
        serde_json::to_value(postures).map_err(|err| err.to_string())?,
    );
    serde_json::to_string(&value).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payload_embeds_identity_maps() {
        let config = crate::tunnel::Config {
            name: "olm".to_string(),
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
        };
        let mut fingerprint = HashMap::new();
        fingerprint.insert("platform".to_string(), serde_json::json!("windows"));
        let mut postures = HashMap::new();
        postures.insert("tpmAvailable".to_string(), serde_json::json!(true));

        let payload = tunnel_start_payload(&config, &fingerprint, &postures).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["initialFingerprint"]["platform"], "windows");
        assert_eq!(value["initialPostures"]["tpmAvailable"], true);
        assert_eq!(value["orgId"], "o1");
    }
}
