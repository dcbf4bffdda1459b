use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::error;

use super::{
    local_data_dir, CONFIG_FILE_NAME, DEFAULT_DNS_OVERRIDE, DEFAULT_DNS_TUNNEL,
    DEFAULT_PRIMARY_DNS,
};

/// DNS preferences persisted to `pangolin.json`. Absent fields fall back to
/// the built-in defaults at read time so older files keep working.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(rename = "dnsOverride", skip_serializing_if = "Option::is_none")]
    pub dns_override: Option<bool>,
    #[serde(rename = "dnsTunnel", skip_serializing_if = "Option::is_none")]
    pub dns_tunnel: Option<bool>,
    #[serde(rename = "primaryDNS", skip_serializing_if = "Option::is_none")]
    pub primary_dns: Option<String>,
    #[serde(rename = "secondaryDNS", skip_serializing_if = "Option::is_none")]
    pub secondary_dns: Option<String>,
}

pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<DnsConfig>,
}

impl ConfigStore {
    pub fn new() -> Self {
        let dir = local_data_dir();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            error!("failed to create config directory: {err}");
        }
        Self::with_path(dir.join(CONFIG_FILE_NAME))
    }

    pub fn with_path(path: PathBuf) -> Self {
        let config = load(&path);
        Self {
            path,
            config: RwLock::new(config),
        }
    }

    pub fn dns_override(&self) -> bool {
        self.config
            .read()
            .unwrap()
            .dns_override
            .unwrap_or(DEFAULT_DNS_OVERRIDE)
    }

    pub fn dns_tunnel(&self) -> bool {
        self.config
            .read()
            .unwrap()
            .dns_tunnel
            .unwrap_or(DEFAULT_DNS_TUNNEL)
    }

    pub fn primary_dns(&self) -> String {
        match &self.config.read().unwrap().primary_dns {
            Some(value) if !value.is_empty() => value.clone(),
            _ => DEFAULT_PRIMARY_DNS.to_string(),
        }
    }

    /// Empty when no secondary server is configured.
    pub fn secondary_dns(&self) -> String {
        self.config
            .read()
            .unwrap()
            .secondary_dns
            .clone()
            .unwrap_or_default()
    }

    pub fn set_dns_override(&self, value: bool) -> bool {
        let mut config = self.config.write().unwrap();
        config.dns_override = Some(value);
        self.save(&config)
    }

    pub fn set_dns_tunnel(&self, value: bool) -> bool {
        let mut config = self.config.write().unwrap();
        config.dns_tunnel = Some(value);
        self.save(&config)
    }

    /// Rejects values that do not parse as an IP address.
    pub fn set_primary_dns(&self, value: &str) -> bool {
        if value.parse::<IpAddr>().is_err() {
            error!("refusing to persist invalid primary DNS {value:?}");
            return false;
        }
        let mut config = self.config.write().unwrap();
        config.primary_dns = Some(value.to_string());
        self.save(&config)
    }

    /// An empty string removes the secondary server entirely.
    pub fn set_secondary_dns(&self, value: &str) -> bool {
        if !value.is_empty() && value.parse::<IpAddr>().is_err() {
            error!("refusing to persist invalid secondary DNS {value:?}");
            return false;
        }
        let mut config = self.config.write().unwrap();
        config.secondary_dns = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        self.save(&config)
    }

    pub fn clear(&self) -> bool {
        let mut config = self.config.write().unwrap();
        *config = DnsConfig::default();
        self.save(&config)
    }

    fn save(&self, config: &DnsConfig) -> bool {
        let data = match serde_json::to_string_pretty(config) {
            Ok(data) => data,
            Err(err) => {
                error!("error encoding config: {err}");
                return false;
            }
        };
        if let Err(err) = std::fs::write(&self.path, data) {
            error!("error saving config: {err}");
            return false;
        }
        true
    }
}

fn load(path: &PathBuf) -> DnsConfig {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return DnsConfig::default(),
    };
    match serde_json::from_str(&data) {
        Ok(config) => config,
        Err(err) => {
            error!("error parsing config: {err}");
            DnsConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::with_path(dir.path().join(CONFIG_FILE_NAME))
    }

    #[test]
    fn defaults_apply_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.dns_override());
        assert!(!store.dns_tunnel());
        assert_eq!(store.primary_dns(), DEFAULT_PRIMARY_DNS);
        assert_eq!(store.secondary_dns(), "");
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.set_dns_override(false));
        assert!(store.set_dns_tunnel(true));
        assert!(store.set_primary_dns("1.1.1.1"));
        assert!(store.set_secondary_dns("8.8.8.8"));
        assert!(!store.dns_override());
        assert!(store.dns_tunnel());
        assert_eq!(store.primary_dns(), "1.1.1.1");
        assert_eq!(store.secondary_dns(), "8.8.8.8");

        // Fresh store sees the persisted values.
        let reloaded = store_in(&dir);
        assert_eq!(reloaded.primary_dns(), "1.1.1.1");
    }

    #[test]
    fn empty_secondary_means_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.set_secondary_dns("8.8.8.8"));
        assert!(store.set_secondary_dns(""));
        assert_eq!(store.secondary_dns(), "");

        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(!raw.contains("secondaryDNS"));
    }

    #[test]
    fn invalid_primary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.set_primary_dns("not-an-ip"));
        assert_eq!(store.primary_dns(), DEFAULT_PRIMARY_DNS);
    }
}
