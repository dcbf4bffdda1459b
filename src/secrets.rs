use std::collections::HashMap;
use std::sync::Mutex;

use tracing::error;

const SERVICE: &str = "Pangolin: pangolin-windows";

/// Key-value secrets sink backed by the OS credential vault. Abstract so the
/// auth and tunnel layers can be exercised without touching the real vault.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> bool;
    fn delete(&self, key: &str) -> bool;

    fn session_token(&self, user_id: &str) -> Option<String> {
        self.get(&session_token_key(user_id))
    }

    fn save_session_token(&self, user_id: &str, token: &str) -> bool {
        self.set(&session_token_key(user_id), token)
    }

    fn delete_session_token(&self, user_id: &str) -> bool {
        self.delete(&session_token_key(user_id))
    }

    /// Both halves or nothing: a single orphan half is discarded and reported
    /// as absent.
    fn olm_credentials(&self, user_id: &str) -> Option<(String, String)> {
        let id = self.get(&olm_id_key(user_id));
        let secret = self.get(&olm_secret_key(user_id));
        match (id, secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            (None, None) => None,
            _ => {
                self.delete_olm_credentials(user_id);
                None
            }
        }
    }

    fn save_olm_credentials(&self, user_id: &str, olm_id: &str, secret: &str) -> bool {
        let id_saved = self.set(&olm_id_key(user_id), olm_id);
        let secret_saved = self.set(&olm_secret_key(user_id), secret);
        id_saved && secret_saved
    }

    fn delete_olm_credentials(&self, user_id: &str) -> bool {
        let id_deleted = self.delete(&olm_id_key(user_id));
        let secret_deleted = self.delete(&olm_secret_key(user_id));
        id_deleted && secret_deleted
    }
}

fn session_token_key(user_id: &str) -> String {
    format!("session-token-{user_id}")
}

fn olm_id_key(user_id: &str) -> String {
    format!("olm-id-{user_id}")
}

fn olm_secret_key(user_id: &str) -> String {
    format!("olm-secret-{user_id}")
}

/// Windows Credential Manager store under a fixed service label.
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(SERVICE, key)
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        Self::entry(key).ok()?.get_password().ok()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        // The vault has no update; replace wholesale.
        let _ = self.delete(key);
        let entry = match Self::entry(key) {
            Ok(entry) => entry,
            Err(err) => {
                error!("failed to open credential entry for {key}: {err}");
                return false;
            }
        };
        match entry.set_password(value) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to save secret for {key}: {err}");
                false
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        match Self::entry(key).and_then(|entry| entry.delete_credential()) {
            Ok(()) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(_) => false,
        }
    }
}

/// In-memory store for tests and for composition without a vault.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.values.lock().unwrap().remove(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_round_trips() {
        let store = MemorySecretStore::new();
        assert!(store.save_session_token("u1", "T1"));
        assert_eq!(store.session_token("u1").as_deref(), Some("T1"));
        assert!(store.delete_session_token("u1"));
        assert!(store.session_token("u1").is_none());
    }

    #[test]
    fn orphan_olm_half_is_discarded() {
        let store = MemorySecretStore::new();
        store.set("olm-id-u1", "olm-abc");
        assert!(store.olm_credentials("u1").is_none());
        // The orphan id was cleaned up too.
        assert!(store.get("olm-id-u1").is_none());
    }

    #[test]
    fn olm_pair_round_trips() {
        let store = MemorySecretStore::new();
        assert!(store.save_olm_credentials("u1", "olm-abc", "s3cret"));
        assert_eq!(
            store.olm_credentials("u1"),
            Some(("olm-abc".to_string(), "s3cret".to_string()))
        );
    }
}
