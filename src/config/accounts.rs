use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::error;

use super::{local_data_dir, ACCOUNTS_FILE_NAME};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub email: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    pub username: String,
    pub name: String,
    pub hostname: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(rename = "activeUserId")]
    active_user_id: String,
    accounts: HashMap<String, Account>,
}

/// Known accounts plus the active user id, persisted as `accounts.json`.
/// Invariant: the active user id is empty or keys an entry in the map.
pub struct AccountStore {
    path: PathBuf,
    state: RwLock<AccountsFile>,
}

impl AccountStore {
    pub fn new() -> Self {
        let dir = local_data_dir();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            error!("failed to create config directory: {err}");
        }
        Self::with_path(dir.join(ACCOUNTS_FILE_NAME))
    }

    pub fn with_path(path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|err| {
                error!("failed to parse accounts file: {err}");
                AccountsFile::default()
            }),
            Err(_) => AccountsFile::default(),
        };
        let store = Self {
            path,
            state: RwLock::new(state),
        };
        store.save_current();
        store
    }

    pub fn add_account(&self, account: Account) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        state.accounts.insert(account.user_id.clone(), account);
        save(&self.path, &state)
    }

    pub fn remove_account(&self, user_id: &str) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        state.accounts.remove(user_id);
        if state.active_user_id == user_id {
            state.active_user_id.clear();
        }
        save(&self.path, &state)
    }

    pub fn active_account(&self) -> Option<Account> {
        let state = self.state.read().unwrap();
        if state.active_user_id.is_empty() {
            return None;
        }
        state.accounts.get(&state.active_user_id).cloned()
    }

    pub fn active_user_id(&self) -> String {
        self.state.read().unwrap().active_user_id.clone()
    }

    pub fn account(&self, user_id: &str) -> Option<Account> {
        self.state.read().unwrap().accounts.get(user_id).cloned()
    }

    pub fn accounts(&self) -> Vec<Account> {
        let mut list: Vec<Account> = self
            .state
            .read()
            .unwrap()
            .accounts
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }

    pub fn set_active_user(&self, user_id: &str) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        if !state.accounts.contains_key(user_id) {
            return Err("account does not exist".to_string());
        }
        state.active_user_id = user_id.to_string();
        save(&self.path, &state)
    }

    pub fn set_user_organization(&self, user_id: &str, org_id: &str) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        match state.accounts.get_mut(user_id) {
            Some(account) => account.org_id = org_id.to_string(),
            None => return Err("account does not exist".to_string()),
        }
        save(&self.path, &state)
    }

    pub fn update_account_user_info(
        &self,
        user_id: &str,
        username: &str,
        name: &str,
    ) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        match state.accounts.get_mut(user_id) {
            Some(account) => {
                account.username = username.to_string();
                account.name = name.to_string();
            }
            None => return Err("account does not exist".to_string()),
        }
        save(&self.path, &state)
    }

    fn save_current(&self) {
        let state = self.state.read().unwrap();
        if let Err(err) = save(&self.path, &state) {
            error!("failed to write accounts file: {err}");
        }
    }
}

fn save(path: &PathBuf, state: &AccountsFile) -> Result<(), String> {
    let data = serde_json::to_string_pretty(state).map_err(|err| err.to_string())?;
    std::fs::write(path, data).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        Account {
            user_id: "u1".to_string(),
            email: "a@b".to_string(),
            org_id: "o1".to_string(),
            username: "alice".to_string(),
            name: "Alice".to_string(),
            hostname: "https://app.example.net".to_string(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> AccountStore {
        AccountStore::with_path(dir.path().join(ACCOUNTS_FILE_NAME))
    }

    #[test]
    fn add_then_active_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let account = sample_account();
        store.add_account(account.clone()).unwrap();
        store.set_active_user("u1").unwrap();
        assert_eq!(store.active_account().unwrap(), account);

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.active_account().unwrap(), account);
    }

    #[test]
    fn remove_active_clears_active_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_account(sample_account()).unwrap();
        store.set_active_user("u1").unwrap();
        store.remove_account("u1").unwrap();
        assert!(store.active_account().is_none());
        assert_eq!(store.active_user_id(), "");
    }

    #[test]
    fn set_active_requires_existing_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.set_active_user("missing").is_err());
    }

    #[test]
    fn org_selection_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_account(sample_account()).unwrap();
        store.set_user_organization("u1", "o2").unwrap();
        assert_eq!(store.account("u1").unwrap().org_id, "o2");
    }
}
