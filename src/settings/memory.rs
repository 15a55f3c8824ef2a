//! In-memory settings and secret stores for tests and ephemeral runs

use super::{
    ConnectionRecord, SecretStore, SettingsDocument, SettingsResult, SettingsStore,
    SubscriptionRecord, DEFAULT_MAX_HISTORY,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct MemorySettingsStore {
    document: Mutex<SettingsDocument>,
    max_history: usize,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            document: Mutex::new(SettingsDocument::default()),
            max_history: max_history.max(1),
        }
    }

    pub async fn snapshot(&self) -> SettingsDocument {
        self.document.lock().await.clone()
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn retrieve_connection_history(&self) -> SettingsResult<Vec<ConnectionRecord>> {
        Ok(self.document.lock().await.connections.clone())
    }

    async fn retrieve_subscription_history(&self) -> SettingsResult<Vec<SubscriptionRecord>> {
        Ok(self.document.lock().await.subscriptions.clone())
    }

    async fn save_connection(&self, record: ConnectionRecord) -> SettingsResult<()> {
        self.document
            .lock()
            .await
            .add_connection(record, self.max_history);
        Ok(())
    }

    async fn save_subscription(&self, record: SubscriptionRecord) -> SettingsResult<()> {
        self.document
            .lock()
            .await
            .add_subscription(record, self.max_history);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    passwords: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.passwords.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.passwords.lock().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_password(&self, key: &str) -> SettingsResult<Option<String>> {
        Ok(self.passwords.lock().await.get(key).cloned())
    }

    async fn set_password(&self, key: &str, password: &str) -> SettingsResult<()> {
        self.passwords
            .lock()
            .await
            .insert(key.to_string(), password.to_string());
        Ok(())
    }

    async fn forget_password(&self, key: &str) -> SettingsResult<()> {
        self.passwords.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{QoS, SessionParameters, Subscription};
    use crate::settings::{latest_parameters, remember_connection, remember_subscription};

    #[tokio::test]
    async fn test_latest_parameters_empty() {
        let store = MemorySettingsStore::new();
        let secrets = MemorySecretStore::new();
        assert!(latest_parameters(&store, &secrets).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saved_password_restored() {
        let store = MemorySettingsStore::new();
        let secrets = MemorySecretStore::new();
        let params = SessionParameters::new("broker", 1883, "me").with_credentials("user", "pw");

        remember_connection(&store, &secrets, &params, true).await.unwrap();

        let restored = latest_parameters(&store, &secrets).await.unwrap().unwrap();
        assert_eq!(restored, params);
        // The record itself never carries the password
        let snapshot = store.snapshot().await;
        assert!(!toml::to_string(&snapshot).unwrap().contains("pw\""));
    }

    #[tokio::test]
    async fn test_unsaved_password_is_forgotten() {
        let store = MemorySettingsStore::new();
        let secrets = MemorySecretStore::new();
        let params = SessionParameters::new("broker", 1883, "me").with_credentials("user", "pw");

        remember_connection(&store, &secrets, &params, true).await.unwrap();
        remember_connection(&store, &secrets, &params, false).await.unwrap();

        assert!(secrets.is_empty().await);
        let restored = latest_parameters(&store, &secrets).await.unwrap().unwrap();
        assert_eq!(restored.username.as_deref(), Some("user"));
        assert!(restored.password.is_none());
        assert_eq!(store.retrieve_connection_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_host_not_remembered() {
        let store = MemorySettingsStore::new();
        let secrets = MemorySecretStore::new();
        remember_connection(&store, &secrets, &SessionParameters::new("  ", 1883, "me"), false)
            .await
            .unwrap();
        assert!(store.retrieve_connection_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remember_subscription_newest_first() {
        let store = MemorySettingsStore::with_max_history(2);
        for topic in ["a", "b", "a", "c"] {
            let subscription = Subscription {
                topic: topic.into(),
                qos: QoS::AtLeastOnce,
            };
            remember_subscription(&store, &subscription).await.unwrap();
        }

        let topics: Vec<_> = store
            .retrieve_subscription_history()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.topic)
            .collect();
        assert_eq!(topics, vec!["c", "a"]);
    }
}
