//! Persistent connection and subscription history
//!
//! Histories are kept newest-first. Saving an entry with the same identity as
//! an existing one (host, port and client id for connections, topic for
//! subscriptions) moves it to the front instead of duplicating it, and each
//! history is capped.
//!
//! Passwords never appear in these records. They go to a [`SecretStore`], and
//! only when the user asked for the password to be saved.

use crate::session::{QoS, SessionParameters, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod file_store;
pub mod memory;

pub use file_store::FileSettingsStore;
pub use memory::{MemorySecretStore, MemorySettingsStore};

pub const DEFAULT_MAX_HISTORY: usize = 10;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Settings could not be rendered: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Secret store failure: {0}")]
    Secret(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// One remembered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub hostname: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    #[serde(default)]
    pub save_password: bool,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_clean_session() -> bool {
    true
}

impl ConnectionRecord {
    pub fn from_parameters(params: &SessionParameters, save_password: bool) -> Self {
        Self {
            hostname: params.host.clone(),
            port: params.port,
            client_id: params.client_id.clone(),
            username: params.username.clone(),
            save_password,
            clean_session: params.clean_session,
        }
    }

    /// Key used for this connection in a [`SecretStore`]
    pub fn secret_key(&self) -> String {
        format!("{}@{}:{}", self.client_id, self.hostname, self.port)
    }

    pub fn same_identity(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.port == other.port && self.client_id == other.client_id
    }

    pub fn to_parameters(&self, password: Option<String>) -> SessionParameters {
        let mut params = SessionParameters::new(self.hostname.clone(), self.port, self.client_id.clone())
            .with_clean_session(self.clean_session);
        params.username = self.username.clone();
        params.password = password;
        params
    }
}

/// One remembered subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

impl From<&Subscription> for SubscriptionRecord {
    fn from(subscription: &Subscription) -> Self {
        Self {
            topic: subscription.topic.clone(),
            qos: subscription.qos,
        }
    }
}

/// Storage for connection and subscription history
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Newest first
    async fn retrieve_connection_history(&self) -> SettingsResult<Vec<ConnectionRecord>>;

    /// Newest first
    async fn retrieve_subscription_history(&self) -> SettingsResult<Vec<SubscriptionRecord>>;

    async fn save_connection(&self, record: ConnectionRecord) -> SettingsResult<()>;

    async fn save_subscription(&self, record: SubscriptionRecord) -> SettingsResult<()>;
}

/// Credential storage keyed by [`ConnectionRecord::secret_key`]
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_password(&self, key: &str) -> SettingsResult<Option<String>>;

    async fn set_password(&self, key: &str, password: &str) -> SettingsResult<()>;

    async fn forget_password(&self, key: &str) -> SettingsResult<()>;
}

/// Both histories as one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,
}

impl SettingsDocument {
    pub fn add_connection(&mut self, record: ConnectionRecord, max_history: usize) {
        push_front_unique(&mut self.connections, record, ConnectionRecord::same_identity, max_history);
    }

    pub fn add_subscription(&mut self, record: SubscriptionRecord, max_history: usize) {
        push_front_unique(
            &mut self.subscriptions,
            record,
            |a, b| a.topic == b.topic,
            max_history,
        );
    }
}

/// Put `entry` first, dropping any entry with the same identity and anything
/// past `max_history`
pub fn push_front_unique<T>(
    history: &mut Vec<T>,
    entry: T,
    same: impl Fn(&T, &T) -> bool,
    max_history: usize,
) {
    history.retain(|existing| !same(existing, &entry));
    history.insert(0, entry);
    history.truncate(max_history.max(1));
}

/// Parameters from the most recent connection, with the saved password if any
pub async fn latest_parameters(
    store: &dyn SettingsStore,
    secrets: &dyn SecretStore,
) -> SettingsResult<Option<SessionParameters>> {
    let history = store.retrieve_connection_history().await?;
    let Some(latest) = history.into_iter().next() else {
        return Ok(None);
    };

    let password = if latest.save_password {
        secrets.get_password(&latest.secret_key()).await?
    } else {
        None
    };
    Ok(Some(latest.to_parameters(password)))
}

/// Record a connection after it was established. The password is written to
/// `secrets` only when `save_password` is set and cleared otherwise.
pub async fn remember_connection(
    store: &dyn SettingsStore,
    secrets: &dyn SecretStore,
    params: &SessionParameters,
    save_password: bool,
) -> SettingsResult<()> {
    if params.host.trim().is_empty() || params.port == 0 {
        debug!("Not remembering connection without host or port");
        return Ok(());
    }

    let record = ConnectionRecord::from_parameters(params, save_password);
    let key = record.secret_key();
    match (&params.password, save_password) {
        (Some(password), true) => secrets.set_password(&key, password).await?,
        _ => secrets.forget_password(&key).await?,
    }

    store.save_connection(record).await
}

pub async fn remember_subscription(
    store: &dyn SettingsStore,
    subscription: &Subscription,
) -> SettingsResult<()> {
    store.save_subscription(SubscriptionRecord::from(subscription)).await
}
