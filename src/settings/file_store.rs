//! TOML-file settings store
//!
//! Both histories live in one TOML document. The file is created on the first
//! save; a missing file reads as empty history. Writes go to a sibling
//! temporary file that is then renamed over the original.

use super::{
    ConnectionRecord, SettingsDocument, SettingsResult, SettingsStore, SubscriptionRecord,
    DEFAULT_MAX_HISTORY,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    max_history: usize,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_history(path, DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(path: impl Into<PathBuf>, max_history: usize) -> Self {
        Self {
            path: path.into(),
            max_history: max_history.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> SettingsResult<SettingsDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(SettingsDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, document: &SettingsDocument) -> SettingsResult<()> {
        let content = toml::to_string_pretty(document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("toml.tmp");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }

    async fn update(&self, apply: impl FnOnce(&mut SettingsDocument) + Send) -> SettingsResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        apply(&mut document);
        self.store(&document).await
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn retrieve_connection_history(&self) -> SettingsResult<Vec<ConnectionRecord>> {
        Ok(self.load().await?.connections)
    }

    async fn retrieve_subscription_history(&self) -> SettingsResult<Vec<SubscriptionRecord>> {
        Ok(self.load().await?.subscriptions)
    }

    async fn save_connection(&self, record: ConnectionRecord) -> SettingsResult<()> {
        let max = self.max_history;
        self.update(move |doc| doc.add_connection(record, max)).await
    }

    async fn save_subscription(&self, record: SubscriptionRecord) -> SettingsResult<()> {
        let max = self.max_history;
        self.update(move |doc| doc.add_subscription(record, max)).await
    }
}
