//! Shared, read-mostly settings

use crate::error::DownloadError;
use crate::storage::{KeyValueStore, SETTINGS_KEY};
use dltrack_types::Settings;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// Cheaply cloneable view of the current [`Settings`]
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings
    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.inner.write() = settings;
    }
}

/// Read settings from the store, falling back to defaults if absent or unreadable
pub async fn load_settings(store: &dyn KeyValueStore) -> Settings {
    match store.get(SETTINGS_KEY).await {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Stored settings are unreadable, using defaults: {}", e);
            Settings::default()
        }),
        Ok(None) => Settings::default(),
        Err(e) => {
            warn!("Failed to read settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

pub async fn save_settings(store: &dyn KeyValueStore, settings: &Settings) -> Result<(), DownloadError> {
    let json = serde_json::to_string(settings)?;
    store.set(SETTINGS_KEY, &json).await
}
