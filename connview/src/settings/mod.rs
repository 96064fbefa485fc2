//! Settings
//!
//! `Settings` is the one configuration struct of a dashboard. Part of it is
//! also held by the backend (cache bounds, database location) and is kept
//! consistent with it by `SettingsSync`; the rest is local only. Values the
//! user set are kept in a `LocalCache`, persisted by a `SettingsStore`.

pub mod store;
pub mod sync;

pub use store::{MemoryStore, SettingsError, SettingsStore, YamlStore};
pub use sync::{SettingsSync, UpdateError};

use crate::flow::model::Location;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Bound of the packet window. Non-positive means unbounded.
    pub max_packet_cache: i64,
    /// Bound of the flow table. Non-positive means unbounded.
    pub max_connections_cache: i64,
    pub db_path: String,
    pub db_download_url: String,
    pub connections_interval: Duration,
    pub packets_interval: Duration,
    pub summarized: bool,
    pub dark_theme: bool,
    /// Where this host is, when the backend cannot tell.
    pub fallback_location: Option<Location>,
    /// Address looked up through the backend to find this host.
    pub public_address: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_packet_cache: 100,
            max_connections_cache: 1_000_000,
            db_path: String::new(),
            db_download_url: String::new(),
            connections_interval: Duration::from_millis(1000),
            packets_interval: Duration::from_millis(1000),
            summarized: false,
            dark_theme: true,
            fallback_location: None,
            public_address: String::new(),
        }
    }
}

/// Values set by the user, as persisted. Absent entries fall back to the
/// backend (for backend-held settings) or to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCache {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_cache: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections_cache: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dark_theme: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

impl LocalCache {
    pub fn usable_max_packet_cache(&self) -> Option<i64> {
        self.max_packet_cache.filter(|v| *v > 0)
    }

    pub fn usable_max_connections_cache(&self) -> Option<i64> {
        self.max_connections_cache.filter(|v| *v > 0)
    }

    pub fn usable_db_path(&self) -> Option<&str> {
        self.db_path.as_deref().filter(|v| !v.is_empty())
    }

    pub fn usable_db_download_url(&self) -> Option<&str> {
        self.db_download_url.as_deref().filter(|v| !v.is_empty())
    }
}

impl Settings {
    /// Defaults overridden by whatever the cache holds.
    pub fn from_cache(cache: &LocalCache) -> Settings {
        let mut settings = Settings::default();
        if let Some(v) = cache.usable_max_packet_cache() {
            settings.max_packet_cache = v;
        }
        if let Some(v) = cache.usable_max_connections_cache() {
            settings.max_connections_cache = v;
        }
        if let Some(v) = cache.usable_db_path() {
            settings.db_path = v.to_string();
        }
        if let Some(v) = cache.usable_db_download_url() {
            settings.db_download_url = v.to_string();
        }
        if let Some(ms) = cache.connections_interval_ms.filter(|ms| *ms > 0) {
            settings.connections_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = cache.packets_interval_ms.filter(|ms| *ms > 0) {
            settings.packets_interval = Duration::from_millis(ms);
        }
        if let Some(v) = cache.summarized {
            settings.summarized = v;
        }
        if let Some(v) = cache.dark_theme {
            settings.dark_theme = v;
        }
        if let (Some(lon), Some(lat)) = (cache.local_longitude, cache.local_latitude) {
            settings.fallback_location = Some(Location::new(lon, lat));
        }
        if let Some(v) = &cache.public_address {
            settings.public_address = v.clone();
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusable_cache_values_keep_defaults() {
        let cache = LocalCache {
            max_packet_cache: Some(0),
            max_connections_cache: Some(-5),
            db_path: Some(String::new()),
            packets_interval_ms: Some(250),
            local_longitude: Some(13.4),
            ..Default::default()
        };
        let settings = Settings::from_cache(&cache);
        assert_eq!(settings.max_packet_cache, 100);
        assert_eq!(settings.max_connections_cache, 1_000_000);
        assert_eq!(settings.db_path, "");
        assert_eq!(settings.packets_interval, Duration::from_millis(250));
        // Both coordinates are needed.
        assert_eq!(settings.fallback_location, None);
    }
}
