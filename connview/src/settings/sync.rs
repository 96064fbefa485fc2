use super::store::{SettingsError, SettingsStore};
use super::{LocalCache, Settings};
use crate::flow::model::Location;
use crate::remote::{self, Backend, RemoteError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The new value is in effect but could not be persisted.
    #[error("could not save settings: {0}")]
    Store(#[from] SettingsError),
    /// The new value is in effect locally but the backend did not take it.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Owns the `Settings` and keeps them consistent with the local cache and
/// the backend. Other components only ever see them by reference.
pub struct SettingsSync<S: SettingsStore> {
    settings: Settings,
    cache: LocalCache,
    store: S,
}

impl<S: SettingsStore> SettingsSync<S> {
    pub fn load(store: S) -> Result<SettingsSync<S>, SettingsError> {
        let cache = store.load()?;
        Ok(SettingsSync {
            settings: Settings::from_cache(&cache),
            cache,
            store,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Reconciles backend-held settings after a (re)connect. A usable
    /// cached value wins and is pushed; otherwise the backend's value is
    /// adopted and cached. The summarization flag is only ever pushed.
    ///
    /// Returns the failures, none of which stops the others.
    pub fn synchronize<B: Backend + ?Sized>(&mut self, backend: &B) -> Vec<RemoteError> {
        let mut errors = Vec::new();

        match self.cache.usable_max_packet_cache() {
            Some(v) => {
                self.settings.max_packet_cache = v;
                errors.extend(backend.set_max_packet_cache(v).err());
            }
            None => match backend.get_max_packet_cache() {
                Ok(v) => {
                    self.settings.max_packet_cache = v;
                    self.cache.max_packet_cache = Some(v);
                }
                Err(e) => errors.push(e),
            },
        }

        match self.cache.usable_max_connections_cache() {
            Some(v) => {
                self.settings.max_connections_cache = v;
                errors.extend(backend.set_max_connections_cache(v).err());
            }
            None => match backend.get_max_connections_cache() {
                Ok(v) => {
                    self.settings.max_connections_cache = v;
                    self.cache.max_connections_cache = Some(v);
                }
                Err(e) => errors.push(e),
            },
        }

        match self.cache.usable_db_path().map(str::to_string) {
            Some(v) => {
                errors.extend(backend.set_db_path(&v).err());
                self.settings.db_path = v;
            }
            None => match backend.get_db_path() {
                Ok(v) => {
                    self.settings.db_path = v.clone();
                    self.cache.db_path = Some(v);
                }
                Err(e) => errors.push(e),
            },
        }

        match self.cache.usable_db_download_url().map(str::to_string) {
            Some(v) => {
                errors.extend(backend.set_db_download_url(&v).err());
                self.settings.db_download_url = v;
            }
            None => match backend.get_db_download_url() {
                Ok(v) => {
                    self.settings.db_download_url = v.clone();
                    self.cache.db_download_url = Some(v);
                }
                Err(e) => errors.push(e),
            },
        }

        errors.extend(backend.set_is_summarized(self.settings.summarized).err());

        if let Err(e) = self.store.save(&self.cache) {
            tracing::warn!(error = %e, "could not save settings");
        }
        for e in &errors {
            tracing::warn!(error = %e, "settings synchronization");
        }
        errors
    }

    fn persist(&self) -> Result<(), SettingsError> {
        self.store.save(&self.cache)
    }

    /// Persists, then pushes. Both are attempted; the store failure is
    /// reported first.
    fn persist_and_push(&self, push: remote::Result<()>) -> Result<(), UpdateError> {
        let saved = self.persist();
        match (saved, push) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e.into()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(store), Err(remote)) => {
                tracing::warn!(error = %remote, "settings push failed");
                Err(store.into())
            }
        }
    }

    pub fn set_max_packet_cache<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        size: i64,
    ) -> Result<(), UpdateError> {
        self.settings.max_packet_cache = size;
        self.cache.max_packet_cache = Some(size);
        self.persist_and_push(backend.set_max_packet_cache(size))
    }

    pub fn set_max_connections_cache<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        size: i64,
    ) -> Result<(), UpdateError> {
        self.settings.max_connections_cache = size;
        self.cache.max_connections_cache = Some(size);
        self.persist_and_push(backend.set_max_connections_cache(size))
    }

    pub fn set_db_path<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        path: &str,
    ) -> Result<(), UpdateError> {
        self.settings.db_path = path.to_string();
        self.cache.db_path = Some(path.to_string());
        self.persist_and_push(backend.set_db_path(path))
    }

    pub fn set_db_download_url<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        url: &str,
    ) -> Result<(), UpdateError> {
        self.settings.db_download_url = url.to_string();
        self.cache.db_download_url = Some(url.to_string());
        self.persist_and_push(backend.set_db_download_url(url))
    }

    pub fn set_summarized<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        summarized: bool,
    ) -> Result<(), UpdateError> {
        self.settings.summarized = summarized;
        self.cache.summarized = Some(summarized);
        self.persist_and_push(backend.set_is_summarized(summarized))
    }

    pub fn set_intervals(
        &mut self,
        connections: Duration,
        packets: Duration,
    ) -> Result<(), SettingsError> {
        self.settings.connections_interval = connections;
        self.settings.packets_interval = packets;
        self.cache.connections_interval_ms = Some(connections.as_millis() as u64);
        self.cache.packets_interval_ms = Some(packets.as_millis() as u64);
        self.persist()
    }

    pub fn set_dark_theme(&mut self, dark: bool) -> Result<(), SettingsError> {
        self.settings.dark_theme = dark;
        self.cache.dark_theme = Some(dark);
        self.persist()
    }

    pub fn set_fallback_location(&mut self, location: Option<Location>) -> Result<(), SettingsError> {
        self.settings.fallback_location = location;
        self.cache.local_longitude = location.map(|l| l.longitude);
        self.cache.local_latitude = location.map(|l| l.latitude);
        self.persist()
    }

    pub fn set_public_address(&mut self, address: &str) -> Result<(), SettingsError> {
        self.settings.public_address = address.to_string();
        self.cache.public_address = Some(address.to_string());
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockBackend;
    use crate::settings::MemoryStore;

    #[test]
    fn empty_cache_adopts_backend_values() {
        let backend = MockBackend::new();
        backend.set_max_packet_cache(500).unwrap();
        backend.set_db_path("/srv/geo.mmdb").unwrap();

        let store = MemoryStore::default();
        let mut sync = SettingsSync::load(&store).unwrap();
        let errors = sync.synchronize(&backend);
        assert!(errors.is_empty());
        assert_eq!(sync.settings().max_packet_cache, 500);
        assert_eq!(sync.settings().max_connections_cache, 1_000_000);
        assert_eq!(sync.settings().db_path, "/srv/geo.mmdb");

        let cached = store.snapshot();
        assert_eq!(cached.max_packet_cache, Some(500));
        assert_eq!(cached.db_path.as_deref(), Some("/srv/geo.mmdb"));
        // The download URL was empty on the backend too.
        assert_eq!(cached.db_download_url.as_deref(), Some(""));
    }

    #[test]
    fn cached_values_win_and_are_pushed() {
        let backend = MockBackend::new();
        let store = MemoryStore::new(LocalCache {
            max_packet_cache: Some(42),
            db_download_url: Some("https://example.com/db".into()),
            summarized: Some(true),
            ..Default::default()
        });
        let mut sync = SettingsSync::load(&store).unwrap();
        assert!(sync.synchronize(&backend).is_empty());
        assert_eq!(backend.get_max_packet_cache().unwrap(), 42);
        assert_eq!(backend.get_db_download_url().unwrap(), "https://example.com/db");
        assert!(backend.is_summarized());
        assert!(!backend.calls().contains(&"GetMaxPacketCache"));
    }

    #[test]
    fn push_failure_keeps_local_value() {
        let backend = MockBackend::new();
        backend.fail("SetMaxConnectionsCache");
        let store = MemoryStore::default();
        let mut sync = SettingsSync::load(&store).unwrap();

        let err = sync.set_max_connections_cache(&backend, 10).unwrap_err();
        assert!(matches!(err, UpdateError::Remote(ref e) if e.operation == "SetMaxConnectionsCache"));
        assert_eq!(sync.settings().max_connections_cache, 10);
        assert_eq!(store.snapshot().max_connections_cache, Some(10));
    }

    #[test]
    fn synchronize_collects_every_failure() {
        let backend = MockBackend::new();
        backend.fail("GetMaxPacketCache");
        backend.fail("SetIsSummarized");
        let mut sync = SettingsSync::load(MemoryStore::default()).unwrap();
        let errors = sync.synchronize(&backend);
        let ops: Vec<_> = errors.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec!["GetMaxPacketCache", "SetIsSummarized"]);
        assert_eq!(sync.settings().max_packet_cache, 100);
        assert!(backend.calls().contains(&"GetDBPath"));
    }
}
