use super::LocalCache;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file: {0}")]
    Io(#[from] io::Error),
    #[error("settings file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no configuration directory on this platform")]
    NoConfigDir,
}

/// Where the local cache lives between runs.
pub trait SettingsStore {
    fn load(&self) -> Result<LocalCache, SettingsError>;
    fn save(&self, cache: &LocalCache) -> Result<(), SettingsError>;
}

/// Keeps the cache in a YAML file.
#[derive(Debug, Clone)]
pub struct YamlStore {
    path: PathBuf,
}

impl YamlStore {
    pub fn new(path: impl Into<PathBuf>) -> YamlStore {
        YamlStore { path: path.into() }
    }

    /// `<config dir>/connview/settings.yaml`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(dir.join("connview").join("settings.yaml"))
    }

    pub fn open_default() -> Result<YamlStore, SettingsError> {
        Ok(YamlStore::new(Self::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for YamlStore {
    fn load(&self) -> Result<LocalCache, SettingsError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LocalCache::default()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(LocalCache::default());
        }
        Ok(serde_yaml::from_str(&text)?)
    }

    fn save(&self, cache: &LocalCache) -> Result<(), SettingsError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = serde_yaml::to_string(cache)?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps the cache in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cache: Mutex<LocalCache>,
}

impl MemoryStore {
    pub fn new(cache: LocalCache) -> MemoryStore {
        MemoryStore {
            cache: Mutex::new(cache),
        }
    }

    pub fn snapshot(&self) -> LocalCache {
        match self.cache.lock() {
            Ok(cache) => cache.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<LocalCache, SettingsError> {
        Ok(self.snapshot())
    }

    fn save(&self, cache: &LocalCache) -> Result<(), SettingsError> {
        match self.cache.lock() {
            Ok(mut stored) => *stored = cache.clone(),
            Err(poisoned) => *poisoned.into_inner() = cache.clone(),
        }
        Ok(())
    }
}

impl<T: SettingsStore + ?Sized> SettingsStore for &T {
    fn load(&self) -> Result<LocalCache, SettingsError> {
        (**self).load()
    }

    fn save(&self, cache: &LocalCache) -> Result<(), SettingsError> {
        (**self).save(cache)
    }
}
