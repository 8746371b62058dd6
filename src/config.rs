//! Application settings and on-disk locations.
//!
//! Settings are a JSON file (`settings.json`) in the config directory. A
//! missing or unreadable file falls back to defaults, which are written back
//! so the user has a file to edit. [`SettingsStore`] is the shared, cloneable
//! handle that the download manager reads at task-build time.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default format-selection expression: best video plus best audio.
pub const DEFAULT_FORMAT: &str = "bv*+ba/best";

/// Default number of concurrent downloads.
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

/// Default extractor client identifier.
pub const DEFAULT_PLAYER_CLIENT: &str = "web";

/// Desktop browser user agent sent with engine requests.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Overrides every other location lookup when set.
pub const HOME_ENV: &str = "MEDIAQUEUE_HOME";

const APP_DIR: &str = "mediaqueue";
const SETTINGS_FILE: &str = "settings.json";
const DB_FILE: &str = "downloads.sqlite3";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing a config path failed.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings could not be serialized.
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Neither the override variable nor `HOME` is set.
    #[error("cannot locate a home directory\n  Suggestion: set HOME or {HOME_ENV}")]
    NoHomeDirectory,
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// User-editable settings.
///
/// Unknown keys are ignored and missing keys take their defaults, so files
/// written by older or newer releases still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory finished downloads are written to.
    pub download_dir: PathBuf,
    /// Worker pool size (at least 1).
    pub concurrent_downloads: usize,
    /// Default format-selection expression for newly queued items.
    pub format: String,
    /// Download audio only and convert to mp3.
    pub audio_only: bool,
    pub embed_subtitles: bool,
    pub embed_thumbnail: bool,
    pub user_agent: String,
    /// Netscape-format cookie file handed to the engine.
    pub cookies_file: Option<PathBuf>,
    /// Extractor client identifier (e.g. `web`, `android`).
    pub player_client: String,
    /// Read by the desktop UI only.
    pub clipboard_watch: bool,
    /// Read by the desktop UI only.
    pub theme: String,
}

impl Default for Settings {
    fn default() -> Self {
        let download_dir = env_var_non_empty_os("HOME")
            .map_or_else(|| PathBuf::from("."), |home| PathBuf::from(home).join("Downloads"));
        Self {
            download_dir,
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            format: DEFAULT_FORMAT.to_string(),
            audio_only: false,
            embed_subtitles: false,
            embed_thumbnail: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookies_file: None,
            player_client: DEFAULT_PLAYER_CLIENT.to_string(),
            clipboard_watch: true,
            theme: "Dark".to_string(),
        }
    }
}

impl Settings {
    /// Clamps out-of-range values into their valid range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.concurrent_downloads = self.concurrent_downloads.max(1);
        if self.format.trim().is_empty() {
            self.format = DEFAULT_FORMAT.to_string();
        }
        self
    }
}

/// Shared settings handle.
///
/// Clones share one in-memory copy; `update` persists to the backing file
/// when there is one.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    /// Loads settings from `path`, writing defaults when the file is missing
    /// or cannot be parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read, or
    /// if the defaults cannot be written.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let loaded = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
            match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => Some(settings.normalized()),
                Err(error) => {
                    warn!(path = %path.display(), %error, "invalid settings file, using defaults");
                    None
                }
            }
        } else {
            None
        };

        let store = Self {
            path: Some(path.to_path_buf()),
            current: Arc::new(RwLock::new(loaded.clone().unwrap_or_default())),
        };
        if loaded.is_none() {
            store.save(&store.snapshot())?;
        }
        Ok(store)
    }

    /// Creates a store that is never written to disk.
    #[must_use]
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(settings.normalized())),
        }
    }

    /// Returns a copy of the current settings.
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `change`, normalizes, and persists the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be written. The in-memory
    /// copy keeps the change either way.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings, ConfigError> {
        let updated = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            change(&mut *guard);
            *guard = guard.clone().normalized();
            guard.clone()
        };
        self.save(&updated)?;
        Ok(updated)
    }

    fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(path, json).map_err(|e| ConfigError::io(path, e))?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Resolves locations from the environment.
    ///
    /// Priority:
    /// 1. `$MEDIAQUEUE_HOME/{config,data}`
    /// 2. `$XDG_CONFIG_HOME/mediaqueue` and `$XDG_DATA_HOME/mediaqueue`
    /// 3. `$HOME/.config/mediaqueue` and `$HOME/.local/share/mediaqueue`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when no base can be found.
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Some(root) = env_var_non_empty_os(HOME_ENV) {
            return Ok(Self::under(Path::new(&root)));
        }

        let home = env_var_non_empty_os("HOME").map(PathBuf::from);
        let config_base = env_var_non_empty_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join(".config")))
            .ok_or(ConfigError::NoHomeDirectory)?;
        let data_base = env_var_non_empty_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join(".local").join("share")))
            .ok_or(ConfigError::NoHomeDirectory)?;

        Ok(Self {
            config_dir: config_base.join(APP_DIR),
            data_dir: data_base.join(APP_DIR),
        })
    }

    /// Places everything below a single root directory.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    #[must_use]
    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    #[must_use]
    pub fn thumb_dir(&self) -> PathBuf {
        self.data_dir.join("thumbs")
    }

    /// Creates every directory this layout refers to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] on the first directory that cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.config_dir.clone(),
            self.data_dir.clone(),
            self.thumb_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;
        }
        Ok(())
    }
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
