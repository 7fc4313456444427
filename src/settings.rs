//! Updater settings
//!
//! Loaded from `updater.toml` in the platform config directory. Every field
//! has a default, so a missing or partial file is fine.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "updater.toml";
const LOG_DIR: &str = "logs";

pub const DEFAULT_FEED_URL: &str =
    "https://api.github.com/repos/Dolcruz/stt-desktop/releases/latest";

#[cfg(windows)]
pub const DEFAULT_ASSET_NAME: &str = "STTDesktop.exe";
#[cfg(not(windows))]
pub const DEFAULT_ASSET_NAME: &str = "stt-desktop";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "STTDesktop")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    /// GitHub "latest release" endpoint
    pub feed_url: String,
    /// Exact (case-sensitive) name of the release asset to install
    pub asset_name: String,
    /// Where the installed version is recorded; `VERSION` beside the exe when unset
    pub version_file: Option<PathBuf>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest wait for the download response or its next chunk
    pub stall_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub require_checksum: bool,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            asset_name: DEFAULT_ASSET_NAME.to_string(),
            version_file: None,
            user_agent: format!("stt-updater/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 10,
            connect_timeout_secs: 15,
            stall_timeout_secs: 60,
            progress_interval_ms: 100,
            retry_delay_ms: 1000,
            require_checksum: false,
        }
    }
}

impl UpdaterSettings {
    /// Load from the default location, falling back to defaults
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("no config directory available, using default settings");
                Self::default()
            }
        }
    }

    /// Load from `path`; a missing file yields defaults, a broken one is logged and ignored
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "cannot read settings: {}", e);
                return Self::default();
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(settings) => {
                tracing::debug!(path = %path.display(), "loaded settings");
                settings.validated()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "invalid settings file, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// `<config dir>/updater.toml`
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// `<data dir>/logs`
    pub fn log_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_local_dir().join(LOG_DIR))
    }

    /// Version file for the executable at `exe`
    pub fn version_file_for(&self, exe: &Path) -> PathBuf {
        match &self.version_file {
            Some(path) => path.clone(),
            None => exe
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("VERSION"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Replace zero timeouts and blank names with defaults
    fn validated(mut self) -> Self {
        let defaults = Self::default();

        if !is_http_url(&self.feed_url) {
            tracing::warn!(feed_url = %self.feed_url, "feed_url is not an http(s) URL, using default");
            self.feed_url = defaults.feed_url;
        }
        if self.asset_name.trim().is_empty() {
            tracing::warn!("asset_name is empty, using default");
            self.asset_name = defaults.asset_name;
        }
        if self.user_agent.trim().is_empty() {
            self.user_agent = defaults.user_agent;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }
        if self.stall_timeout_secs == 0 {
            self.stall_timeout_secs = defaults.stall_timeout_secs;
        }
        self
    }
}

fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}
