use std::path::Path;

use chrono::{DateTime, Utc};
use mbs_platform::AppPaths;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REPOSITORY: &str = "nevretem-der/mbs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// `owner/repo` whose latest release is checked.
    #[serde(default = "default_repository")]
    pub repository: String,

    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Release the user asked not to be reminded about at startup.
    #[serde(default)]
    pub skipped_version: Option<String>,

    #[serde(default)]
    pub last_update_check: Option<DateTime<Utc>>,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,

    #[serde(default = "default_helper_max_polls")]
    pub helper_max_polls: u32,

    #[serde(default = "default_helper_poll_interval")]
    pub helper_poll_interval_secs: u32,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_repository() -> String {
    DEFAULT_REPOSITORY.to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    600
}

fn default_extraction_timeout() -> u64 {
    60
}

fn default_helper_max_polls() -> u32 {
    mbs_core::install::DEFAULT_MAX_POLLS
}

fn default_helper_poll_interval() -> u32 {
    mbs_core::install::DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            check_on_startup: true,
            skipped_version: None,
            last_update_check: None,
            debug_logging: false,
            http_timeout_secs: default_http_timeout(),
            download_timeout_secs: default_download_timeout(),
            extraction_timeout_secs: default_extraction_timeout(),
            helper_max_polls: default_helper_max_polls(),
            helper_poll_interval_secs: default_helper_poll_interval(),
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    pub fn load(paths: &AppPaths) -> Self {
        Self::load_from(&paths.settings_file())
    }

    /// Read settings from `path`. A missing or unreadable file yields the
    /// defaults, and missing fields take their default values.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring invalid settings file {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        paths.ensure_dirs()?;
        self.save_to(&paths.settings_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    /// Whether a startup check should bother the user about `version`.
    pub fn is_skipped(&self, version: &str) -> bool {
        self.skipped_version.as_deref().is_some_and(|skipped| {
            mbs_core::Version::parse(skipped) == mbs_core::Version::parse(version)
        })
    }
}
