use std::path::PathBuf;
use thiserror::Error;

const APP_DIR_NAME: &str = "mbs";
const STAGING_DIR_NAME: &str = "mbs_update_extracted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine cache directory")]
    CacheDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build application paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory (for example the user
    /// home/config/cache/data directory) cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().ok_or(AppPathsError::HomeDirUnavailable)?;
            Ok(Self {
                config_dir: home.join("Library/Application Support").join(APP_DIR_NAME),
                cache_dir: home.join("Library/Caches").join(APP_DIR_NAME),
                data_dir: home.join("Library/Application Support").join(APP_DIR_NAME),
            })
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(Self {
                config_dir: dirs::config_dir()
                    .ok_or(AppPathsError::ConfigDirUnavailable)?
                    .join(APP_DIR_NAME),
                cache_dir: dirs::cache_dir()
                    .ok_or(AppPathsError::CacheDirUnavailable)?
                    .join(APP_DIR_NAME),
                data_dir: dirs::data_dir()
                    .ok_or(AppPathsError::DataDirUnavailable)?
                    .join(APP_DIR_NAME),
            })
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("debug.log")
    }

    /// Log file the detached update helper appends to on platforms without a
    /// console window of its own.
    #[must_use]
    pub fn helper_log_file(&self) -> PathBuf {
        self.data_dir.join("updater.log")
    }

    #[must_use]
    pub fn update_lock_file(&self) -> PathBuf {
        self.data_dir.join("update.lock")
    }

    /// Written by the update helper when it could not copy the new files.
    #[must_use]
    pub fn update_failure_file(&self) -> PathBuf {
        self.data_dir.join("update_failed")
    }

    /// Download target for an update package. Only the final path component
    /// of `asset_name` is used.
    #[must_use]
    pub fn update_package_file(&self, asset_name: &str) -> PathBuf {
        let file_name = std::path::Path::new(asset_name)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty() && !name.contains(".."))
            .unwrap_or("mbs_update.zip");
        self.cache_dir.join(file_name)
    }

    #[must_use]
    pub fn update_staging_dir(&self) -> PathBuf {
        self.cache_dir.join(STAGING_DIR_NAME)
    }

    /// Ensure all application directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::AppPaths;

    fn test_paths(root: &Path) -> AppPaths {
        AppPaths {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    #[test]
    fn file_paths_use_expected_filenames() {
        let paths = test_paths(Path::new("/tmp/mbs-paths"));

        assert!(
            paths
                .settings_file()
                .ends_with(Path::new("config").join("settings.json"))
        );
        assert!(paths.log_file().ends_with(Path::new("data").join("debug.log")));
        assert!(
            paths
                .update_lock_file()
                .ends_with(Path::new("data").join("update.lock"))
        );
        assert!(
            paths
                .update_failure_file()
                .ends_with(Path::new("data").join("update_failed"))
        );
        assert!(
            paths
                .update_staging_dir()
                .ends_with(Path::new("cache").join("mbs_update_extracted"))
        );
    }

    #[test]
    fn update_package_file_keeps_only_the_file_name() {
        let paths = test_paths(Path::new("/tmp/mbs-paths"));

        assert!(
            paths
                .update_package_file("MBS-1.2.0-win64.zip")
                .ends_with(Path::new("cache").join("MBS-1.2.0-win64.zip"))
        );
        assert!(
            paths
                .update_package_file("../../etc/passwd")
                .ends_with(Path::new("cache").join("passwd"))
        );
        assert!(
            paths
                .update_package_file("..")
                .ends_with(Path::new("cache").join("mbs_update.zip"))
        );
        assert!(
            paths
                .update_package_file("")
                .ends_with(Path::new("cache").join("mbs_update.zip"))
        );
    }

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = test_paths(temp.path());

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create application directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.cache_dir.is_dir());
        assert!(paths.data_dir.is_dir());
    }
}
