//! The update flow: check, offer, download, extract and hand off to the
//! installation helper.
//!
//! Every step runs to completion before the next starts. The only operation
//! that may run concurrently with a step is [`CancelHandle::cancel`] during
//! the download.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mbs_core::{
    AppUpdate, DownloadError, ExtractError, HelperOptions, HelperScript, InstallPlan,
    InstallationSwapper, PackageDownloader, PackageExtractor, ReleaseFeed, UpdateCheck,
    UpdateProgress, compute_install_plan, is_installer_package, run_installer, verify_sha256,
};
use mbs_platform::AppPaths;
use tokio::sync::mpsc;

use super::async_helpers::run_with_timeout;
use crate::error::{AppError, AppErrorDetail};
use crate::settings::AppSettings;
use crate::state::UpdateState;
use crate::update_lock::{LockError, UpdateLock};

/// Outcome of a check, as presented to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    UpdateAvailable(AppUpdate),
    UpToDate { latest: String },
    CheckFailed(AppError),
}

/// Where packages are staged and which installation they replace.
#[derive(Debug, Clone)]
pub struct UpdateLayout {
    pub paths: AppPaths,
    pub install_dir: PathBuf,
    pub executable_name: String,
}

impl UpdateLayout {
    /// Target the installation the running executable belongs to.
    pub fn for_current_exe(paths: AppPaths) -> Result<Self, AppError> {
        let exe = std::env::current_exe().map_err(|error| {
            AppError::message(format!("Cannot locate the running executable: {error}"))
        })?;
        let install_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| AppError::message("The running executable has no parent directory"))?;
        let executable_name = exe
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::message("The running executable has no usable file name"))?;

        Ok(Self {
            paths,
            install_dir,
            executable_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    /// Mirror the extracted files over the installation.
    Swap(InstallPlan),
    /// Run the downloaded installer package.
    RunInstaller,
}

/// A verified, unpacked update waiting for the final hand-off. Holds the
/// update lock until the process exits or the value is dropped.
#[derive(Debug)]
pub struct PendingInstall {
    pub package: PathBuf,
    pub action: InstallAction,
    _lock: UpdateLock,
}

#[derive(Debug)]
pub enum AcceptOutcome {
    ReadyToInstall(PendingInstall),
    /// The release has no package; its page was opened instead.
    OpenedReleasePage(String),
    /// The download was cancelled; the update is still on offer.
    Cancelled,
}

/// Cancels the download of the attempt in progress. Cheap to clone and safe
/// to use from any task.
#[derive(Clone)]
pub struct CancelHandle(Arc<PackageDownloader>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// A copy failure the update helper of an earlier run recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousInstallFailure {
    /// `None` when the marker could not be read.
    pub exit_code: Option<i32>,
    pub helper_log: PathBuf,
}

/// Pick up, and clear, the failure marker the update helper leaves behind
/// when it could not copy the new files.
pub fn take_install_failure(paths: &AppPaths) -> Option<PreviousInstallFailure> {
    let marker = paths.update_failure_file();
    let contents = match std::fs::read_to_string(&marker) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            warn!("Cannot read {}: {error}", marker.display());
            String::new()
        }
    };
    if let Err(error) = std::fs::remove_file(&marker) {
        warn!("Cannot remove {}: {error}", marker.display());
    }

    let exit_code = contents.trim().parse().ok();
    warn!("Previous update was not installed, helper copy exit code {exit_code:?}");
    Some(PreviousInstallFailure {
        exit_code,
        helper_log: paths.helper_log_file(),
    })
}

type PageOpener = Box<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

fn open_in_browser(url: &str) -> std::io::Result<()> {
    open::that(url)
}

pub struct UpdateOrchestrator {
    feed: ReleaseFeed,
    downloader: Arc<PackageDownloader>,
    extractor: PackageExtractor,
    layout: UpdateLayout,
    current_version: String,
    check_timeout: Duration,
    helper_max_polls: u32,
    helper_poll_interval_secs: u32,
    open_page: PageOpener,
    state: UpdateState,
    offered: Option<AppUpdate>,
}

impl UpdateOrchestrator {
    pub fn new(settings: &AppSettings, layout: UpdateLayout) -> Result<Self, AppError> {
        let http_timeout = Duration::from_secs(settings.http_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(http_timeout)
            .build()
            .map_err(|error| AppError::message(format!("Failed to build HTTP client: {error}")))?;
        let downloader = PackageDownloader::new(
            http_timeout,
            Duration::from_secs(settings.download_timeout_secs),
        )
        .map_err(|error| AppError::auto_update_failed("setup", error))?;

        Ok(Self {
            feed: ReleaseFeed::new(client),
            downloader: Arc::new(downloader),
            extractor: PackageExtractor::with_default_backend(Duration::from_secs(
                settings.extraction_timeout_secs,
            )),
            layout,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            check_timeout: http_timeout,
            helper_max_polls: settings.helper_max_polls,
            helper_poll_interval_secs: settings.helper_poll_interval_secs,
            open_page: Box::new(open_in_browser),
            state: UpdateState::Idle,
            offered: None,
        })
    }

    #[must_use]
    pub fn with_feed(mut self, feed: ReleaseFeed) -> Self {
        self.feed = feed;
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: PackageExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }

    #[must_use]
    pub fn with_page_opener(
        mut self,
        opener: impl Fn(&str) -> std::io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.open_page = Box::new(opener);
        self
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn offered_update(&self) -> Option<&AppUpdate> {
        self.offered.as_ref()
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.downloader))
    }

    /// Look for a newer release of `repository`.
    ///
    /// Returns the single event to present, or `None` when a silent check
    /// found nothing worth mentioning.
    pub async fn check(&mut self, repository: &str, silent: bool) -> Option<UpdateEvent> {
        if self.state.is_busy() {
            warn!("Ignoring update check while {:?}", self.state);
            return Some(UpdateEvent::CheckFailed(AppError::UpdateInProgress));
        }

        self.state = UpdateState::Checking;
        self.offered = None;
        info!(
            "Checking {repository} for updates (current {}, silent: {silent})",
            self.current_version
        );

        let result = run_with_timeout(
            self.check_timeout,
            "Update check",
            self.feed.check_for_update(repository, &self.current_version),
            AppError::from,
        )
        .await;

        match result {
            Ok(UpdateCheck::Available(update)) => {
                self.state = UpdateState::UpdateOffered;
                self.offered = Some(update.clone());
                Some(UpdateEvent::UpdateAvailable(update))
            }
            Ok(UpdateCheck::UpToDate { latest }) => {
                self.state = UpdateState::UpToDate;
                (!silent).then_some(UpdateEvent::UpToDate { latest })
            }
            Err(error @ AppError::NoReleasesPublished { .. }) if silent => {
                debug!("Silent check: {error}");
                self.state = UpdateState::Idle;
                None
            }
            Err(error) => {
                warn!("Update check failed: {error}");
                self.state = UpdateState::Failed {
                    phase: "check",
                    error: error.clone(),
                };
                Some(UpdateEvent::CheckFailed(error))
            }
        }
    }

    /// Dismiss the offered update. Returns the version to remember as skipped
    /// when `skip_version` is set.
    pub fn decline(&mut self, skip_version: bool) -> Option<String> {
        if !self.state.can_accept() {
            return None;
        }
        let update = self.offered.take();
        self.state = UpdateState::Idle;
        let skipped = update
            .filter(|_| skip_version)
            .map(|update| update.latest_version);
        if let Some(version) = &skipped {
            info!("User skipped version {version}");
        }
        skipped
    }

    /// Download and unpack the offered update.
    ///
    /// Progress for both steps is sent on `progress`. Nothing is retried
    /// automatically; after a failure the user may accept again.
    pub async fn accept(
        &mut self,
        progress: &mpsc::Sender<UpdateProgress>,
    ) -> Result<AcceptOutcome, AppError> {
        if !self.state.can_accept() {
            return Err(AppError::message("No update is waiting to be installed"));
        }
        let Some(update) = self.offered.clone() else {
            return Err(AppError::message("No update is waiting to be installed"));
        };
        // Cancels from here on belong to this attempt.
        self.downloader.reset_cancellation();

        let Some(asset) = update.asset.clone() else {
            info!("Release has no package, opening {}", update.release_url);
            if let Err(error) = (self.open_page)(&update.release_url) {
                return Err(self.fail("open release page", error));
            }
            self.state = UpdateState::Idle;
            self.offered = None;
            return Ok(AcceptOutcome::OpenedReleasePage(update.release_url));
        };

        let lock = match UpdateLock::acquire(&self.layout.paths.update_lock_file()) {
            Ok(lock) => lock,
            Err(LockError::AlreadyHeld) => return Err(AppError::UpdateInProgress),
            Err(error) => return Err(self.fail("lock", error.to_string())),
        };

        self.state = UpdateState::Downloading;
        let destination = self.layout.paths.update_package_file(&asset.name);
        let downloaded = self
            .downloader
            .download(&asset.download_url, &destination, progress)
            .await;
        let package = match downloaded {
            Ok(path) => path,
            Err(DownloadError::Cancelled) => {
                info!("Update download cancelled by user");
                self.state = UpdateState::UpdateOffered;
                return Ok(AcceptOutcome::Cancelled);
            }
            Err(error) => return Err(self.fail("download", error)),
        };

        if let Some(expected) = &asset.sha256 {
            let verified = verify_sha256(&package, expected).await;
            if let Err(error) = verified {
                return Err(self.fail("verify", error));
            }
        } else {
            debug!("Release asset {} has no digest to verify", asset.name);
        }

        if is_installer_package(&package) {
            self.state = UpdateState::Installing;
            return Ok(AcceptOutcome::ReadyToInstall(PendingInstall {
                package,
                action: InstallAction::RunInstaller,
                _lock: lock,
            }));
        }

        self.state = UpdateState::Extracting;
        let staging_dir = self.layout.paths.update_staging_dir();
        let extracted = self
            .extractor
            .extract(&package, &staging_dir, progress)
            .await;
        let extraction = match extracted {
            Ok(extraction) => extraction,
            Err(ExtractError::Timeout { seconds, .. }) => {
                let error = AppError::timeout("Extraction", seconds);
                return Err(self.fail_with("extract", error));
            }
            Err(error) => return Err(self.fail("extract", error)),
        };
        info!(
            "Extracted {} entries into {}",
            extraction.entry_count,
            extraction.staging_dir.display()
        );

        let plan = match compute_install_plan(
            &extraction.staging_dir,
            &self.layout.install_dir,
            &self.layout.executable_name,
        ) {
            Ok(plan) => plan,
            Err(error) => return Err(self.fail("install", error)),
        };

        self.state = UpdateState::Installing;
        Ok(AcceptOutcome::ReadyToInstall(PendingInstall {
            package,
            action: InstallAction::Swap(plan),
            _lock: lock,
        }))
    }

    /// Hand the installation over and end this process. Returns only when
    /// the hand-off could not be started.
    pub async fn install(&mut self, pending: PendingInstall) -> Result<Infallible, AppError> {
        let result = match &pending.action {
            InstallAction::Swap(plan) => {
                let options = HelperOptions {
                    max_polls: self.helper_max_polls,
                    poll_interval_secs: self.helper_poll_interval_secs,
                    artifacts: vec![
                        pending.package.clone(),
                        self.layout.paths.update_staging_dir(),
                    ],
                    failure_marker: Some(self.layout.paths.update_failure_file()),
                };
                InstallationSwapper::new(
                    HelperScript::for_current_platform(&self.layout.executable_name),
                    options,
                )
                .with_log_file(self.layout.paths.helper_log_file())
                .install(plan)
                .await
            }
            InstallAction::RunInstaller => run_installer(&pending.package).await,
        };

        match result {
            Ok(never) => match never {},
            Err(error) => Err(self.fail("install", error)),
        }
    }

    fn fail(&mut self, phase: &'static str, details: impl Into<AppErrorDetail>) -> AppError {
        self.fail_with(phase, AppError::auto_update_failed(phase, details))
    }

    fn fail_with(&mut self, phase: &'static str, error: AppError) -> AppError {
        error!("Update {phase} failed: {error}");
        self.state = UpdateState::Failed {
            phase,
            error: error.clone(),
        };
        error
    }
}
