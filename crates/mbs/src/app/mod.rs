mod async_helpers;
mod console;
pub mod update;

use log::{info, warn};
use mbs_core::AppUpdate;
use mbs_platform::AppPaths;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::settings::AppSettings;
use update::{
    AcceptOutcome, UpdateEvent, UpdateLayout, UpdateOrchestrator, take_install_failure,
};

/// What the user decided about an offered update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferChoice {
    Install,
    Later,
    Skip,
}

pub struct App {
    paths: AppPaths,
    settings: AppSettings,
    repository: String,
    updates: UpdateOrchestrator,
}

impl App {
    pub fn new(
        paths: AppPaths,
        settings: AppSettings,
        repository: Option<String>,
    ) -> Result<Self, AppError> {
        let layout = UpdateLayout::for_current_exe(paths.clone())?;
        let updates = UpdateOrchestrator::new(&settings, layout)?;
        let repository = repository.unwrap_or_else(|| settings.repository.clone());

        Ok(Self {
            paths,
            settings,
            repository,
            updates,
        })
    }

    /// `mbs check`: report whether a newer release exists.
    pub async fn check(&mut self, silent: bool) -> Result<(), AppError> {
        self.report_previous_failure();
        match self.run_check(silent).await {
            Some(UpdateEvent::UpdateAvailable(update)) => {
                console::announce(&update);
                console::hint("Run `mbs update` to install it.");
                Ok(())
            }
            Some(UpdateEvent::UpToDate { latest }) => {
                console::up_to_date(self.updates.current_version(), &latest);
                Ok(())
            }
            Some(UpdateEvent::CheckFailed(error)) => Err(error),
            None => Ok(()),
        }
    }

    /// `mbs update`: check and, when a newer release exists, offer to
    /// install it.
    pub async fn update(&mut self, assume_yes: bool) -> Result<(), AppError> {
        self.report_previous_failure();
        match self.run_check(false).await {
            Some(UpdateEvent::UpdateAvailable(update)) => self.offer(&update, assume_yes).await,
            Some(UpdateEvent::UpToDate { latest }) => {
                console::up_to_date(self.updates.current_version(), &latest);
                Ok(())
            }
            Some(UpdateEvent::CheckFailed(error)) => Err(error),
            None => Ok(()),
        }
    }

    /// `mbs startup`: the quiet check the application runs when it starts.
    /// Skipped versions are not offered again.
    pub async fn startup(&mut self) -> Result<(), AppError> {
        self.report_previous_failure();
        if !self.settings.check_on_startup {
            info!("Startup update check disabled");
            return Ok(());
        }

        match self.run_check(true).await {
            Some(UpdateEvent::UpdateAvailable(update)) => {
                if self.settings.is_skipped(&update.latest_version) {
                    info!("Version {} was skipped by the user", update.latest_version);
                    self.updates.decline(false);
                    return Ok(());
                }
                self.offer(&update, false).await
            }
            Some(UpdateEvent::CheckFailed(error)) => Err(error),
            Some(UpdateEvent::UpToDate { .. }) | None => Ok(()),
        }
    }

    fn report_previous_failure(&self) {
        if let Some(failure) = take_install_failure(&self.paths) {
            console::previous_install_failed(&failure);
        }
    }

    async fn run_check(&mut self, silent: bool) -> Option<UpdateEvent> {
        let spinner = (!silent).then(|| console::spinner("Checking for updates..."));
        let event = self.updates.check(&self.repository, silent).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }

        self.settings.last_update_check = Some(chrono::Utc::now());
        self.save_settings();
        event
    }

    async fn offer(&mut self, update: &AppUpdate, assume_yes: bool) -> Result<(), AppError> {
        console::announce(update);
        let choice = if assume_yes {
            OfferChoice::Install
        } else {
            console::ask_offer(update)
        };

        match choice {
            OfferChoice::Install => self.install_offered().await,
            OfferChoice::Later => {
                self.updates.decline(false);
                Ok(())
            }
            OfferChoice::Skip => {
                if let Some(version) = self.updates.decline(true) {
                    console::hint(&format!(
                        "Version {version} will not be offered at startup again."
                    ));
                    self.settings.skipped_version = Some(version);
                    self.save_settings();
                }
                Ok(())
            }
        }
    }

    async fn install_offered(&mut self) -> Result<(), AppError> {
        loop {
            let (tx, rx) = mpsc::channel(64);
            let renderer = tokio::spawn(console::render_progress(rx));
            let cancel = self.updates.cancel_handle();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let outcome = self.updates.accept(&tx).await;
            interrupt.abort();
            drop(tx);
            let _ = renderer.await;

            match outcome {
                Ok(AcceptOutcome::ReadyToInstall(pending)) => {
                    console::installing();
                    return self.updates.install(pending).await.map(|never| match never {});
                }
                Ok(AcceptOutcome::OpenedReleasePage(url)) => {
                    console::hint(&format!(
                        "This release has no installable package. Opened {url} in your browser."
                    ));
                    return Ok(());
                }
                Ok(AcceptOutcome::Cancelled) => {
                    console::hint("Download cancelled.");
                    return Ok(());
                }
                Err(error) if error.is_retryable() && self.updates.state().can_accept() => {
                    warn!("Update attempt failed: {error}");
                    console::error(&error);
                    if !console::confirm("Try again?").await {
                        return Ok(());
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn save_settings(&self) {
        if let Err(error) = self.settings.save(&self.paths) {
            warn!("Failed to save settings: {error}");
        }
    }
}
