//! Self-update pipeline for MBS.
//!
//! This crate is independent of the application shell:
//! - Version parsing and ordering.
//! - Latest-release lookup and asset selection.
//! - Streaming package download with cancellation.
//! - Archive extraction into a staging directory.
//! - Hand-off to a detached helper that swaps the installed files.

pub mod download;
pub mod extract;
pub mod install;
pub mod release;
pub mod version;

/// Streaming package download, cancellation and checksum verification.
pub use download::{DownloadError, PackageDownloader, verify_sha256};
/// Archive expansion behind the [`ArchiveExtractor`] seam.
pub use extract::{ArchiveExtractor, ExtractError, ExtractionResult, PackageExtractor};
/// Install plan resolution and helper launch.
pub use install::{
    HelperOptions, HelperScript, InstallError, InstallPlan, InstallationSwapper,
    compute_install_plan, is_installer_package, run_installer,
};
/// Release feed model, asset selection and update discovery.
pub use release::{
    AppUpdate, AssetSelector, FeedError, ReleaseAsset, ReleaseDescriptor, ReleaseFeed, UpdateCheck,
};
/// Version parsing and comparison.
pub use version::{Version, is_newer, is_newer_version};

/// Progress reported by the long-running pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateProgress {
    Downloading { downloaded: u64, total: Option<u64> },
    Extracting { percent: u8 },
}

impl UpdateProgress {
    /// Completion as a whole percentage, when it can be known.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        match *self {
            Self::Downloading {
                downloaded,
                total: Some(total),
            } if total > 0 => {
                let percent = downloaded.saturating_mul(100) / total;
                Some(u8::try_from(percent.min(100)).unwrap_or(100))
            }
            Self::Downloading { .. } => None,
            Self::Extracting { percent } => Some(percent),
        }
    }
}
