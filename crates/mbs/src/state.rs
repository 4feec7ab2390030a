use crate::error::AppError;

/// Where the update flow currently is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpdateState {
    #[default]
    Idle,
    Checking,
    UpToDate,
    UpdateOffered,
    Downloading,
    Extracting,
    Installing,
    Failed {
        phase: &'static str,
        error: AppError,
    },
}

impl UpdateState {
    /// A step of an accepted update is running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::Downloading | Self::Extracting | Self::Installing
        )
    }

    /// An offered update may be started, or a failed download or extraction
    /// retried by the user.
    pub fn can_accept(&self) -> bool {
        match self {
            Self::UpdateOffered => true,
            Self::Failed { phase, .. } => matches!(*phase, "download" | "verify" | "extract"),
            _ => false,
        }
    }
}
