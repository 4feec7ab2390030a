use mbs_core::{DownloadError, ExtractError, FeedError, InstallError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorDetail {
    Message(String),
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl std::fmt::Display for AppErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            Self::Io { kind, message } => write!(f, "{kind}: {message}"),
        }
    }
}

impl From<String> for AppErrorDetail {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppErrorDetail {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<std::io::Error> for AppErrorDetail {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<FeedError> for AppErrorDetail {
    fn from(value: FeedError) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<DownloadError> for AppErrorDetail {
    fn from(value: DownloadError) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<ExtractError> for AppErrorDetail {
    fn from(value: ExtractError) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<InstallError> for AppErrorDetail {
    fn from(value: InstallError) -> Self {
        Self::Message(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    Message(String),
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    NoReleasesPublished {
        repository: String,
    },
    UpdateCheckFailed {
        details: AppErrorDetail,
    },
    AutoUpdateFailed {
        phase: &'static str,
        details: AppErrorDetail,
    },
    UpdateInProgress,
}

impl AppError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn timeout(operation: &'static str, seconds: u64) -> Self {
        Self::Timeout { operation, seconds }
    }

    pub fn update_check_failed(details: impl Into<AppErrorDetail>) -> Self {
        Self::UpdateCheckFailed {
            details: details.into(),
        }
    }

    pub fn auto_update_failed(phase: &'static str, details: impl Into<AppErrorDetail>) -> Self {
        Self::AutoUpdateFailed {
            phase,
            details: details.into(),
        }
    }

    /// Whether the user can start another attempt right away.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoReleasesPublished { .. } | Self::UpdateInProgress)
    }
}

impl From<FeedError> for AppError {
    fn from(error: FeedError) -> Self {
        match error {
            FeedError::NoReleasesPublished { repository } => {
                Self::NoReleasesPublished { repository }
            }
            other => Self::update_check_failed(other),
        }
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            Self::Timeout { operation, seconds } => {
                write!(f, "{operation} timed out after {seconds}s")
            }
            Self::NoReleasesPublished { repository } => write!(
                f,
                "No releases have been published for {repository} yet. Please check back later."
            ),
            Self::UpdateCheckFailed { details } => {
                write!(f, "Failed to check for updates: {details}")
            }
            Self::AutoUpdateFailed { phase, details } => {
                write!(f, "App update {phase} failed: {details}")
            }
            Self::UpdateInProgress => {
                write!(f, "Another update is already in progress")
            }
        }
    }
}

impl std::error::Error for AppError {}
