use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use mbs_platform::HideWindow;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::UpdateProgress;

pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a cancelled backend may take to stop writing before the staging
/// directory is removed regardless.
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

const COPY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{context} {}: {source}", path.display())]
    FileSystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start {tool}: {source}")]
    Launch {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("extraction with {tool} failed with exit code {exit_code}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        exit_code: i32,
        stderr: String,
    },
    #[error("archive {} contained no files", archive.display())]
    Empty { archive: PathBuf },
    #[error("extraction with {tool} timed out after {seconds}s")]
    Timeout { tool: &'static str, seconds: u64 },
}

impl ExtractError {
    fn file_system(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::FileSystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Exit status and diagnostics of an extraction backend run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ToolOutput {
    #[must_use]
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A mechanism that expands an archive into an existing directory.
///
/// Returning `Err` means the mechanism could not be started at all; a started
/// run that fails reports through [`ToolOutput`].
///
/// Once `cancel` fires, an implementation must stop writing to `destination`
/// before it returns.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn expand(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput>;
}

fn cancelled_output() -> ToolOutput {
    ToolOutput {
        exit_code: None,
        stderr: "extraction cancelled".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveTool {
    PowerShell,
    Unzip,
}

/// Shells out to the platform archive tool.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    tool: ArchiveTool,
}

impl CommandExtractor {
    /// Resolve the platform tool to an absolute path, if installed.
    #[must_use]
    pub fn locate() -> Option<Self> {
        if cfg!(windows) {
            which::which("powershell.exe").ok().map(Self::powershell)
        } else {
            which::which("unzip").ok().map(Self::unzip)
        }
    }

    #[must_use]
    pub fn powershell(program: PathBuf) -> Self {
        Self {
            program,
            tool: ArchiveTool::PowerShell,
        }
    }

    #[must_use]
    pub fn unzip(program: PathBuf) -> Self {
        Self {
            program,
            tool: ArchiveTool::Unzip,
        }
    }

    fn command(&self, archive: &Path, destination: &Path) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        match self.tool {
            // Paths travel through the environment so quotes or wildcards in
            // them are never parsed as PowerShell syntax.
            ArchiveTool::PowerShell => {
                command
                    .args([
                        "-NoProfile",
                        "-NonInteractive",
                        "-ExecutionPolicy",
                        "Bypass",
                        "-Command",
                        "$ErrorActionPreference = 'Stop'; \
                         Expand-Archive -LiteralPath $env:MBS_ARCHIVE \
                         -DestinationPath $env:MBS_DESTINATION -Force",
                    ])
                    .env("MBS_ARCHIVE", archive)
                    .env("MBS_DESTINATION", destination);
            }
            ArchiveTool::Unzip => {
                command
                    .args(["-o", "-q"])
                    .arg(archive)
                    .arg("-d")
                    .arg(destination);
            }
        }
        command
    }
}

#[async_trait]
impl ArchiveExtractor for CommandExtractor {
    fn name(&self) -> &'static str {
        match self.tool {
            ArchiveTool::PowerShell => "Expand-Archive",
            ArchiveTool::Unzip => "unzip",
        }
    }

    async fn expand(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput> {
        debug!(
            "Running {} for {}",
            self.program.display(),
            archive.display()
        );
        let mut child = self
            .command(archive, destination)
            .hide_window()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            finished = async { tokio::join!(child.wait(), read_diagnostics(stderr)) } => {
                Some(finished)
            }
            () = cancel.cancelled() => None,
        };
        let Some((status, captured)) = finished else {
            debug!("Stopping {} after cancellation", self.name());
            if let Err(error) = child.kill().await {
                warn!("Failed to stop {}: {error}", self.name());
            }
            return Ok(cancelled_output());
        };
        let status = status?;

        Ok(ToolOutput {
            exit_code: status.code(),
            stderr: String::from_utf8_lossy(&captured).trim().to_string(),
        })
    }
}

async fn read_diagnostics(stderr: Option<tokio::process::ChildStderr>) -> Vec<u8> {
    use tokio::io::AsyncReadExt as _;

    let mut captured = Vec::new();
    if let Some(mut stderr) = stderr
        && let Err(error) = stderr.read_to_end(&mut captured).await
    {
        debug!("Failed to read extractor diagnostics: {error}");
    }
    captured
}

/// Expands zip archives in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    async fn expand(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        // Stop the blocking thread if this future is dropped.
        let stop = cancel.child_token();
        let _stop_on_drop = stop.clone().drop_guard();

        tokio::task::spawn_blocking(move || {
            match extract_zip(&archive, &destination, &stop) {
                Ok(()) => ToolOutput::success(),
                Err(_) if stop.is_cancelled() => cancelled_output(),
                Err(message) => ToolOutput::failure(1, message),
            }
        })
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))
    }
}

fn extract_zip(zip_path: &Path, dest: &Path, stop: &CancellationToken) -> Result<(), String> {
    let file = std::fs::File::open(zip_path)
        .map_err(|error| format!("failed to open {}: {error}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| format!("failed to read zip archive: {error}"))?;

    for i in 0..archive.len() {
        if stop.is_cancelled() {
            return Err("extraction cancelled".to_string());
        }
        let mut entry = archive
            .by_index(i)
            .map_err(|error| format!("failed to read zip entry {i}: {error}"))?;
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = dest.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|error| format!("failed to create {}: {error}", out_path.display()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| format!("failed to create {}: {error}", parent.display()))?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .map_err(|error| format!("failed to create {}: {error}", out_path.display()))?;
        copy_entry(&mut entry, &mut outfile, stop)
            .map_err(|error| format!("failed to extract {}: {error}", out_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode()
                && let Err(error) =
                    std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))
            {
                warn!(
                    "Failed to set mode {mode:o} on {}: {error}",
                    out_path.display()
                );
            }
        }
    }

    Ok(())
}

/// `std::io::copy` that checks `stop` between chunks.
fn copy_entry(
    reader: &mut impl std::io::Read,
    writer: &mut impl std::io::Write,
    stop: &CancellationToken,
) -> std::io::Result<()> {
    let mut buffer = vec![0_u8; COPY_CHUNK_SIZE];
    loop {
        if stop.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "extraction cancelled",
            ));
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        writer.write_all(&buffer[..read])?;
    }
}

/// The platform tool when available, otherwise in-process zip extraction.
#[must_use]
pub fn default_extractor() -> Box<dyn ArchiveExtractor> {
    match CommandExtractor::locate() {
        Some(extractor) => Box::new(extractor),
        None => {
            debug!("No archive tool found on PATH, using built-in zip extraction");
            Box::new(ZipExtractor)
        }
    }
}

/// Outcome of a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub staging_dir: PathBuf,
    /// Files and directories found under `staging_dir`, always at least one.
    pub entry_count: usize,
}

/// Unpacks a downloaded package into a staging directory.
pub struct PackageExtractor {
    backend: Box<dyn ArchiveExtractor>,
    timeout: Duration,
}

impl PackageExtractor {
    #[must_use]
    pub fn new(backend: Box<dyn ArchiveExtractor>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    #[must_use]
    pub fn with_default_backend(timeout: Duration) -> Self {
        Self::new(default_extractor(), timeout)
    }

    /// Extract `archive` into `staging_dir`, replacing any previous contents.
    ///
    /// The staging directory is removed again when extraction fails.
    ///
    /// # Errors
    /// Returns [`ExtractError::FileSystem`] when the staging directory cannot
    /// be prepared, [`ExtractError::Launch`] when the backend cannot start,
    /// [`ExtractError::Timeout`] when it exceeds the configured bound,
    /// [`ExtractError::ToolFailed`] on a non-zero exit, and
    /// [`ExtractError::Empty`] when nothing was extracted.
    pub async fn extract(
        &self,
        archive: &Path,
        staging_dir: &Path,
        progress: &mpsc::Sender<UpdateProgress>,
    ) -> Result<ExtractionResult, ExtractError> {
        send_percent(progress, 10).await;
        info!(
            "Extracting {} into {} with {}",
            archive.display(),
            staging_dir.display(),
            self.backend.name()
        );

        let result = self.run(archive, staging_dir, progress).await;
        if let Err(error) = &result {
            warn!("Extraction failed: {error}");
            remove_staging(staging_dir).await;
        }
        result
    }

    async fn run(
        &self,
        archive: &Path,
        staging_dir: &Path,
        progress: &mpsc::Sender<UpdateProgress>,
    ) -> Result<ExtractionResult, ExtractError> {
        prepare_staging(staging_dir).await?;
        send_percent(progress, 30).await;

        let tool = self.backend.name();
        send_percent(progress, 50).await;

        let cancel = CancellationToken::new();
        let expand = self.backend.expand(archive, staging_dir, &cancel);
        tokio::pin!(expand);

        let waited = tokio::time::timeout(self.timeout, &mut expand).await;
        let Ok(output) = waited else {
            cancel.cancel();
            // The caller removes staging next; the backend must be done
            // writing to it first.
            if tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut expand)
                .await
                .is_err()
            {
                warn!("{tool} did not stop within {CANCEL_GRACE_PERIOD:?} of cancellation");
            }
            return Err(ExtractError::Timeout {
                tool,
                seconds: self.timeout.as_secs(),
            });
        };
        let output = output.map_err(|source| ExtractError::Launch { tool, source })?;
        send_percent(progress, 70).await;

        if !output.is_success() {
            return Err(ExtractError::ToolFailed {
                tool,
                exit_code: output.exit_code.unwrap_or(-1),
                stderr: output.stderr,
            });
        }
        send_percent(progress, 90).await;

        let entry_count = count_entries(staging_dir).map_err(|error| {
            ExtractError::file_system("failed to read staging directory", staging_dir, error)
        })?;
        if entry_count == 0 {
            return Err(ExtractError::Empty {
                archive: archive.to_path_buf(),
            });
        }

        send_percent(progress, 100).await;
        debug!("Extracted {entry_count} entries to {}", staging_dir.display());
        Ok(ExtractionResult {
            staging_dir: staging_dir.to_path_buf(),
            entry_count,
        })
    }
}

async fn send_percent(progress: &mpsc::Sender<UpdateProgress>, percent: u8) {
    let _ = progress.send(UpdateProgress::Extracting { percent }).await;
}

async fn prepare_staging(staging_dir: &Path) -> Result<(), ExtractError> {
    match tokio::fs::remove_dir_all(staging_dir).await {
        Ok(()) => debug!("Removed stale staging directory {}", staging_dir.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(ExtractError::file_system(
                "failed to clear staging directory",
                staging_dir,
                error,
            ));
        }
    }

    tokio::fs::create_dir_all(staging_dir).await.map_err(|error| {
        ExtractError::file_system("failed to create staging directory", staging_dir, error)
    })
}

async fn remove_staging(staging_dir: &Path) {
    match tokio::fs::remove_dir_all(staging_dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            "Failed to remove staging directory {}: {error}",
            staging_dir.display()
        ),
    }
}

fn count_entries(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        count += 1;
        if entry.file_type()?.is_dir() {
            count += count_entries(&entry.path())?;
        }
    }
    Ok(count)
}
