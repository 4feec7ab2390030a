//! Replacement of the installed application by a detached helper script.
//!
//! A running executable cannot overwrite its own files, so installation is
//! handed to a generated script that outlives this process: it waits for the
//! application to exit, mirrors the staged files over the install directory,
//! relaunches the application and deletes itself. Only failures before the
//! helper starts are visible to the caller.

use std::convert::Infallible;
use std::fs::OpenOptions;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use log::{info, warn};
use mbs_platform::DetachProcess;
use thiserror::Error;

pub const DEFAULT_MAX_POLLS: u32 = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 1;

const HELPER_GRACE_PERIOD: Duration = Duration::from_millis(500);
const HELPER_SCRIPT_STEM: &str = "mbs_updater";
const HELPER_TITLE: &str = "MBS Updater";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{context} {}: {source}", path.display())]
    FileSystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write update helper {}: {source}", path.display())]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Unsupported(String),
}

/// What to copy where, and what to relaunch afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub executable_name: String,
}

/// Resolve the directory whose contents replace `target_dir`.
///
/// Archives often wrap their content in one top-level folder. When the staging
/// directory holds exactly one subdirectory, no files, and that subdirectory
/// is not empty, the subdirectory is used as the source.
///
/// # Errors
/// Returns [`InstallError::FileSystem`] when a directory cannot be read.
pub fn compute_install_plan(
    staging_dir: &Path,
    target_dir: &Path,
    executable_name: &str,
) -> Result<InstallPlan, InstallError> {
    let mut dirs = Vec::new();
    let mut has_files = false;

    for entry in read_dir(staging_dir)? {
        let entry = entry.map_err(|error| {
            InstallError::file_system("failed to read staging entry in", staging_dir, error)
        })?;
        let is_dir = entry
            .file_type()
            .map_err(|error| {
                InstallError::file_system("failed to inspect", &entry.path(), error)
            })?
            .is_dir();
        if is_dir {
            dirs.push(entry.path());
        } else {
            has_files = true;
        }
    }

    let source_dir = match dirs.as_slice() {
        [only] if !has_files && read_dir(only)?.next().is_some() => only.clone(),
        _ => staging_dir.to_path_buf(),
    };

    Ok(InstallPlan {
        source_dir,
        target_dir: target_dir.to_path_buf(),
        executable_name: executable_name.to_string(),
    })
}

fn read_dir(path: &Path) -> Result<std::fs::ReadDir, InstallError> {
    std::fs::read_dir(path)
        .map_err(|error| InstallError::file_system("failed to read directory", path, error))
}

impl InstallError {
    fn file_system(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::FileSystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Shell flavour of the helper script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDialect {
    /// `cmd.exe` batch file.
    Batch,
    /// POSIX `sh` script.
    Posix,
}

impl ScriptDialect {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(windows) { Self::Batch } else { Self::Posix }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Batch => "bat",
            Self::Posix => "sh",
        }
    }

    fn line_ending(self) -> &'static str {
        match self {
            Self::Batch => "\r\n",
            Self::Posix => "\n",
        }
    }

    /// Quote a path as a single word.
    #[must_use]
    pub fn quote(self, path: &Path) -> String {
        let raw = path.to_string_lossy();
        match self {
            Self::Batch => format!("\"{}\"", raw.replace('%', "%%")),
            Self::Posix => format!("'{}'", raw.replace('\'', r"'\''")),
        }
    }
}

/// Probe for whether the old application process is still alive.
pub trait ProcessWatcher: Send + Sync {
    /// Command that exits with status 0 while the process is running.
    fn probe_command(&self) -> String;

    fn describe(&self) -> String;
}

/// Looks the process up by image name in `tasklist`.
#[derive(Debug, Clone)]
pub struct ImageNameWatcher {
    pub image_name: String,
}

impl ProcessWatcher for ImageNameWatcher {
    fn probe_command(&self) -> String {
        format!(
            "tasklist /FI \"IMAGENAME eq {name}\" 2>NUL | find /I \"{name}\" >NUL",
            name = self.image_name
        )
    }

    fn describe(&self) -> String {
        self.image_name.clone()
    }
}

/// Checks a process id with `kill -0`.
#[derive(Debug, Clone, Copy)]
pub struct PidWatcher {
    pub pid: u32,
}

impl ProcessWatcher for PidWatcher {
    fn probe_command(&self) -> String {
        format!("kill -0 {} 2>/dev/null", self.pid)
    }

    fn describe(&self) -> String {
        format!("process {}", self.pid)
    }
}

/// Copy step that overlays the staged files on the install directory.
pub trait DirectoryMirror: Send + Sync {
    fn command(&self, dialect: ScriptDialect, source: &Path, target: &Path) -> String;

    /// Exit codes that count as a successful copy.
    fn success_codes(&self) -> RangeInclusive<i32>;
}

/// `robocopy` recursive copy, skipping files older than the installed ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Robocopy;

impl DirectoryMirror for Robocopy {
    fn command(&self, dialect: ScriptDialect, source: &Path, target: &Path) -> String {
        format!(
            "robocopy {} {} /E /IS /IT /XO",
            dialect.quote(source),
            dialect.quote(target)
        )
    }

    // 0-7 report copied/extra/mismatched files; 8 and above are failures.
    fn success_codes(&self) -> RangeInclusive<i32> {
        0..=7
    }
}

/// `cp -Rf` of the source contents into the target directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpMirror;

impl DirectoryMirror for CpMirror {
    fn command(&self, dialect: ScriptDialect, source: &Path, target: &Path) -> String {
        format!(
            "mkdir -p {target} && cp -Rf -- {source} {target}",
            source = dialect.quote(&source.join(".")),
            target = dialect.quote(target)
        )
    }

    fn success_codes(&self) -> RangeInclusive<i32> {
        0..=0
    }
}

/// Tunables of the generated helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperOptions {
    pub max_polls: u32,
    pub poll_interval_secs: u32,
    /// Files or directories deleted after a successful copy.
    pub artifacts: Vec<PathBuf>,
    /// Receives the copy exit code when the copy fails, so the next run of
    /// the application can report it. Removed after a successful copy.
    pub failure_marker: Option<PathBuf>,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self {
            max_polls: DEFAULT_MAX_POLLS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            artifacts: Vec::new(),
            failure_marker: None,
        }
    }
}

/// Renders the helper script for one dialect.
pub struct HelperScript {
    dialect: ScriptDialect,
    watcher: Box<dyn ProcessWatcher>,
    mirror: Box<dyn DirectoryMirror>,
}

impl HelperScript {
    #[must_use]
    pub fn new(
        dialect: ScriptDialect,
        watcher: Box<dyn ProcessWatcher>,
        mirror: Box<dyn DirectoryMirror>,
    ) -> Self {
        Self {
            dialect,
            watcher,
            mirror,
        }
    }

    /// Batch + `tasklist` + `robocopy` on Windows, `sh` + `kill -0` + `cp`
    /// elsewhere.
    #[must_use]
    pub fn for_current_platform(executable_name: &str) -> Self {
        match ScriptDialect::current() {
            ScriptDialect::Batch => Self::new(
                ScriptDialect::Batch,
                Box::new(ImageNameWatcher {
                    image_name: executable_name.to_string(),
                }),
                Box::new(Robocopy),
            ),
            ScriptDialect::Posix => Self::new(
                ScriptDialect::Posix,
                Box::new(PidWatcher {
                    pid: std::process::id(),
                }),
                Box::new(CpMirror),
            ),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> ScriptDialect {
        self.dialect
    }

    #[must_use]
    pub fn render(&self, plan: &InstallPlan, options: &HelperOptions) -> String {
        let lines = match self.dialect {
            ScriptDialect::Batch => self.render_batch(plan, options),
            ScriptDialect::Posix => self.render_posix(plan, options),
        };
        let ending = self.dialect.line_ending();
        let mut script = lines.join(ending);
        script.push_str(ending);
        script
    }

    fn render_batch(&self, plan: &InstallPlan, options: &HelperOptions) -> Vec<String> {
        let d = ScriptDialect::Batch;
        let codes = self.mirror.success_codes();
        let watched = self.watcher.describe();
        let executable = plan.target_dir.join(&plan.executable_name);

        let mut lines = vec![
            "@echo off".to_string(),
            "setlocal".to_string(),
            format!("title {HELPER_TITLE}"),
            "echo ========================================".to_string(),
            format!("echo    {HELPER_TITLE}"),
            "echo ========================================".to_string(),
            "echo.".to_string(),
            format!("echo Waiting for {watched} to close..."),
            "set /a POLLS=0".to_string(),
            ":WAIT_LOOP".to_string(),
            self.watcher.probe_command(),
            "if errorlevel 1 goto INSTALL".to_string(),
            format!("if %POLLS% GEQ {} (", options.max_polls),
            format!(
                "    echo WARNING: {watched} still running after {} checks. Proceeding anyway...",
                options.max_polls
            ),
            "    goto INSTALL".to_string(),
            ")".to_string(),
            format!("timeout /t {} /nobreak >nul", options.poll_interval_secs),
            "set /a POLLS+=1".to_string(),
            "goto WAIT_LOOP".to_string(),
            String::new(),
            ":INSTALL".to_string(),
            "echo Installing update...".to_string(),
            format!("echo Source: {}", d.quote(&plan.source_dir)),
            format!("echo Target: {}", d.quote(&plan.target_dir)),
            "echo.".to_string(),
            self.mirror.command(d, &plan.source_dir, &plan.target_dir),
            "set MIRROR_EXIT=%ERRORLEVEL%".to_string(),
            format!("if %MIRROR_EXIT% LSS {} goto FAILED", codes.start()),
            format!("if %MIRROR_EXIT% GTR {} goto FAILED", codes.end()),
            String::new(),
            "echo.".to_string(),
            "echo Update installed successfully. Starting application...".to_string(),
            format!("cd /d {}", d.quote(&plan.target_dir)),
            format!("start \"\" {}", d.quote(&executable)),
        ];

        for artifact in &options.artifacts {
            let quoted = d.quote(artifact);
            lines.push(format!("if exist {quoted} rd /S /Q {quoted} 2>nul"));
            lines.push(format!("if exist {quoted} del /F /Q {quoted} 2>nul"));
        }
        if let Some(marker) = &options.failure_marker {
            let quoted = d.quote(marker);
            lines.push(format!("if exist {quoted} del /F /Q {quoted} 2>nul"));
        }

        lines.extend([
            "(goto) 2>nul & del \"%~f0\"".to_string(),
            String::new(),
            ":FAILED".to_string(),
        ]);
        if let Some(marker) = &options.failure_marker {
            // Redirection first: "echo 9>file" would redirect handle 9.
            lines.push(format!(">{} echo %MIRROR_EXIT%", d.quote(marker)));
        }
        lines.extend([
            "echo.".to_string(),
            "echo ========================================".to_string(),
            "echo    Update failed! Copy exit code: %MIRROR_EXIT%".to_string(),
            "echo ========================================".to_string(),
            "echo Downloaded files were kept for inspection.".to_string(),
            "echo Please try again or download the update manually.".to_string(),
            "pause".to_string(),
            "exit /b 1".to_string(),
        ]);
        lines
    }

    fn render_posix(&self, plan: &InstallPlan, options: &HelperOptions) -> Vec<String> {
        let d = ScriptDialect::Posix;
        let codes = self.mirror.success_codes();
        let watched = self.watcher.describe();

        let mut lines = vec![
            "#!/bin/sh".to_string(),
            "echo '========================================'".to_string(),
            format!("echo '   {HELPER_TITLE}'"),
            "echo '========================================'".to_string(),
            format!("echo \"Waiting for {watched} to close...\""),
            "polls=0".to_string(),
            format!("while {}; do", self.watcher.probe_command()),
            format!("    if [ \"$polls\" -ge {} ]; then", options.max_polls),
            format!(
                "        echo \"WARNING: {watched} still running after {} checks. Proceeding anyway...\"",
                options.max_polls
            ),
            "        break".to_string(),
            "    fi".to_string(),
            format!("    sleep {}", options.poll_interval_secs),
            "    polls=$((polls + 1))".to_string(),
            "done".to_string(),
            String::new(),
            "echo 'Installing update...'".to_string(),
            format!("echo Source: {}", d.quote(&plan.source_dir)),
            format!("echo Target: {}", d.quote(&plan.target_dir)),
            self.mirror.command(d, &plan.source_dir, &plan.target_dir),
            "status=$?".to_string(),
            format!(
                "if [ \"$status\" -ge {} ] && [ \"$status\" -le {} ]; then",
                codes.start(),
                codes.end()
            ),
            "    echo 'Update installed successfully. Starting application...'".to_string(),
            format!(
                "    cd {} && {} >/dev/null 2>&1 &",
                d.quote(&plan.target_dir),
                d.quote(&Path::new(".").join(&plan.executable_name))
            ),
        ];

        for artifact in &options.artifacts {
            lines.push(format!("    rm -rf -- {}", d.quote(artifact)));
        }
        if let Some(marker) = &options.failure_marker {
            lines.push(format!("    rm -f -- {}", d.quote(marker)));
        }

        lines.extend([
            "    rm -f -- \"$0\"".to_string(),
            "    exit 0".to_string(),
            "fi".to_string(),
            String::new(),
        ]);
        if let Some(marker) = &options.failure_marker {
            lines.push(format!("echo \"$status\" > {}", d.quote(marker)));
        }
        lines.extend([
            "echo '========================================'".to_string(),
            "echo \"   Update failed! Copy exit code: $status\"".to_string(),
            "echo '========================================'".to_string(),
            "echo 'Downloaded files were kept for inspection.'".to_string(),
            "echo 'Please try again or download the update manually.'".to_string(),
            "printf 'Press Enter to close...'".to_string(),
            "read -r _ || true".to_string(),
            "exit 1".to_string(),
        ]);
        lines
    }
}

/// A started helper process. The helper is never waited on by the
/// application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedHelper {
    pub script_path: PathBuf,
    pub pid: u32,
}

/// Writes and launches the helper, then ends the current process.
pub struct InstallationSwapper {
    script: HelperScript,
    options: HelperOptions,
    script_dir: PathBuf,
    log_file: Option<PathBuf>,
}

impl InstallationSwapper {
    #[must_use]
    pub fn new(script: HelperScript, options: HelperOptions) -> Self {
        Self {
            script,
            options,
            script_dir: std::env::temp_dir(),
            log_file: None,
        }
    }

    #[must_use]
    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    /// Append helper output to `path` instead of discarding it. Ignored for
    /// batch helpers, which get their own console window.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(format!(
            "{HELPER_SCRIPT_STEM}.{}",
            self.script.dialect().extension()
        ))
    }

    /// Render the helper for `plan` and write it to [`Self::script_path`].
    ///
    /// # Errors
    /// Returns [`InstallError::ScriptWrite`] when the file cannot be written.
    pub fn write_script(&self, plan: &InstallPlan) -> Result<PathBuf, InstallError> {
        let path = self.script_path();
        let contents = self.script.render(plan, &self.options);
        std::fs::write(&path, contents).map_err(|source| InstallError::ScriptWrite {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Write the helper and start it detached from this process.
    ///
    /// # Errors
    /// Returns [`InstallError::ScriptWrite`] or [`InstallError::Launch`].
    pub fn launch(&self, plan: &InstallPlan) -> Result<LaunchedHelper, InstallError> {
        let script_path = self.write_script(plan)?;
        info!(
            "Launching update helper {} ({} -> {})",
            script_path.display(),
            plan.source_dir.display(),
            plan.target_dir.display()
        );

        let mut command = match self.script.dialect() {
            ScriptDialect::Batch => {
                let shell = std::env::var_os("ComSpec").unwrap_or_else(|| "cmd.exe".into());
                let mut command = Command::new(shell);
                command.arg("/c").arg(&script_path);
                command
            }
            ScriptDialect::Posix => {
                let mut command = Command::new("/bin/sh");
                command.arg(&script_path);
                command.stdout(self.helper_output()).stderr(self.helper_output());
                command
            }
        };
        command.stdin(Stdio::null()).detach();

        let child = command.spawn().map_err(|source| InstallError::Launch {
            program: script_path.display().to_string(),
            source,
        })?;

        Ok(LaunchedHelper {
            script_path,
            pid: child.id(),
        })
    }

    fn helper_output(&self) -> Stdio {
        self.log_file
            .as_ref()
            .and_then(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .inspect_err(|error| {
                        warn!("Cannot open helper log {}: {error}", path.display());
                    })
                    .ok()
            })
            .map_or_else(Stdio::null, Stdio::from)
    }

    /// Launch the helper and terminate this process once it is running.
    ///
    /// Returns only when the helper could not be started.
    ///
    /// # Errors
    /// Returns [`InstallError::ScriptWrite`] or [`InstallError::Launch`].
    pub async fn install(&self, plan: &InstallPlan) -> Result<Infallible, InstallError> {
        let helper = self.launch(plan)?;
        info!(
            "Update helper running as pid {}, exiting for installation",
            helper.pid
        );
        exit_for_helper().await
    }
}

/// Start a downloaded installer package and terminate this process.
///
/// # Errors
/// Returns [`InstallError::Unsupported`] for packages that are not Windows
/// installers or on other platforms, and [`InstallError::Launch`] when the
/// installer cannot be started.
pub async fn run_installer(package: &Path) -> Result<Infallible, InstallError> {
    let mut command = installer_command(package)?;
    info!("Launching installer: {}", package.display());
    command.stdin(Stdio::null()).detach();
    command.spawn().map_err(|source| InstallError::Launch {
        program: package.display().to_string(),
        source,
    })?;
    exit_for_helper().await
}

fn installer_command(package: &Path) -> Result<Command, InstallError> {
    if !cfg!(windows) {
        return Err(InstallError::Unsupported(
            "installer packages are only supported on Windows".to_string(),
        ));
    }

    match package_extension(package).as_deref() {
        Some("msi") => {
            let mut command = Command::new("msiexec");
            command.arg("/i").arg(package).arg("/passive");
            Ok(command)
        }
        Some("exe") => Ok(Command::new(package)),
        _ => Err(InstallError::Unsupported(format!(
            "{} is not an installer package",
            package.display()
        ))),
    }
}

/// Whether `package` is an installer to run rather than an archive to unpack.
#[must_use]
pub fn is_installer_package(package: &Path) -> bool {
    matches!(package_extension(package).as_deref(), Some("exe" | "msi"))
}

fn package_extension(package: &Path) -> Option<String> {
    package
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

async fn exit_for_helper() -> Result<Infallible, InstallError> {
    tokio::time::sleep(HELPER_GRACE_PERIOD).await;
    log::logger().flush();
    std::process::exit(0)
}
