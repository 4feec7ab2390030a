use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use mbs_platform::AppPaths;
#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

/// Appends to the log file, reopening it when it was deleted underneath us.
struct ReopeningLogWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ReopeningLogWriter {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = append_to(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    fn reopen_if_missing(&self) -> io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = append_to(&self.path)?;
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
        Ok(())
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for ReopeningLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reopen_if_missing()?;
        match self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("log file not available")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Drop the older half of an oversized log, cutting at a line boundary.
fn truncate_oversized_log(log_path: &Path, max_log_size: u64) {
    let Ok(metadata) = std::fs::metadata(log_path) else {
        return;
    };
    if metadata.len() <= max_log_size {
        return;
    }
    let Ok(contents) = std::fs::read(log_path) else {
        return;
    };

    let middle = contents.len() / 2;
    let keep_from = contents[middle..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(middle, |offset| middle + offset + 1);
    let _ = std::fs::write(log_path, &contents[keep_from..]);
}

/// Install the global logger. The file logger records everything from the
/// `mbs*` crates; debug builds also log to the terminal.
pub fn init_logging(paths: &AppPaths, debug_enabled: bool, max_log_size: u64) {
    let _ = paths.ensure_dirs();
    let log_path = paths.log_file();
    truncate_oversized_log(&log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("mbs")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));

    match ReopeningLogWriter::open(log_path.clone()) {
        Ok(writer) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, writer)),
        Err(error) => eprintln!("Cannot open log file {}: {error}", log_path.display()),
    }

    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }

    set_logging_enabled(debug_enabled);
    log::info!(
        "MBS {} starting, log file: {}",
        env!("CARGO_PKG_VERSION"),
        log_path.display()
    );
}

pub fn set_logging_enabled(enabled: bool) {
    log::set_max_level(if enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}
