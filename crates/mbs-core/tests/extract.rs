use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mbs_core::extract::{ToolOutput, ZipExtractor};
use mbs_core::{ArchiveExtractor, ExtractError, PackageExtractor, UpdateProgress};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).expect("zip file should be created");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        writer
            .start_file(*name, options)
            .expect("zip entry should be started");
        writer
            .write_all(contents)
            .expect("zip entry should be written");
    }
    writer.finish().expect("zip archive should be finalized");
}

fn percents(rx: &mut mpsc::Receiver<UpdateProgress>) -> Vec<u8> {
    let mut seen = Vec::new();
    while let Ok(UpdateProgress::Extracting { percent }) = rx.try_recv() {
        seen.push(percent);
    }
    seen
}

struct ScriptedExtractor(ToolOutput);

#[async_trait]
impl ArchiveExtractor for ScriptedExtractor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn expand(
        &self,
        _archive: &Path,
        destination: &Path,
        _cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput> {
        std::fs::write(destination.join("partial.bin"), b"half")?;
        Ok(self.0.clone())
    }
}

/// Writes one file, then hangs until cancelled and records that it stopped.
struct StuckExtractor {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl ArchiveExtractor for StuckExtractor {
    fn name(&self) -> &'static str {
        "stuck"
    }

    async fn expand(
        &self,
        _archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput> {
        std::fs::write(destination.join("partial.bin"), b"half")?;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(60)) => Ok(ToolOutput::success()),
            () = cancel.cancelled() => {
                self.stopped.store(true, Ordering::SeqCst);
                Ok(ToolOutput::failure(1, "cancelled"))
            }
        }
    }
}

struct MissingToolExtractor;

#[async_trait]
impl ArchiveExtractor for MissingToolExtractor {
    fn name(&self) -> &'static str {
        "missing"
    }

    async fn expand(
        &self,
        _archive: &Path,
        _destination: &Path,
        _cancel: &CancellationToken,
    ) -> std::io::Result<ToolOutput> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "program not found",
        ))
    }
}

#[tokio::test]
async fn extracts_into_fresh_staging_and_reports_milestones() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let archive = temp.path().join("mbs_update.zip");
    let staging = temp.path().join("mbs_update_extracted");
    write_zip(&archive, &[("MBS/mbs.exe", b"binary"), ("MBS/lib.dll", b"lib")]);
    std::fs::create_dir_all(&staging).expect("stale staging should be created");
    std::fs::write(staging.join("stale.txt"), b"old").expect("stale file should be written");

    let extractor = PackageExtractor::new(Box::new(ZipExtractor), Duration::from_secs(30));
    let (tx, mut rx) = mpsc::channel(32);

    let result = extractor
        .extract(&archive, &staging, &tx)
        .await
        .expect("extraction should succeed");

    assert_eq!(result.staging_dir, staging);
    assert_eq!(result.entry_count, 3);
    assert!(!staging.join("stale.txt").exists());
    assert_eq!(percents(&mut rx), vec![10, 30, 50, 70, 90, 100]);
}

#[tokio::test]
async fn empty_archive_is_reported_as_empty() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let archive = temp.path().join("empty.zip");
    let staging = temp.path().join("staging");
    write_zip(&archive, &[]);

    let extractor = PackageExtractor::new(Box::new(ZipExtractor), Duration::from_secs(30));
    let (tx, _rx) = mpsc::channel(32);

    let error = extractor
        .extract(&archive, &staging, &tx)
        .await
        .expect_err("empty archive should fail");

    assert!(matches!(error, ExtractError::Empty { .. }), "{error:?}");
    assert!(!staging.exists());
}

#[tokio::test]
async fn non_zero_exit_is_a_tool_failure_and_cleans_staging() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let staging = temp.path().join("staging");
    let extractor = PackageExtractor::new(
        Box::new(ScriptedExtractor(ToolOutput::failure(2, "End-of-central-directory"))),
        Duration::from_secs(30),
    );
    let (tx, _rx) = mpsc::channel(32);

    let error = extractor
        .extract(&temp.path().join("pkg.zip"), &staging, &tx)
        .await
        .expect_err("tool failure should fail");

    let ExtractError::ToolFailed {
        exit_code, stderr, ..
    } = &error
    else {
        panic!("expected a tool failure, got {error:?}");
    };
    assert_eq!(*exit_code, 2);
    assert_eq!(stderr, "End-of-central-directory");
    assert!(!staging.exists());
}

#[tokio::test]
async fn stuck_extractor_times_out() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let staging = temp.path().join("staging");
    let stopped = Arc::new(AtomicBool::new(false));
    let extractor = PackageExtractor::new(
        Box::new(StuckExtractor {
            stopped: Arc::clone(&stopped),
        }),
        Duration::from_millis(100),
    );
    let (tx, _rx) = mpsc::channel(32);

    let error = extractor
        .extract(&temp.path().join("pkg.zip"), &staging, &tx)
        .await
        .expect_err("stuck extractor should time out");

    assert!(
        matches!(error, ExtractError::Timeout { tool: "stuck", .. }),
        "{error:?}"
    );
    assert!(
        stopped.load(Ordering::SeqCst),
        "backend should be stopped before extract returns"
    );
    assert!(!staging.exists());
}

#[tokio::test]
async fn zip_extraction_stops_writing_after_timeout() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let archive = temp.path().join("large.zip");
    let staging = temp.path().join("staging");
    let chunk = vec![7_u8; 4 * 1024];
    let names: Vec<String> = (0..4000).map(|i| format!("MBS/data/{i:05}.bin")).collect();
    let entries: Vec<(&str, &[u8])> = names
        .iter()
        .map(|name| (name.as_str(), chunk.as_slice()))
        .collect();
    write_zip(&archive, &entries);

    let extractor = PackageExtractor::new(Box::new(ZipExtractor), Duration::from_millis(1));
    let (tx, _rx) = mpsc::channel(32);

    let error = extractor
        .extract(&archive, &staging, &tx)
        .await
        .expect_err("extraction should exceed its bound");
    assert!(
        matches!(error, ExtractError::Timeout { tool: "zip", .. }),
        "{error:?}"
    );
    assert!(!staging.exists());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !staging.exists(),
        "nothing may be written to staging after the timeout"
    );
}

#[tokio::test]
async fn unstartable_tool_is_a_launch_error() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let extractor =
        PackageExtractor::new(Box::new(MissingToolExtractor), Duration::from_secs(30));
    let (tx, _rx) = mpsc::channel(32);

    let error = extractor
        .extract(&temp.path().join("pkg.zip"), &temp.path().join("staging"), &tx)
        .await
        .expect_err("missing tool should fail");

    assert!(matches!(error, ExtractError::Launch { .. }), "{error:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn unzip_command_extracts_when_installed() {
    let Ok(program) = which::which("unzip") else {
        return;
    };
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let archive = temp.path().join("mbs_update.zip");
    let staging = temp.path().join("staging");
    write_zip(&archive, &[("mbs", b"binary")]);

    let extractor = PackageExtractor::new(
        Box::new(mbs_core::extract::CommandExtractor::unzip(program)),
        Duration::from_secs(30),
    );
    let (tx, _rx) = mpsc::channel(32);

    let result = extractor
        .extract(&archive, &staging, &tx)
        .await
        .expect("unzip should extract");

    assert_eq!(result.entry_count, 1);
    assert_eq!(
        std::fs::read(staging.join("mbs")).expect("file should be extracted"),
        b"binary"
    );
}
