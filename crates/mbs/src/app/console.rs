//! Terminal front end for the update flow.

use std::io::{BufRead, Write};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use mbs_core::{AppUpdate, UpdateProgress};
use tokio::sync::mpsc;

use super::OfferChoice;
use super::update::PreviousInstallFailure;
use crate::error::AppError;

const NOTES_PREVIEW_LINES: usize = 12;

pub(super) fn announce(update: &AppUpdate) {
    println!(
        "A new version of MBS is available: {} (you have {}).",
        update.latest_version, update.current_version
    );
    if let Some(notes) = &update.release_notes {
        println!();
        println!("What's new:");
        for line in notes.lines().take(NOTES_PREVIEW_LINES) {
            println!("  {line}");
        }
        if notes.lines().count() > NOTES_PREVIEW_LINES {
            println!("  ...");
        }
        println!();
    }
    if let Some(asset) = &update.asset
        && asset.size > 0
    {
        println!("Download: {} ({})", asset.name, format_size(asset.size));
    }
    println!("Release page: {}", update.release_url);
}

pub(super) fn up_to_date(current: &str, latest: &str) {
    println!("You are running the latest version ({current}; latest release {latest}).");
}

pub(super) fn hint(message: &str) {
    println!("{message}");
}

pub(super) fn installing() {
    println!("Installing update. MBS will close and restart when it is done.");
}

pub(super) fn error(error: &AppError) {
    eprintln!("Error: {error}");
}

pub(super) fn previous_install_failed(failure: &PreviousInstallFailure) {
    match failure.exit_code {
        Some(code) => eprintln!("The last update could not be installed (copy exit code {code})."),
        None => eprintln!("The last update could not be installed."),
    }
    eprintln!(
        "The downloaded files were kept. Details are in {}.",
        failure.helper_log.display()
    );
}

pub(super) fn ask_offer(update: &AppUpdate) -> OfferChoice {
    let question = format!(
        "Install version {} now? [y]es / [l]ater / [s]kip this version",
        update.latest_version
    );
    match prompt(&question).as_deref() {
        Some("y" | "yes") => OfferChoice::Install,
        Some("s" | "skip") => OfferChoice::Skip,
        _ => OfferChoice::Later,
    }
}

/// Ask a yes/no question. Ctrl-C answers "no".
pub(super) async fn confirm(question: &str) -> bool {
    let question = format!("{question} [y/N]");
    let answer = tokio::task::spawn_blocking(move || prompt(&question));
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
        } else {
            std::future::pending::<()>().await;
        }
    };
    answer_or_interrupt(async { answer.await.ok().flatten() }, interrupt).await
}

async fn answer_or_interrupt(
    answer: impl Future<Output = Option<String>>,
    interrupt: impl Future<Output = ()>,
) -> bool {
    tokio::select! {
        answer = answer => matches!(answer.as_deref(), Some("y" | "yes")),
        () = interrupt => false,
    }
}

/// Read one lowercased answer from stdin. `None` on EOF or read errors.
fn prompt(question: &str) -> Option<String> {
    print!("{question} ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(answer.trim().to_ascii_lowercase()),
    }
}

pub(super) fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn download_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "Downloading [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .map(|style| style.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn extract_style() -> ProgressStyle {
    ProgressStyle::with_template("Extracting  [{bar:40.green/blue}] {pos:>3}%")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Draw progress events until the sender side is dropped.
pub(super) async fn render_progress(mut rx: mpsc::Receiver<UpdateProgress>) {
    let bar = ProgressBar::hidden();
    let mut extracting = false;

    while let Some(event) = rx.recv().await {
        match event {
            UpdateProgress::Downloading { downloaded, total } => {
                if bar.is_hidden() {
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                }
                match total {
                    Some(total) => {
                        if bar.length() != Some(total) {
                            bar.set_style(download_style());
                            bar.set_length(total);
                        }
                    }
                    None => {
                        bar.set_style(
                            ProgressStyle::with_template("{spinner:.blue} Downloading {bytes}")
                                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                        );
                        bar.tick();
                    }
                }
                bar.set_position(downloaded);
            }
            UpdateProgress::Extracting { .. } => {
                if !extracting {
                    extracting = true;
                    if !bar.is_hidden() {
                        bar.finish();
                    }
                    bar.reset();
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    bar.set_style(extract_style());
                    bar.set_length(100);
                }
                bar.set_position(event.percent().map_or(0, u64::from));
            }
        }
    }

    bar.finish_and_clear();
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut unit = 0;
    let mut whole = bytes;
    let mut tenths = 0;
    while whole >= 1024 && unit < UNITS.len() - 1 {
        tenths = (whole % 1024) * 10 / 1024;
        whole /= 1024;
        unit += 1;
    }
    if unit == 0 {
        format!("{whole} {}", UNITS[unit])
    } else {
        format!("{whole}.{tenths} {}", UNITS[unit])
    }
}
