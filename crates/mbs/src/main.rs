mod app;
mod error;
mod logging;
mod settings;
mod state;
mod update_lock;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;
use mbs_platform::AppPaths;

use crate::app::App;
use crate::settings::AppSettings;

#[derive(Parser)]
#[command(name = "mbs", version, about = "Keeps the MBS installation up to date")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// GitHub repository to check, as owner/repo
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Write debug output to the log file
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Report whether a newer release is available
    Check {
        /// Print nothing when up to date or when no release exists
        #[arg(long)]
        silent: bool,
    },
    /// Check, then download and install a newer release
    Update {
        /// Install without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Quiet check run when the application starts
    Startup,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("Error: {error}");
            return ExitCode::FAILURE;
        }
    };
    let settings = AppSettings::load(&paths);
    logging::init_logging(
        &paths,
        settings.debug_logging || cli.debug,
        settings.max_log_size_bytes,
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("Failed to start async runtime: {error}");
            eprintln!("Error: failed to start async runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Check { silent: false });
    let result = runtime.block_on(async move {
        let mut app = App::new(paths, settings, cli.repo)?;
        match command {
            Commands::Check { silent } => app.check(silent).await,
            Commands::Update { yes } => app.update(yes).await,
            Commands::Startup => app.startup().await,
        }
    });
    // An interrupted prompt leaves a blocking stdin read behind.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}
