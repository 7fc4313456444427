//! stt-updater - checks for, downloads and installs STT Desktop releases
//!
//! - `check` reports whether a newer release exists
//! - `update` installs it after confirmation and restarts the application
//! - `cleanup` removes leftovers of the previous update

mod cli;

use clap::Parser;
use cli::{exit_codes, Cli, Commands};
use stt_updater::logging;
use stt_updater::settings::UpdaterSettings;
use stt_updater::update::cleanup_previous_install;

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    // Keep the guard alive so the file writer flushes before exit
    let _log_guard = match logging::init(
        cli.verbose,
        cli.json_output,
        UpdaterSettings::log_dir().as_deref(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return exit_codes::UNEXPECTED_FAILURE;
        }
    };

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "stt-updater starting");

    // Leftovers of a previous update are removed on every start
    if !matches!(cli.command, Commands::Cleanup) {
        match cli.target.live_exe() {
            Ok(exe) => {
                cleanup_previous_install(&exe);
            }
            Err(e) => tracing::warn!("skipping startup cleanup: {}", e),
        }
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            return exit_codes::UNEXPECTED_FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Check => rt.block_on(cli::check::run(&cli.target, cli.json_output)),
        Commands::Update(args) => rt.block_on(cli::update::run(&cli.target, args)),
        Commands::Cleanup => cli::maintenance::cleanup(&cli.target),
        Commands::Version => cli::maintenance::version(&cli.target, cli.json_output),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {}", e);
            cli::exit_code_for(&e)
        }
    }
}
