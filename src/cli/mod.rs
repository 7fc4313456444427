//! Command-line interface

pub mod check;
pub mod maintenance;
pub mod update;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use stt_updater::settings::UpdaterSettings;
use stt_updater::update::{Invocation, UpdateError, UpdateOrchestrator};

/// Exit codes
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const UNEXPECTED_FAILURE: i32 = 1;
    pub const UPDATE_FAILED: i32 = 2;
    pub const UPDATE_AVAILABLE: i32 = 3;
    pub const PERMISSION_DENIED: i32 = 4;
    pub const UPDATE_APPLIED: i32 = stt_updater::update::UPDATE_APPLIED_EXIT_CODE;
}

/// Self-updater for STT Desktop
#[derive(Parser, Debug)]
#[command(name = "stt-updater", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs and results as JSON
    #[arg(long, global = true)]
    pub json_output: bool,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check whether a newer release is published
    Check,

    /// Download and install the latest release
    Update(UpdateArgs),

    /// Remove leftovers of a previous update
    Cleanup,

    /// Print the installed version
    Version,
}

/// What to update and where to look for releases
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Executable to update (defaults to this executable)
    #[arg(long, value_name = "PATH")]
    pub exe: Option<PathBuf>,

    /// Settings file (defaults to updater.toml in the config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Release feed URL
    #[arg(long, env = "STT_UPDATER_FEED_URL")]
    pub feed_url: Option<String>,

    /// Release asset to install
    #[arg(long, env = "STT_UPDATER_ASSET")]
    pub asset_name: Option<String>,

    /// File recording the installed version
    #[arg(long, value_name = "PATH")]
    pub version_file: Option<PathBuf>,
}

impl TargetArgs {
    /// Settings file merged with command-line overrides
    pub fn settings(&self) -> UpdaterSettings {
        let mut settings = match &self.config {
            Some(path) => UpdaterSettings::load_from(path),
            None => UpdaterSettings::load(),
        };

        if let Some(url) = &self.feed_url {
            settings.feed_url = url.clone();
        }
        if let Some(asset) = &self.asset_name {
            settings.asset_name = asset.clone();
        }
        if let Some(path) = &self.version_file {
            settings.version_file = Some(path.clone());
        }
        settings
    }

    pub fn live_exe(&self) -> anyhow::Result<PathBuf> {
        match &self.exe {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| anyhow::anyhow!("cannot locate the running executable: {}", e)),
        }
    }

    pub fn orchestrator(&self, invocation: Invocation) -> anyhow::Result<UpdateOrchestrator> {
        let settings = self.settings();
        let live_exe = self.live_exe()?;
        tracing::debug!(
            exe = %live_exe.display(),
            feed = %settings.feed_url,
            asset = %settings.asset_name,
            "update target"
        );
        Ok(UpdateOrchestrator::from_settings(&settings, live_exe, invocation)?)
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct UpdateArgs {
    /// Install without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Arguments for the relaunched application
    #[arg(last = true)]
    pub relaunch_args: Vec<String>,
}

/// Exit code for a failed command
pub fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<UpdateError>() {
        Some(UpdateError::Permission(_)) => exit_codes::PERMISSION_DENIED,
        Some(_) => exit_codes::UPDATE_FAILED,
        None => exit_codes::UNEXPECTED_FAILURE,
    }
}
