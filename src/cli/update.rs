//! `update` command

use indicatif::{ProgressBar, ProgressStyle};
use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use super::{exit_codes, TargetArgs, UpdateArgs};
use stt_updater::update::{
    ApplyOutcome, CheckOutcome, Invocation, ReleaseDescriptor, UpdateError, Version,
};

pub async fn run(target: &TargetArgs, args: UpdateArgs) -> anyhow::Result<i32> {
    let invocation = Invocation::new(
        args.relaunch_args.into_iter().map(OsString::from).collect(),
        std::env::current_dir()?,
    );
    let orchestrator = Arc::new(target.orchestrator(invocation)?);
    let installed = orchestrator.installed_version();

    let release = match orchestrator.check().await? {
        CheckOutcome::UpToDate { latest, .. } => {
            println!("Up to date ({}).", latest.tag());
            return Ok(exit_codes::SUCCESS);
        }
        CheckOutcome::Incompatible { .. } => {
            println!("The latest release has no download for this installation.");
            return Ok(exit_codes::SUCCESS);
        }
        CheckOutcome::UpdateAvailable(release) => release,
    };

    print_release(&release, installed);
    if !args.yes && !confirm(&release).await? {
        orchestrator.decline()?;
        println!("Update skipped.");
        return Ok(exit_codes::SUCCESS);
    }

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && orchestrator.cancel() {
                eprintln!("Cancelling update...");
            }
        })
    };

    let bar = progress_bar(release.asset_size);
    let result = orchestrator
        .apply(|done, total| {
            if let Some(total) = total {
                bar.set_length(total);
            }
            bar.set_position(done);
        })
        .await;
    interrupt.abort();

    match result {
        Ok(outcome) => {
            bar.finish_with_message("installed");
            if outcome.relaunched {
                println!("Updated to {}. Restarting.", outcome.version.tag());
            } else {
                println!("Updated to {}.", outcome.version.tag());
                println!("{}", UpdateError::Relaunch(String::new()).user_message());
            }
            Ok(applied_exit_code(&outcome))
        }
        Err(e) => {
            bar.abandon();
            eprintln!("{}", e.user_message());
            Err(e.into())
        }
    }
}

/// Exit with `UPDATE_APPLIED` only when the new process took over
fn applied_exit_code(outcome: &ApplyOutcome) -> i32 {
    if outcome.relaunched {
        exit_codes::UPDATE_APPLIED
    } else {
        exit_codes::SUCCESS
    }
}

pub(crate) fn print_release(release: &ReleaseDescriptor, installed: Option<Version>) {
    match installed {
        Some(installed) => println!(
            "Update available: {} (installed: {})",
            release.tag,
            installed.tag()
        ),
        None => println!("Update available: {}", release.tag),
    }
    if release.title != release.tag {
        println!("  {}", release.title);
    }
    let notes = release.notes.trim();
    if !notes.is_empty() {
        println!();
        for line in notes.lines() {
            println!("  {}", line);
        }
        println!();
    }
}

async fn confirm(release: &ReleaseDescriptor) -> anyhow::Result<bool> {
    let prompt = format!("Install {} now? [y/N] ", release.tag);
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        print!("{}", prompt);
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await??;

    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn progress_bar(size: Option<u64>) -> ProgressBar {
    let bar = ProgressBar::new(size.unwrap_or(0));
    if let Ok(style) = ProgressStyle::with_template(
        "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
    ) {
        bar.set_style(style);
    }
    bar.set_message("downloading");
    bar
}
