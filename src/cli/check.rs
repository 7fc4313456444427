//! `check` command

use serde::Serialize;

use super::{exit_codes, TargetArgs};
use stt_updater::update::{CheckOutcome, Invocation, ReleaseDescriptor, Version};

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    status: &'static str,
    installed: Option<String>,
    latest: Option<String>,
    release: Option<&'a ReleaseDescriptor>,
}

pub async fn run(target: &TargetArgs, json: bool) -> anyhow::Result<i32> {
    let orchestrator = target.orchestrator(Invocation::current())?;
    let installed = orchestrator.installed_version();
    let outcome = orchestrator.check().await?;

    let code = match &outcome {
        CheckOutcome::UpdateAvailable(_) => {
            // Reporting only; leave the session idle for the next run
            orchestrator.decline()?;
            exit_codes::UPDATE_AVAILABLE
        }
        _ => exit_codes::SUCCESS,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report(&outcome, installed))?);
    } else {
        print_outcome(&outcome, installed);
    }

    Ok(code)
}

fn report(outcome: &CheckOutcome, installed: Option<Version>) -> CheckReport<'_> {
    let installed = installed.map(|v| v.to_string());
    match outcome {
        CheckOutcome::UpToDate { latest, .. } => CheckReport {
            status: "up_to_date",
            installed,
            latest: Some(latest.to_string()),
            release: None,
        },
        CheckOutcome::Incompatible { .. } => CheckReport {
            status: "incompatible",
            installed,
            latest: None,
            release: None,
        },
        CheckOutcome::UpdateAvailable(release) => CheckReport {
            status: "update_available",
            installed,
            latest: Some(release.version.to_string()),
            release: Some(release),
        },
    }
}

fn print_outcome(outcome: &CheckOutcome, installed: Option<Version>) {
    match outcome {
        CheckOutcome::UpToDate { latest, .. } => {
            println!("Up to date ({}).", latest.tag());
        }
        CheckOutcome::Incompatible { detail } => {
            println!("The latest release has no download for this installation.");
            tracing::debug!("{}", detail);
        }
        CheckOutcome::UpdateAvailable(release) => {
            super::update::print_release(release, installed);
            println!("Run `stt-updater update` to install it.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_for_up_to_date() {
        let outcome = CheckOutcome::UpToDate {
            installed: Some(Version::new(1, 0, 5)),
            latest: Version::new(1, 0, 5),
        };
        let report = report(&outcome, Some(Version::new(1, 0, 5)));

        assert_eq!(report.status, "up_to_date");
        assert_eq!(report.latest.as_deref(), Some("1.0.5"));
        assert!(report.release.is_none());
    }

    #[test]
    fn test_report_serializes_release() {
        let release = ReleaseDescriptor {
            tag: "v1.1.0".into(),
            version: Version::new(1, 1, 0),
            title: "1.1.0".into(),
            notes: "Faster".into(),
            asset_url: "https://example.invalid/STTDesktop.exe".into(),
            asset_name: "STTDesktop.exe".into(),
            asset_size: Some(42),
            sha256: None,
            checksum_url: None,
        };
        let outcome = CheckOutcome::UpdateAvailable(release);

        let json = serde_json::to_value(report(&outcome, None)).unwrap();
        assert_eq!(json["status"], "update_available");
        assert_eq!(json["installed"], serde_json::Value::Null);
        assert_eq!(json["release"]["tag"], "v1.1.0");
    }
}
