//! `cleanup` and `version` commands

use super::{exit_codes, TargetArgs};
use stt_updater::update::{cleanup_previous_install, VersionStore};

pub fn cleanup(target: &TargetArgs) -> anyhow::Result<i32> {
    let exe = target.live_exe()?;
    match cleanup_previous_install(&exe) {
        0 => println!("Nothing to clean up."),
        n => println!("Removed {} leftover file(s).", n),
    }
    Ok(exit_codes::SUCCESS)
}

pub fn version(target: &TargetArgs, json: bool) -> anyhow::Result<i32> {
    let exe = target.live_exe()?;
    let store = VersionStore::new(target.settings().version_file_for(&exe));
    let installed = store.read();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "installed": installed.map(|v| v.to_string()),
                "version_file": store.path().display().to_string(),
            })
        );
    } else {
        match installed {
            Some(v) => println!("{}", v),
            None => println!("unknown"),
        }
    }
    Ok(exit_codes::SUCCESS)
}
