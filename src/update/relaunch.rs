//! Hand-off from the old process to the freshly installed one

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::UpdateError;

/// Exit code of the old process after a successful update hand-off
///
/// Distinct from a normal exit so launchers can tell "closed by user" from
/// "restarting for update".
pub const UPDATE_APPLIED_EXIT_CODE: i32 = 10;

/// Arguments and working directory to start the new process with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl Invocation {
    /// The current process's arguments (minus argv[0]) and working directory
    pub fn current() -> Self {
        Self {
            args: std::env::args_os().skip(1).collect(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn new(args: Vec<OsString>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            args,
            working_dir: working_dir.into(),
        }
    }
}

/// Starts the replacement process
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, exe: &Path, invocation: &Invocation) -> Result<(), UpdateError>;
}

/// Spawns the new executable as a detached child
#[derive(Debug, Clone, Default)]
pub struct ProcessRelauncher;

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, exe: &Path, invocation: &Invocation) -> Result<(), UpdateError> {
        let mut cmd = Command::new(exe);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = cmd.spawn().map_err(|e| {
            UpdateError::Relaunch(format!("cannot start {}: {}", exe.display(), e))
        })?;

        tracing::info!(
            pid = child.id(),
            exe = %exe.display(),
            cwd = %invocation.working_dir.display(),
            "started updated executable"
        );
        Ok(())
    }
}
