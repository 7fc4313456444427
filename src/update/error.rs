//! Error taxonomy for the update subsystem

use std::io;
use thiserror::Error;

/// Errors that can occur while checking for, downloading or applying an update
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid release feed response: {0}")]
    Parse(String),

    #[error("No published release found: {0}")]
    NotFound(String),

    #[error("Release has no compatible asset: {0}")]
    IncompatibleAsset(String),

    #[error("Disk error: {0}")]
    Disk(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Could not replace executable: {0}")]
    Swap(String),

    #[error("Could not restart after update: {0}")]
    Relaunch(String),

    #[error("No update is waiting for confirmation")]
    NoPendingUpdate,

    #[error("Update cancelled")]
    Cancelled,

    #[error("An update is already in progress")]
    Busy,
}

impl UpdateError {
    /// Whether a silent retry might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Network(_))
    }

    /// Text shown to the user; the logged detail comes from `Display`
    pub fn user_message(&self) -> String {
        match self {
            UpdateError::Permission(_) => {
                "Update failed: the application folder is not writable. \
                 Run the updater as administrator and try again. \
                 The current version keeps working."
                    .to_string()
            }
            UpdateError::Cancelled => {
                "Update cancelled. Continuing with the current version.".to_string()
            }
            UpdateError::Busy => "An update is already in progress.".to_string(),
            UpdateError::Relaunch(_) => {
                "The update was installed. Please restart the application.".to_string()
            }
            _ => "Update failed, continuing with the current version.".to_string(),
        }
    }

    /// Map a filesystem error, keeping permission problems distinguishable
    pub(crate) fn from_io(context: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                UpdateError::Permission(format!("{}: {}", context, err))
            }
            _ => UpdateError::Disk(format!("{}: {}", context, err)),
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpdateError::Parse(err.to_string())
        } else {
            UpdateError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_transient() {
        assert!(UpdateError::Network("timeout".into()).is_transient());
        assert!(!UpdateError::Parse("bad json".into()).is_transient());
        assert!(!UpdateError::NotFound("404".into()).is_transient());
        assert!(!UpdateError::Cancelled.is_transient());
    }

    #[test]
    fn test_permission_message_is_actionable() {
        let msg = UpdateError::Permission("rename".into()).user_message();
        assert!(msg.contains("administrator"));

        let msg = UpdateError::Swap("rename".into()).user_message();
        assert!(msg.contains("continuing with the current version"));
    }

    #[test]
    fn test_from_io_maps_permission_denied() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            UpdateError::from_io("rename", &err),
            UpdateError::Permission(_)
        ));

        let err = io::Error::new(io::ErrorKind::Other, "disk full");
        assert!(matches!(UpdateError::from_io("write", &err), UpdateError::Disk(_)));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = UpdateError::Integrity("size 1 != 2".into());
        assert!(err.to_string().contains("size 1 != 2"));
    }
}
