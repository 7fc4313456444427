//! Update session state
//!
//! One [`UpdateSession`] exists per orchestrator and is only mutated by it.
//! Observers get immutable [`SessionSnapshot`]s.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use super::{ReleaseDescriptor, UpdateError, Version};

/// Phase of the update state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Swapping,
    Relaunching,
    Applied,
    Failed,
}

impl UpdatePhase {
    /// Only an idle or finished session may start a new check
    pub fn can_begin_check(self) -> bool {
        matches!(self, UpdatePhase::Idle | UpdatePhase::Applied)
    }

    /// Swapping and relaunching always run to completion or rollback
    pub fn is_cancellable(self) -> bool {
        matches!(self, UpdatePhase::UpdateAvailable | UpdatePhase::Downloading)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: UpdatePhase) -> bool {
        use UpdatePhase::*;

        match (self, next) {
            (Idle | Applied, Checking) => true,
            (Checking, UpToDate | UpdateAvailable) => true,
            (UpdateAvailable, Downloading) => true,
            (Downloading, Verifying) => true,
            (Verifying, Swapping) => true,
            (Swapping, Relaunching) => true,
            (Relaunching, Applied) => true,
            // Decline, or a terminal phase settling back to idle
            (UpdateAvailable | UpToDate | Failed, Idle) => true,
            (Checking | UpdateAvailable | Downloading | Verifying | Swapping | Relaunching, Failed) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::UpToDate => "up to date",
            UpdatePhase::UpdateAvailable => "update available",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Swapping => "installing",
            UpdatePhase::Relaunching => "restarting",
            UpdatePhase::Applied => "applied",
            UpdatePhase::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// How the last session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    UpToDate,
    /// The latest release has no asset for this installation
    Incompatible,
    Declined,
    Applied { version: Version, relaunched: bool },
    Failed(UpdateError),
}

/// Read-only view of the session handed to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub phase: UpdatePhase,
    pub release: Option<ReleaseDescriptor>,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<SessionOutcome>,
    pub last_error: Option<UpdateError>,
}

impl SessionSnapshot {
    /// Download progress in percent, when the total is known
    pub fn progress_percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(total) if total > 0 => {
                Some((self.bytes_downloaded as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Mutable session state owned by the orchestrator
#[derive(Debug)]
pub(crate) struct UpdateSession {
    id: Option<Uuid>,
    phase: UpdatePhase,
    release: Option<ReleaseDescriptor>,
    bytes_downloaded: u64,
    bytes_total: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    last_outcome: Option<SessionOutcome>,
    last_error: Option<UpdateError>,
}

impl UpdateSession {
    pub(crate) fn new() -> Self {
        Self {
            id: None,
            phase: UpdatePhase::Idle,
            release: None,
            bytes_downloaded: 0,
            bytes_total: None,
            started_at: None,
            last_outcome: None,
            last_error: None,
        }
    }

    pub(crate) fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub(crate) fn release(&self) -> Option<&ReleaseDescriptor> {
        self.release.as_ref()
    }

    /// Start a fresh session; fails with `Busy` while another one is running
    pub(crate) fn begin(&mut self) -> Result<Uuid, UpdateError> {
        if !self.phase.can_begin_check() {
            return Err(UpdateError::Busy);
        }
        let id = Uuid::new_v4();
        self.id = Some(id);
        self.release = None;
        self.bytes_downloaded = 0;
        self.bytes_total = None;
        self.started_at = Some(Utc::now());
        self.phase = UpdatePhase::Checking;
        Ok(id)
    }

    /// Move along an edge of the state machine
    pub(crate) fn advance(&mut self, next: UpdatePhase) -> Result<(), UpdateError> {
        if !self.phase.can_transition_to(next) {
            tracing::error!(from = %self.phase, to = %next, "invalid update phase transition");
            return Err(match self.phase {
                UpdatePhase::Idle | UpdatePhase::Applied => UpdateError::NoPendingUpdate,
                _ => UpdateError::Busy,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub(crate) fn set_release(&mut self, release: ReleaseDescriptor) {
        self.bytes_total = release.asset_size;
        self.release = Some(release);
    }

    pub(crate) fn set_progress(&mut self, done: u64, total: Option<u64>) {
        self.bytes_downloaded = done;
        if total.is_some() {
            self.bytes_total = total;
        }
    }

    /// Record the outcome of the current session
    pub(crate) fn finish(&mut self, outcome: SessionOutcome) {
        self.last_error = match &outcome {
            SessionOutcome::Failed(e) => Some(e.clone()),
            _ => None,
        };
        self.last_outcome = Some(outcome);
    }

    /// Drop per-session data once a terminal phase has been published
    pub(crate) fn settle(&mut self) {
        if matches!(
            self.phase,
            UpdatePhase::Idle | UpdatePhase::UpToDate | UpdatePhase::Failed
        ) {
            self.phase = UpdatePhase::Idle;
            self.id = None;
            self.release = None;
            self.bytes_downloaded = 0;
            self.bytes_total = None;
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            phase: self.phase,
            release: self.release.clone(),
            bytes_downloaded: self.bytes_downloaded,
            bytes_total: self.bytes_total,
            started_at: self.started_at,
            last_outcome: self.last_outcome.clone(),
            last_error: self.last_error.clone(),
        }
    }
}
