//! Update orchestrator
//!
//! Sequences feed check, comparison, download, verification, swap and
//! relaunch for one session at a time. All session mutations go through this
//! type; the UI observes them through [`UpdateOrchestrator::subscribe`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use super::download::{ArtifactSource, CancelFlag, HttpDownloader, StagedArtifact};
use super::feed::{GitHubReleaseFeed, ReleaseDescriptor, ReleaseFeed};
use super::relaunch::{Invocation, ProcessRelauncher, Relauncher, UPDATE_APPLIED_EXIT_CODE};
use super::session::{SessionOutcome, SessionSnapshot, UpdatePhase, UpdateSession};
use super::store::VersionStore;
use super::swap::BinarySwapper;
use super::verify::IntegrityVerifier;
use super::version::{self, Version};
use super::UpdateError;
use crate::settings::UpdaterSettings;

/// Policy knobs for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Pause before the single silent retry of a failed feed request
    pub retry_delay: Duration,
    /// Refuse releases that publish no checksum
    pub require_checksum: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            require_checksum: false,
        }
    }
}

/// Collaborators the orchestrator drives
pub struct OrchestratorParts {
    pub feed: Arc<dyn ReleaseFeed>,
    pub source: Arc<dyn ArtifactSource>,
    pub relauncher: Arc<dyn Relauncher>,
    pub verifier: IntegrityVerifier,
    pub store: VersionStore,
    pub live_exe: PathBuf,
    pub invocation: Invocation,
    pub options: OrchestratorOptions,
}

/// Result of a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate {
        installed: Option<Version>,
        latest: Version,
    },
    /// Latest release carries no asset for this installation
    Incompatible { detail: String },
    /// A newer release is waiting for confirmation
    UpdateAvailable(ReleaseDescriptor),
}

/// Result of a confirmed update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub version: Version,
    pub installed: PathBuf,
    /// Whether the new process was started; if not, the user must restart
    pub relaunched: bool,
    /// Code the old process should exit with
    pub exit_code: i32,
}

/// Single owner of the update session
pub struct UpdateOrchestrator {
    feed: Arc<dyn ReleaseFeed>,
    source: Arc<dyn ArtifactSource>,
    relauncher: Arc<dyn Relauncher>,
    verifier: IntegrityVerifier,
    store: VersionStore,
    swapper: BinarySwapper,
    invocation: Invocation,
    options: OrchestratorOptions,
    session: Mutex<UpdateSession>,
    events: watch::Sender<SessionSnapshot>,
    cancel: CancelFlag,
}

impl UpdateOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let session = UpdateSession::new();
        let (events, _) = watch::channel(session.snapshot());

        Self {
            feed: parts.feed,
            source: parts.source,
            relauncher: parts.relauncher,
            verifier: parts.verifier,
            store: parts.store,
            swapper: BinarySwapper::new(&parts.live_exe),
            invocation: parts.invocation,
            options: parts.options,
            session: Mutex::new(session),
            events,
            cancel: CancelFlag::new(),
        }
    }

    /// Production wiring: GitHub feed, HTTP downloader, process relaunch
    pub fn from_settings(
        settings: &UpdaterSettings,
        live_exe: PathBuf,
        invocation: Invocation,
    ) -> Result<Self, UpdateError> {
        let feed = GitHubReleaseFeed::new(
            settings.feed_url.clone(),
            settings.asset_name.clone(),
            &settings.user_agent,
            settings.request_timeout(),
            settings.connect_timeout(),
        )?;
        let source = HttpDownloader::new(
            &settings.user_agent,
            settings.connect_timeout(),
            settings.stall_timeout(),
            settings.progress_interval(),
        )?;
        let store = VersionStore::new(settings.version_file_for(&live_exe));

        Ok(Self::new(OrchestratorParts {
            feed: Arc::new(feed),
            source: Arc::new(source),
            relauncher: Arc::new(ProcessRelauncher),
            verifier: IntegrityVerifier::default(),
            store,
            live_exe,
            invocation,
            options: OrchestratorOptions {
                retry_delay: settings.retry_delay(),
                require_checksum: settings.require_checksum,
            },
        }))
    }

    /// Receive a snapshot after every session change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn installed_version(&self) -> Option<Version> {
        self.store.read()
    }

    pub fn live_exe(&self) -> &std::path::Path {
        &self.swapper.paths().live
    }

    /// Request cancellation
    ///
    /// Declines a pending update, or aborts a running download. Returns
    /// `false` once swapping has started, since that phase always runs to
    /// completion or rollback.
    pub fn cancel(&self) -> bool {
        let session = self.lock();
        match session.phase() {
            UpdatePhase::UpdateAvailable => {
                drop(session);
                self.decline().is_ok()
            }
            UpdatePhase::Downloading => {
                // Set under the lock so it cannot slip past the move to Verifying
                self.cancel.cancel();
                tracing::info!("download cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Query the feed and compare against the installed version
    ///
    /// Returns `Busy` if a session is already active. Feed failures return
    /// the error and leave the orchestrator idle.
    pub async fn check(&self) -> Result<CheckOutcome, UpdateError> {
        let id = self.with_session(|s| s.begin())?;
        let span = tracing::info_span!("update_session", session = %id);
        self.run_check().instrument(span).await
    }

    async fn run_check(&self) -> Result<CheckOutcome, UpdateError> {
        tracing::info!("checking for updates");

        let release = match self.fetch_with_retry().await {
            Ok(release) => release,
            Err(UpdateError::IncompatibleAsset(detail)) => {
                tracing::warn!("latest release is not installable here: {}", detail);
                self.finish_up_to_date(SessionOutcome::Incompatible);
                return Ok(CheckOutcome::Incompatible { detail });
            }
            Err(e) => {
                tracing::warn!("could not determine latest version: {}", e);
                return Err(self.fail(e));
            }
        };

        let installed = self.store.read();
        if !version::is_newer(release.version, installed) {
            tracing::info!(
                latest = %release.version,
                installed = ?installed.map(|v| v.to_string()),
                "already up to date"
            );
            self.finish_up_to_date(SessionOutcome::UpToDate);
            return Ok(CheckOutcome::UpToDate {
                installed,
                latest: release.version,
            });
        }

        tracing::info!(
            latest = %release.version,
            installed = ?installed.map(|v| v.to_string()),
            "update available"
        );
        self.with_session(|s| s.set_release(release.clone()));
        self.advance(UpdatePhase::UpdateAvailable)?;
        Ok(CheckOutcome::UpdateAvailable(release))
    }

    /// Dismiss a pending update without downloading it
    pub fn decline(&self) -> Result<(), UpdateError> {
        self.with_session(|s| {
            if s.phase() != UpdatePhase::UpdateAvailable {
                return Err(pending_error(s.phase()));
            }
            s.advance(UpdatePhase::Idle)?;
            s.finish(SessionOutcome::Declined);
            s.settle();
            tracing::info!("update declined");
            Ok(())
        })
    }

    /// Download, verify, install and relaunch the pending update
    ///
    /// This is the confirmation gate: nothing is downloaded until the caller
    /// invokes it after a check reported `UpdateAvailable`.
    pub async fn apply<F>(&self, on_progress: F) -> Result<ApplyOutcome, UpdateError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        let (release, id) = self.with_session(|s| {
            if s.phase() != UpdatePhase::UpdateAvailable {
                return Err(pending_error(s.phase()));
            }
            let release = s.release().cloned().ok_or(UpdateError::NoPendingUpdate)?;
            self.cancel.reset();
            s.advance(UpdatePhase::Downloading)?;
            Ok((release, s.snapshot().session_id))
        })?;

        let span = tracing::info_span!(
            "update_session",
            session = ?id,
            version = %release.version
        );
        self.run_apply(release, &on_progress).instrument(span).await
    }

    async fn run_apply(
        &self,
        release: ReleaseDescriptor,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<ApplyOutcome, UpdateError> {
        let expected_sha256 = match self.resolve_checksum(&release).await {
            Ok(sum) => sum,
            Err(e) => return Err(self.fail(e)),
        };

        let staging = self.swapper.paths().staging.clone();
        let report = |done: u64, total: Option<u64>| {
            self.with_session(|s| s.set_progress(done, total));
            on_progress(done, total);
        };

        let staged = match self
            .source
            .download(&release.asset_url, &staging, &report, &self.cancel)
            .await
        {
            Ok(staged) => staged,
            Err(e) => return Err(self.fail(e)),
        };

        let verifying = self.with_session(|s| {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            s.advance(UpdatePhase::Verifying)
        });
        if let Err(e) = verifying {
            return Err(self.fail(e));
        }

        if let Err(e) = self.verify(&staged, &release, expected_sha256).await {
            return Err(self.fail(e));
        }

        self.advance(UpdatePhase::Swapping)?;
        let swapper = self.swapper.clone();
        let staged_path = staged.path.clone();
        let swapped = tokio::task::spawn_blocking(move || swapper.swap(&staged_path))
            .await
            .map_err(|e| UpdateError::Swap(format!("swap task failed: {}", e)))
            .and_then(|result| result);
        let outcome = match swapped {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e)),
        };

        // The new binary is in place; only now may the installed version change
        if let Err(e) = self.store.write(release.version) {
            tracing::warn!("update installed but the version file was not updated: {}", e);
        }

        self.advance(UpdatePhase::Relaunching)?;
        let relaunched = match self.relauncher.relaunch(&outcome.installed, &self.invocation) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("{}", e);
                false
            }
        };

        self.with_session(|s| {
            let _ = s.advance(UpdatePhase::Applied);
            s.finish(SessionOutcome::Applied {
                version: release.version,
                relaunched,
            });
        });
        tracing::info!(version = %release.version, relaunched, "update applied");

        Ok(ApplyOutcome {
            version: release.version,
            installed: outcome.installed,
            relaunched,
            exit_code: UPDATE_APPLIED_EXIT_CODE,
        })
    }

    async fn fetch_with_retry(&self) -> Result<ReleaseDescriptor, UpdateError> {
        match self.feed.fetch_latest().await {
            Err(e) if e.is_transient() => {
                tracing::info!("release feed request failed ({}), retrying once", e);
                tokio::time::sleep(self.options.retry_delay).await;
                self.feed.fetch_latest().await
            }
            other => other,
        }
    }

    async fn resolve_checksum(
        &self,
        release: &ReleaseDescriptor,
    ) -> Result<Option<String>, UpdateError> {
        if let Some(sum) = &release.sha256 {
            return Ok(Some(sum.clone()));
        }
        if let Some(url) = &release.checksum_url {
            return self.feed.fetch_checksum(url).await.map(Some);
        }
        if self.options.require_checksum {
            return Err(UpdateError::Integrity(format!(
                "release {} publishes no checksum",
                release.tag
            )));
        }
        Ok(None)
    }

    async fn verify(
        &self,
        staged: &StagedArtifact,
        release: &ReleaseDescriptor,
        expected_sha256: Option<String>,
    ) -> Result<(), UpdateError> {
        let verifier = self.verifier.clone();
        let staged = staged.clone();
        let release = release.clone();

        tokio::task::spawn_blocking(move || {
            verifier.verify(&staged, &release, expected_sha256.as_deref())
        })
        .await
        .map_err(|e| UpdateError::Integrity(format!("verification task failed: {}", e)))?
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UpdateSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the session and publish the resulting snapshot
    fn with_session<R>(&self, f: impl FnOnce(&mut UpdateSession) -> R) -> R {
        let mut session = self.lock();
        let result = f(&mut session);
        self.events.send_replace(session.snapshot());
        result
    }

    fn advance(&self, next: UpdatePhase) -> Result<(), UpdateError> {
        match self.with_session(|s| s.advance(next)) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn finish_up_to_date(&self, outcome: SessionOutcome) {
        self.with_session(|s| {
            let _ = s.advance(UpdatePhase::UpToDate);
            s.finish(outcome);
        });
        self.with_session(|s| s.settle());
    }

    /// Publish `Failed`, then return to idle; the previous binary is untouched
    fn fail(&self, err: UpdateError) -> UpdateError {
        tracing::warn!(user_message = %err.user_message(), "update session failed: {}", err);

        let staging = &self.swapper.paths().staging;
        match std::fs::remove_file(staging) {
            Ok(()) => tracing::debug!(path = %staging.display(), "removed staged artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %staging.display(), "could not remove staged artifact: {}", e),
        }

        self.with_session(|s| {
            let _ = s.advance(UpdatePhase::Failed);
            s.finish(SessionOutcome::Failed(err.clone()));
        });
        self.with_session(|s| s.settle());
        err
    }
}

fn pending_error(phase: UpdatePhase) -> UpdateError {
    match phase {
        UpdatePhase::Idle | UpdatePhase::Applied => UpdateError::NoPendingUpdate,
        _ => UpdateError::Busy,
    }
}
