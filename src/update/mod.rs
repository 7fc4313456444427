//! Self-update subsystem
//!
//! Checks the release feed, downloads a newer executable next to the running
//! one, verifies it, swaps it in with rollback, and relaunches. The running
//! installation stays usable whatever happens along the way.

mod error;

pub mod download;
pub mod feed;
pub mod orchestrator;
pub mod relaunch;
pub mod session;
pub mod store;
pub mod swap;
pub mod verify;
pub mod version;

pub use download::{ArtifactSource, CancelFlag, HttpDownloader, StagedArtifact};
pub use error::UpdateError;
pub use feed::{GitHubReleaseFeed, ReleaseDescriptor, ReleaseFeed};
pub use orchestrator::{
    ApplyOutcome, CheckOutcome, OrchestratorOptions, OrchestratorParts, UpdateOrchestrator,
};
pub use relaunch::{Invocation, ProcessRelauncher, Relauncher, UPDATE_APPLIED_EXIT_CODE};
pub use session::{SessionOutcome, SessionSnapshot, UpdatePhase};
pub use store::VersionStore;
pub use swap::{cleanup_previous_install, BinarySwapper, SwapOutcome, SwapPaths};
pub use verify::{ExecutableFormat, IntegrityVerifier};
pub use version::Version;
