//! STT Desktop self-updater
//!
//! Library side of `stt-updater`: release checks, verified downloads and
//! in-place executable replacement with rollback.

pub mod logging;
pub mod settings;
pub mod update;

pub use settings::UpdaterSettings;
pub use update::{UpdateError, UpdateOrchestrator};
