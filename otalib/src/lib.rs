pub mod artifact;
pub mod checkpoint;
pub mod control;
pub mod error;
pub mod events;
pub mod file;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod state;
pub mod storage;
pub mod transfer;
pub mod verify;

pub use artifact::ArtifactMetadata;
pub use error::ErrorKind;
pub use events::DownloadEvent;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, StatusSnapshot};
pub use state::DownloadState;
