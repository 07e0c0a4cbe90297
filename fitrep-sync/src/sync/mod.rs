pub mod backoff;
mod orchestrator;

pub use backoff::Backoff;
pub use orchestrator::{SyncError, SyncOrchestrator, SyncOutcome, SyncPolicy, SyncReport};
