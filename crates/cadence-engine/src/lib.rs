pub mod control;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;

pub use error::{EngineError, Result};
pub use orchestrator::{CleanupReport, Deps, JobOrchestrator, TickOutcome};
pub use registry::JobRegistry;
