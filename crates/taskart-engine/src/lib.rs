pub mod config;
pub mod dedup;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod retry;

pub use config::EngineConfig;
pub use orchestrator::{
    request_for_target, GenerationResult, ImageOrchestrator, ImageOutcome, ProgressFn,
    ProgressStage, WarmUpReport,
};
pub use providers::{select_provider, ImageProvider};
pub use retry::RetryPolicy;
