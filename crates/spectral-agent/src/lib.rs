pub mod archive;
pub mod chat;
pub mod codegen;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod intent;
pub mod planner;
pub mod verifier;

pub use chat::AssistantSession;
pub use dispatcher::{DispatchSummary, Dispatcher, RetryPolicy};
pub use engine::Engine;
pub use executor::{ExecutionRecord, ExecutorServer};
pub use planner::Planner;
pub use verifier::StepVerifier;

use spectral_llm::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("user input is empty")]
    EmptyInput,
    #[error("planning response could not be parsed: {0}")]
    UnparseableResponse(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
