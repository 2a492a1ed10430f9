pub mod analysis;
pub mod confidence;
pub mod execution;
pub mod learning;
pub mod orchestrator;
pub mod result_check;
pub mod retry;
pub mod settings;
pub mod tools;
pub mod validation;

pub use orchestrator::{
    BatchReport, ConversationContext, RetryAttempt, RunControl, ToolCallReport, ToolCallRunner,
};
