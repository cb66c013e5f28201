//! Wire types for llamapod.
//!
//! Three surfaces share these types:
//! - the serverless job interface (`{ input: {...} }` in, `{ result }` or
//!   `{ error, ... }` out)
//! - the completion proxy's typed request/result
//! - the OpenAI-compatible chat API served by `llama_cpp.server`

pub mod chat;
pub mod completion;
pub mod job;
pub mod status;

pub use chat::{ChatCompletionRequest, ChatMessage, first_choice_content};
pub use completion::{
    CompletionFailure, CompletionRequest, CompletionResult, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};
pub use job::{Job, JobInput, JobOutput, JobResponse, JobStatus};
pub use status::RunnerStatus;
