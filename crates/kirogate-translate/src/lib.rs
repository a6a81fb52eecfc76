mod builder;
mod estimate;
mod identity;
mod openai;
mod thinking;
mod tools;

pub use builder::{build_codewhisperer_request, BuildError, BuildOptions};
pub use estimate::TokenEstimator;
pub use identity::{ClientContext, IdentityManager};
pub use openai::{chat_finish_reason, chat_to_messages, render_chat_completion};
pub use thinking::{ParsedChunk, ThinkingParser, THINKING_END_TAG, THINKING_PROMPT, THINKING_START_TAG};
pub use tools::{is_unsupported_tool, truncate_description};
