pub mod anthropic;
pub mod codewhisperer;
pub mod decoder;
pub mod models;
pub mod openai;
pub mod stream;

pub use decoder::{DecodeError, EventStreamDecoder, ParsedCompletion, ParsedToolCall};
pub use stream::{sse_frame, BlockDelta, ContentBlockStart, StreamEvent};
