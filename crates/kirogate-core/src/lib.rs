mod accounting;
mod context;
mod executor;
mod lifecycle;
mod limiter;
mod stream;

pub use accounting::Accounting;
pub use context::{AppContext, SettingsManager};
pub use executor::{is_retryable_status, ExecuteError, UpstreamExecutor, UpstreamResponse};
pub use lifecycle::RequestLifecycle;
pub use limiter::{GlobalRateLimiter, PerTokenLimiters, SemaphoreGuard, SemaphoreRegistry};
pub use stream::{
    compute_stop_reason, AnthropicEmitter, OpenAiEmitter, StreamEmitter, StreamProcessor,
};
