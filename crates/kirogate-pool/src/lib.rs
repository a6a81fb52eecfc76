mod apikey;
mod cache;
mod group;
mod metrics;
mod mirror;
mod pool;
mod refresh_loop;

pub use apikey::ApiKeyManager;
pub use cache::{CachedToken, TokenCache, TokenInfo, TokenWithUsage};
pub use group::GroupManager;
pub use metrics::{MetricsSnapshot, TokenMetrics};
pub use mirror::InflightMirror;
pub use pool::{PoolError, PoolStats, PooledToken, TokenPoolManager};
pub use refresh_loop::BackgroundRefresher;
