mod classify;
mod constants;
mod fingerprint;
mod refresh;
mod usage;

pub use classify::{contains_ci_exact, is_banned_error, is_suspended_error};
pub use constants::{
    COMPLETION_URL, IDC_REFRESH_URL, KIRO_IDE_VERSION, KIRO_NODE_VERSION, KIRO_OS,
    KIRO_SDK_VERSION, SOCIAL_REFRESH_URL, USAGE_LIMITS_URL,
};
pub use fingerprint::{kiro_amz_user_agent, kiro_user_agent, FingerprintManager};
pub use refresh::{AuthKind, RefreshClient, RefreshError, RefreshedToken};
pub use usage::{available_credit, snapshot as usage_snapshot, UsageSnapshot};
