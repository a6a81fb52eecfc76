/// SOCIAL refresh endpoint.
pub const SOCIAL_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

/// IDC (OIDC) refresh endpoint.
pub const IDC_REFRESH_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// Completion endpoint.
pub const COMPLETION_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse";

/// Usage-quota discovery endpoint.
pub const USAGE_LIMITS_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com/getUsageLimits";

// SDK identity carried in outbound user agents. The upstream rejects
// unrecognized client identities, so these mirror a pinned IDE release.
pub const KIRO_SDK_VERSION: &str = "1.0.27";
pub const KIRO_IDE_VERSION: &str = "0.8.0";
pub const KIRO_OS: &str = "win32#10.0.19044";
pub const KIRO_NODE_VERSION: &str = "22.17.0";
