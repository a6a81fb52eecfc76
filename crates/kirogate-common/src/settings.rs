use serde::{Deserialize, Serialize};

/// Runtime-tunable settings, persisted as a singleton JSON row in the
/// `settings` table and hot-swapped without a restart.
///
/// Zero or negative values disable the corresponding control and fall back
/// to global behavior (or no limit at all), matching the admin UI contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    pub request_timeout_sec: u64,
    pub max_retries: u32,
    pub cooldown_sec: u64,

    pub token_rate_limit_qps: f64,
    pub token_rate_limit_burst: u32,
    pub token_max_concurrent: u32,
    pub group_max_concurrent: u32,

    pub refresh_concurrency: u32,
    pub session_duration_min: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit_qps: 50.0,
            rate_limit_burst: 100,
            request_timeout_sec: 120,
            max_retries: 2,
            cooldown_sec: 30,

            token_rate_limit_qps: 0.0,
            token_rate_limit_burst: 0,
            token_max_concurrent: 2,
            group_max_concurrent: 0,

            refresh_concurrency: 20,
            session_duration_min: 60,
        }
    }
}

impl Settings {
    pub fn effective_cooldown_sec(&self, group_override: u64) -> u64 {
        if group_override > 0 {
            group_override
        } else if self.cooldown_sec > 0 {
            self.cooldown_sec
        } else {
            30
        }
    }
}
