use kirogate_protocol::codewhisperer::UsageLimits;

/// Quota figures lifted from a usage-limits response, ready to persist.
#[derive(Debug, Clone, Default)]
pub struct UsageSnapshot {
    pub available: f64,
    pub base: f64,
    pub free_trial: f64,
    pub total_limit: f64,
    pub current: f64,
    pub user_email: Option<String>,
}

/// Remaining CREDIT units: base (limit − current) plus the active free
/// trial's (limit − current). Never negative.
pub fn available_credit(usage: &UsageLimits) -> f64 {
    snapshot(usage).available
}

pub fn snapshot(usage: &UsageLimits) -> UsageSnapshot {
    let mut snap = UsageSnapshot::default();
    for breakdown in &usage.usage_breakdown_list {
        if breakdown.resource_type != "CREDIT" {
            continue;
        }
        snap.base = breakdown.usage_limit_with_precision - breakdown.current_usage_with_precision;
        snap.total_limit = breakdown.usage_limit_with_precision;
        snap.current = breakdown.current_usage_with_precision;

        if let Some(trial) = &breakdown.free_trial_info {
            if trial.free_trial_status == "ACTIVE" {
                snap.free_trial =
                    trial.usage_limit_with_precision - trial.current_usage_with_precision;
                snap.total_limit += trial.usage_limit_with_precision;
                snap.current += trial.current_usage_with_precision;
            }
        }
        break;
    }
    snap.available = (snap.base + snap.free_trial).max(0.0);
    if !usage.user_info.email.is_empty() {
        snap.user_email = Some(usage.user_info.email.clone());
    }
    snap
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_protocol::codewhisperer::{FreeTrialInfo, UsageBreakdown};

    fn credit(limit: f64, current: f64, trial: Option<FreeTrialInfo>) -> UsageLimits {
        UsageLimits {
            usage_breakdown_list: vec![UsageBreakdown {
                resource_type: "CREDIT".to_string(),
                usage_limit_with_precision: limit,
                current_usage_with_precision: current,
                free_trial_info: trial,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn sums_credit_and_active_free_trial() {
        let usage = credit(
            100.0,
            40.0,
            Some(FreeTrialInfo {
                free_trial_status: "ACTIVE".to_string(),
                usage_limit_with_precision: 50.0,
                current_usage_with_precision: 10.0,
            }),
        );
        assert_eq!(available_credit(&usage), 100.0);
    }

    #[test]
    fn inactive_trial_is_ignored() {
        let usage = credit(
            100.0,
            40.0,
            Some(FreeTrialInfo {
                free_trial_status: "EXPIRED".to_string(),
                usage_limit_with_precision: 50.0,
                current_usage_with_precision: 0.0,
            }),
        );
        assert_eq!(available_credit(&usage), 60.0);
    }

    #[test]
    fn overdrawn_floors_at_zero() {
        let usage = credit(100.0, 120.0, None);
        assert_eq!(available_credit(&usage), 0.0);
    }

    #[test]
    fn non_credit_resources_do_not_count() {
        let mut usage = credit(100.0, 0.0, None);
        usage.usage_breakdown_list[0].resource_type = "REQUEST".to_string();
        assert_eq!(available_credit(&usage), 0.0);
    }
}
