/// Substring matching used by the ban/suspend classifiers. An empty needle
/// always matches; callers depend on this edge case.
pub fn contains_ci_exact(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.contains(needle)
}

/// Upstream rejected the refresh token outright. The wording is part of the
/// upstream's observed behavior; both conditions must hold.
pub fn is_banned_error(message: &str) -> bool {
    contains_ci_exact(message, "401") && contains_ci_exact(message, "Bad credentials")
}

/// Account-level suspension reported by the quota endpoint.
pub fn is_suspended_error(message: &str) -> bool {
    contains_ci_exact(message, "TEMPORARILY_SUSPENDED") || contains_ci_exact(message, "suspended")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_needle_always_matches() {
        assert!(contains_ci_exact("anything", ""));
        assert!(contains_ci_exact("", ""));
    }

    #[test]
    fn banned_requires_both_markers() {
        assert!(is_banned_error(
            "refresh failed: status 401, body: Bad credentials"
        ));
        assert!(!is_banned_error("status 401, body: expired"));
        assert!(!is_banned_error("Bad credentials without a status"));
    }

    #[test]
    fn suspended_matches_known_strings() {
        assert!(is_suspended_error("TEMPORARILY_SUSPENDED"));
        assert!(is_suspended_error("account suspended pending review"));
        assert!(!is_suspended_error("rate limited"));
    }
}
