use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::constants::{KIRO_IDE_VERSION, KIRO_NODE_VERSION, KIRO_OS, KIRO_SDK_VERSION};

/// Per-credential synthetic fingerprint, stable for the process lifetime.
/// Derived from the refresh-token prefix, a base timestamp, and an
/// allocation counter, so two credentials never share one.
pub struct FingerprintManager {
    base_time: i128,
    fingerprints: RwLock<HashMap<String, String>>,
}

impl FingerprintManager {
    pub fn new() -> Self {
        Self {
            base_time: time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
            fingerprints: RwLock::new(HashMap::new()),
        }
    }

    /// Key by the first 16 bytes of the refresh token.
    pub fn fingerprint_for(&self, refresh_token: &str) -> String {
        let key: String = refresh_token.chars().take(16).collect();

        if let Ok(map) = self.fingerprints.read() {
            if let Some(fp) = map.get(&key) {
                return fp.clone();
            }
        }

        let mut map = match self.fingerprints.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(fp) = map.get(&key) {
            return fp.clone();
        }
        let seed = format!("{}-{}-{}", key, self.base_time, map.len());
        let fp = hex_sha256(seed.as_bytes());
        map.insert(key, fp.clone());
        fp
    }
}

impl Default for FingerprintManager {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// `User-Agent` for completion calls, embedding the credential fingerprint.
pub fn kiro_user_agent(fingerprint: &str) -> String {
    let kiro_id = format!("KiroIDE-{KIRO_IDE_VERSION}-{fingerprint}");
    format!(
        "aws-sdk-js/{KIRO_SDK_VERSION} ua/2.1 os/{KIRO_OS} lang/js md/nodejs#{KIRO_NODE_VERSION} api/codewhispererstreaming#{KIRO_SDK_VERSION} m/E {kiro_id}"
    )
}

pub fn kiro_amz_user_agent(fingerprint: &str) -> String {
    format!("aws-sdk-js/{KIRO_SDK_VERSION} KiroIDE-{KIRO_IDE_VERSION}-{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_per_credential() {
        let mgr = FingerprintManager::new();
        let a1 = mgr.fingerprint_for("rt-aaaaaaaaaaaaaaaa-rest");
        let a2 = mgr.fingerprint_for("rt-aaaaaaaaaaaaaaaa-other-suffix");
        let b = mgr.fingerprint_for("rt-bbbbbbbbbbbbbbbb");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 64);
    }

    #[test]
    fn user_agent_carries_fingerprint() {
        let ua = kiro_user_agent("deadbeef");
        assert!(ua.contains("KiroIDE-"));
        assert!(ua.ends_with("deadbeef"));
        assert!(ua.contains("api/codewhispererstreaming#"));
    }
}
