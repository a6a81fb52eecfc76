use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use kirogate_protocol::codewhisperer::UsageLimits;

/// Selected-credential view handed to the request pipeline.
#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    pub id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct TokenWithUsage {
    pub token: TokenInfo,
    pub available: f64,
    pub is_usage_exceeded: bool,
}

/// Live access token plus quota snapshot for one credential.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
    pub usage: Option<UsageLimits>,
    /// Decremented optimistically on every selection, floored at zero.
    pub available: f64,
    pub cached_at: OffsetDateTime,
    pub last_used: Option<OffsetDateTime>,
}

impl CachedToken {
    pub fn is_usable(&self) -> bool {
        !self.access_token.is_empty() && self.expires_at > OffsetDateTime::now_utc()
    }
}

/// Shared access-token cache, keyed by credential id. Owned exclusively by
/// the pool manager; the background refresher converges it through the pool.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<i64, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<CachedToken> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn set(&self, id: i64, entry: CachedToken) {
        self.entries.write().await.insert(id, entry);
    }

    pub async fn remove(&self, id: i64) {
        self.entries.write().await.remove(&id);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Optimistic spend on selection; returns the remaining balance.
    pub async fn consume_one(&self, id: i64) -> Option<f64> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        if entry.available > 0.0 {
            entry.available -= 1.0;
            if entry.available < 0.0 {
                entry.available = 0.0;
            }
        }
        entry.last_used = Some(OffsetDateTime::now_utc());
        Some(entry.available)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(available: f64, expires_in_secs: i64) -> CachedToken {
        CachedToken {
            access_token: "at".to_string(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(expires_in_secs),
            usage: None,
            available,
            cached_at: OffsetDateTime::now_utc(),
            last_used: None,
        }
    }

    #[test]
    fn usability_requires_token_and_future_expiry() {
        assert!(entry(1.0, 60).is_usable());
        assert!(!entry(1.0, -60).is_usable());
        let mut empty = entry(1.0, 60);
        empty.access_token.clear();
        assert!(!empty.is_usable());
    }

    #[tokio::test]
    async fn consume_one_floors_at_zero() {
        let cache = TokenCache::new();
        cache.set(7, entry(0.5, 60)).await;
        assert_eq!(cache.consume_one(7).await, Some(0.0));
        assert_eq!(cache.consume_one(7).await, Some(0.0));
        assert!(cache.get(7).await.unwrap().last_used.is_some());
    }
}
