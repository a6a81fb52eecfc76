use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use kirogate_auth::FingerprintManager;
use kirogate_common::{BootConfig, Settings};
use kirogate_pool::{ApiKeyManager, BackgroundRefresher, GroupManager, TokenPoolManager};
use kirogate_storage::{LogStore, StoreError, TokenStore};
use kirogate_translate::IdentityManager;

use crate::accounting::Accounting;
use crate::executor::UpstreamExecutor;
use crate::limiter::GlobalRateLimiter;

/// Runtime settings with persistence; readers hold the swap handle and see
/// updates without locking.
pub struct SettingsManager {
    store: TokenStore,
    current: Arc<ArcSwap<Settings>>,
}

impl SettingsManager {
    pub fn new(store: TokenStore) -> Self {
        Self {
            store,
            current: Arc::new(ArcSwap::from_pointee(Settings::default())),
        }
    }

    pub async fn load(&self) -> Result<(), StoreError> {
        if let Some(raw) = self.store.load_settings_json().await? {
            match serde_json::from_str::<Settings>(&raw) {
                Ok(saved) => self.current.store(Arc::new(saved)),
                Err(err) => {
                    tracing::warn!(error = %err, "stored settings unreadable, using defaults")
                }
            }
        }
        Ok(())
    }

    pub fn get(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    pub fn handle(&self) -> Arc<ArcSwap<Settings>> {
        self.current.clone()
    }

    pub async fn update(&self, settings: Settings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string());
        self.store.save_settings_json(&raw).await?;
        self.current.store(Arc::new(settings));
        Ok(())
    }
}

/// Everything the request path needs, wired once at boot and passed as
/// axum state. No implicit globals.
pub struct AppContext {
    pub boot: BootConfig,
    pub settings: SettingsManager,
    pub store: TokenStore,
    pub logs: LogStore,
    pub pool: Arc<TokenPoolManager>,
    pub groups: Arc<GroupManager>,
    pub api_keys: Arc<ApiKeyManager>,
    pub identity: IdentityManager,
    pub fingerprints: Arc<FingerprintManager>,
    pub executor: UpstreamExecutor,
    pub limiter: GlobalRateLimiter,
    pub accounting: Accounting,
    pub refresher: Arc<BackgroundRefresher>,
    pub started_at: Instant,
}

impl AppContext {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
