use std::collections::HashMap;

use tokio::sync::RwLock;

use kirogate_storage::{ApiKeyRecord, StoreError, TokenStore};

/// API-key registry. Keys are loaded from the store at boot; when none
/// exist, `KIRO_CLIENT_TOKEN` seeds a full-access key for compatibility
/// with older deployments.
pub struct ApiKeyManager {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    store: TokenStore,
}

impl ApiKeyManager {
    pub async fn load(store: TokenStore) -> Result<Self, StoreError> {
        let mut keys: HashMap<String, ApiKeyRecord> = store
            .list_api_keys()
            .await?
            .into_iter()
            .filter(|k| !k.key.is_empty())
            .map(|k| (k.key.clone(), k))
            .collect();

        if keys.is_empty() {
            if let Ok(env_key) = std::env::var("KIRO_CLIENT_TOKEN") {
                if !env_key.is_empty() {
                    let record = ApiKeyRecord {
                        key: env_key.clone(),
                        name: Some("default".to_string()),
                        allowed_groups: Vec::new(),
                    };
                    store.save_api_key(&record).await?;
                    keys.insert(env_key, record);
                }
            }
        }

        Ok(Self {
            keys: RwLock::new(keys),
            store,
        })
    }

    pub async fn get(&self, key: &str) -> Option<ApiKeyRecord> {
        self.keys.read().await.get(key).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<ApiKeyRecord> {
        let mut keys: Vec<ApiKeyRecord> = self.keys.read().await.values().cloned().collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        keys
    }

    /// Empty whitelist means every group is allowed.
    pub async fn has_group_permission(&self, key: &str, group: &str) -> bool {
        match self.get(key).await {
            Some(record) => {
                record.allowed_groups.is_empty()
                    || record.allowed_groups.iter().any(|g| g == group)
            }
            None => false,
        }
    }

    pub async fn save(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        self.store.save_api_key(&record).await?;
        self.keys
            .write()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.keys.write().await.remove(key).is_some();
        if existed {
            self.store.delete_api_key(key).await?;
        }
        Ok(existed)
    }
}
