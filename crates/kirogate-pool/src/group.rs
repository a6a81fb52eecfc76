use std::collections::HashMap;

use tokio::sync::RwLock;

use kirogate_storage::{GroupRecord, StoreError, TokenStore};

pub const DEFAULT_GROUP: &str = "default";

/// In-memory group registry, write-through to the store. Reserved names are
/// rejected here and again at the store layer.
pub struct GroupManager {
    groups: RwLock<HashMap<String, GroupRecord>>,
    store: TokenStore,
}

impl GroupManager {
    /// Load groups from the store; also discovers groups that exist only as
    /// `tokens.group_name` values and materializes them.
    pub async fn load(store: TokenStore) -> Result<Self, StoreError> {
        let mut groups: HashMap<String, GroupRecord> = store
            .list_groups()
            .await?
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();

        for stat in store.group_stats().await? {
            if stat.group_name.is_empty() || groups.contains_key(&stat.group_name) {
                continue;
            }
            let record = GroupRecord {
                name: stat.group_name.clone(),
                display_name: None,
                priority: 0,
                rate_limit_qps: 0.0,
                rate_limit_burst: 0,
                cooldown_sec: 0,
            };
            // The quarantine groups bypass the reserved-name check; they are
            // system-managed rows.
            let created = if stat.group_name == "banned" || stat.group_name == "exhausted" {
                store.ensure_group(&stat.group_name).await.is_ok()
            } else {
                store.create_group(&record).await.is_ok()
            };
            if created {
                groups.insert(record.name.clone(), record);
            }
        }

        if !groups.contains_key(DEFAULT_GROUP) {
            let record = GroupRecord {
                name: DEFAULT_GROUP.to_string(),
                display_name: Some("Default".to_string()),
                priority: 0,
                rate_limit_qps: 0.0,
                rate_limit_burst: 0,
                cooldown_sec: 0,
            };
            store.ensure_group(DEFAULT_GROUP).await?;
            groups.insert(record.name.clone(), record);
        }

        Ok(Self {
            groups: RwLock::new(groups),
            store,
        })
    }

    pub async fn get(&self, name: &str) -> Option<GroupRecord> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.groups.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<GroupRecord> {
        let mut groups: Vec<GroupRecord> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub async fn create(&self, record: GroupRecord) -> Result<(), StoreError> {
        if record.name.is_empty() {
            return Err(StoreError::ReservedGroup(String::new()));
        }
        let mut groups = self.groups.write().await;
        if groups.contains_key(&record.name) {
            return Err(StoreError::Duplicate);
        }
        self.store.create_group(&record).await?;
        groups.insert(record.name.clone(), record);
        Ok(())
    }

    pub async fn update(&self, record: GroupRecord) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        if !groups.contains_key(&record.name) {
            return Err(StoreError::NotFound);
        }
        self.store.update_group(&record).await?;
        groups.insert(record.name.clone(), record);
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), StoreError> {
        if new.is_empty() {
            return Err(StoreError::ReservedGroup(String::new()));
        }
        let mut groups = self.groups.write().await;
        if !groups.contains_key(old) {
            return Err(StoreError::NotFound);
        }
        if groups.contains_key(new) {
            return Err(StoreError::Duplicate);
        }
        self.store.rename_group(old, new).await?;
        if let Some(mut record) = groups.remove(old) {
            record.name = new.to_string();
            groups.insert(new.to_string(), record);
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        if !groups.contains_key(name) {
            return Err(StoreError::NotFound);
        }
        self.store.delete_group(name).await?;
        groups.remove(name);
        Ok(())
    }
}
