use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use mbc_store::DataStore;
use mbc_types::{encode_partition_key, is_common_tenant, CommandRecord, DataRecord, COMMON_TENANT};

use crate::error::{CommandError, CommandResult};
use crate::projector::CommitListener;

/// Logical type of setting records: `pk = SETTING#{tenant}`.
pub const SETTING_PREFIX: &str = "SETTING";

struct CachedSetting {
    value: Option<DataRecord>,
    fetched_at: Instant,
}

/// Read-through cache of tenant setting records.
///
/// A tenant without its own row for a key inherits the `common` tenant's
/// row. Entries expire after `ttl` and are dropped as soon as a write to
/// the same setting key is projected.
pub struct TenantSettingsCache {
    data: Arc<dyn DataStore>,
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), CachedSetting>>,
}

impl TenantSettingsCache {
    pub fn new(data: Arc<dyn DataStore>, ttl: Duration) -> Self {
        Self {
            data,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Effective setting `key` for `tenant_code`.
    pub fn get(&self, tenant_code: &str, key: &str) -> CommandResult<Option<DataRecord>> {
        let cache_key = (tenant_code.to_string(), key.to_string());
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| CommandError::LockPoisoned("settings cache"))?;
            if let Some(entry) = entries.get(&cache_key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let mut value = self.load(tenant_code, key)?;
        if value.is_none() && !is_common_tenant(tenant_code) {
            value = self.load(COMMON_TENANT, key)?;
        }
        debug!(tenant = tenant_code, key, found = value.is_some(), "setting loaded");

        self.entries
            .write()
            .map_err(|_| CommandError::LockPoisoned("settings cache"))?
            .insert(
                cache_key,
                CachedSetting {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                },
            );
        Ok(value)
    }

    /// Drop cached entries for `key`. A change to the common tenant's row
    /// affects every tenant that inherits it.
    pub fn invalidate(&self, tenant_code: &str, key: &str) -> CommandResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CommandError::LockPoisoned("settings cache"))?;
        if is_common_tenant(tenant_code) {
            entries.retain(|(_, k), _| k != key);
        } else {
            entries.remove(&(tenant_code.to_string(), key.to_string()));
        }
        Ok(())
    }

    pub fn clear(&self) -> CommandResult<()> {
        self.entries
            .write()
            .map_err(|_| CommandError::LockPoisoned("settings cache"))?
            .clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self, tenant_code: &str, key: &str) -> CommandResult<Option<DataRecord>> {
        let pk = encode_partition_key(SETTING_PREFIX, tenant_code);
        Ok(self.data.get(&pk, key)?.filter(|r| !r.is_deleted))
    }
}

impl CommitListener for TenantSettingsCache {
    fn on_projected(&self, record: &CommandRecord) {
        let is_setting = record
            .pk
            .split_once(mbc_types::KEY_SEPARATOR)
            .is_some_and(|(prefix, _)| prefix == SETTING_PREFIX);
        if is_setting {
            // Poisoning only loses cache entries; the next read reloads.
            let _ = self.invalidate(&record.tenant_code, record.base_sk());
        }
    }
}
