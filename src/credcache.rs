//! In-memory API-key cache (component E).
//!
//! Never a source of truth: every credential mutation in the catalog must
//! be followed by [`CredentialCache::reload`] before a response is
//! returned. The cache itself is an immutable snapshot behind a
//! reader-writer lock, swapped atomically on reload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use subtle::ConstantTimeEq;

use crate::crypto::decrypt_secret;
use crate::errors::CoreResult;
use crate::metadata::store::MetadataStore;

/// Wildcard bucket name: a permission row with this name decides
/// authorization for a key regardless of any more specific row.
pub const WILDCARD_BUCKET: &str = "*";

#[derive(Debug, Clone)]
struct CachedPermission {
    can_read: bool,
    can_write: bool,
}

#[derive(Debug, Clone)]
struct CachedKey {
    secret: String,
    enabled: bool,
    permissions: HashMap<String, CachedPermission>,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Snapshot-based cache of API keys and their permissions, decrypted
/// against the secret-at-rest key on load.
pub struct CredentialCache {
    store: Arc<dyn MetadataStore>,
    encryption_key: [u8; 32],
    keys: RwLock<HashMap<String, CachedKey>>,
}

impl CredentialCache {
    /// Build the cache, fully loading from the catalog.
    pub fn new(store: Arc<dyn MetadataStore>, encryption_key: [u8; 32]) -> CoreResult<Self> {
        let cache = Self {
            store,
            encryption_key,
            keys: RwLock::new(HashMap::new()),
        };
        cache.reload()?;
        Ok(cache)
    }

    /// Rebuild the map from the catalog and swap it in atomically.
    pub fn reload(&self) -> CoreResult<()> {
        let records = self.store.list_api_keys()?;
        let mut built = HashMap::with_capacity(records.len());

        for record in records {
            let secret = decrypt_secret(&self.encryption_key, &record.secret_access_key);
            let mut permissions = HashMap::new();
            for perm in self.store.list_permissions(&record.access_key_id)? {
                permissions.insert(
                    perm.bucket_name,
                    CachedPermission {
                        can_read: perm.can_read,
                        can_write: perm.can_write,
                    },
                );
            }
            built.insert(
                record.access_key_id,
                CachedKey {
                    secret,
                    enabled: record.enabled,
                    permissions,
                },
            );
        }

        *self.keys.write().expect("credential cache lock poisoned") = built;
        Ok(())
    }

    /// Missing or disabled key returns false. Otherwise compares the
    /// presented secret to the cached secret in constant time.
    pub fn validate(&self, access_key_id: &str, presented_secret: &str) -> bool {
        let keys = self.keys.read().expect("credential cache lock poisoned");
        match keys.get(access_key_id) {
            Some(cached) if cached.enabled => constant_time_eq(&cached.secret, presented_secret),
            _ => false,
        }
    }

    /// For signature verification. Same missing/disabled rules as
    /// [`Self::validate`].
    pub fn get_secret_key(&self, access_key_id: &str) -> (String, bool) {
        let keys = self.keys.read().expect("credential cache lock poisoned");
        match keys.get(access_key_id) {
            Some(cached) if cached.enabled => (cached.secret.clone(), true),
            _ => (String::new(), false),
        }
    }

    /// Wildcard permission row takes precedence over a specific-bucket row
    /// when both exist.
    pub fn check_permission(&self, access_key_id: &str, bucket: &str, need_write: bool) -> bool {
        let keys = self.keys.read().expect("credential cache lock poisoned");
        let Some(cached) = keys.get(access_key_id) else {
            return false;
        };
        if !cached.enabled {
            return false;
        }
        if let Some(wildcard) = cached.permissions.get(WILDCARD_BUCKET) {
            return if need_write { wildcard.can_write } else { wildcard.can_read };
        }
        match cached.permissions.get(bucket) {
            Some(perm) => {
                if need_write {
                    perm.can_write
                } else {
                    perm.can_read
                }
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_secret;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::ApiKeyRecord;

    fn test_key() -> [u8; 32] {
        [3u8; 32]
    }

    fn setup() -> (Arc<dyn MetadataStore>, CredentialCache) {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        let key = test_key();
        store
            .create_api_key(ApiKeyRecord {
                access_key_id: "AK1".into(),
                secret_access_key: encrypt_secret(&key, "s3cr3t").unwrap(),
                description: "".into(),
                created_at: "now".into(),
                enabled: true,
            })
            .unwrap();
        store.set_permission("AK1", "*", true, false).unwrap();
        store.set_permission("AK1", "b1", true, true).unwrap();
        let cache = CredentialCache::new(store.clone(), key).unwrap();
        (store, cache)
    }

    #[test]
    fn validate_rejects_wrong_secret() {
        let (_store, cache) = setup();
        assert!(cache.validate("AK1", "s3cr3t"));
        assert!(!cache.validate("AK1", "wrong"));
        assert!(!cache.validate("missing", "s3cr3t"));
    }

    #[test]
    fn wildcard_permission_wins_per_s4() {
        let (_store, cache) = setup();
        assert!(!cache.check_permission("AK1", "b1", true));
        assert!(cache.check_permission("AK1", "b1", false));
    }

    #[test]
    fn disabled_key_denies_everything() {
        let (store, cache) = setup();
        store.set_api_key_enabled("AK1", false).unwrap();
        cache.reload().unwrap();
        assert!(!cache.validate("AK1", "s3cr3t"));
        assert!(!cache.check_permission("AK1", "b1", false));
    }
}
