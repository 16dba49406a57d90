//! Typed accessors over the `system_settings` table.
//!
//! Setting keys are enumerated under `system.*`, `server.*`, `storage.*`,
//! `security.*`, `auth.*`, `geo_stats.*` (§6). This module just adds
//! type coercion on top of [`MetadataStore::get_setting`] /
//! [`MetadataStore::set_setting`].

use crate::errors::{CoreError, CoreResult};
use crate::metadata::store::MetadataStore;

pub fn get_string(store: &dyn MetadataStore, key: &str, default: &str) -> CoreResult<String> {
    Ok(store.get_setting(key)?.unwrap_or_else(|| default.to_string()))
}

pub fn get_i64(store: &dyn MetadataStore, key: &str, default: i64) -> CoreResult<i64> {
    match store.get_setting(key)? {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::DBError(format!("setting {key} is not an integer: {raw}"))),
        None => Ok(default),
    }
}

pub fn get_bool(store: &dyn MetadataStore, key: &str, default: bool) -> CoreResult<bool> {
    match store.get_setting(key)? {
        Some(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(CoreError::DBError(format!("setting {key} is not a bool: {raw}"))),
        },
        None => Ok(default),
    }
}

pub fn set_string(store: &dyn MetadataStore, key: &str, value: &str) -> CoreResult<()> {
    store.set_setting(key, value)
}

pub fn set_i64(store: &dyn MetadataStore, key: &str, value: i64) -> CoreResult<()> {
    store.set_setting(key, &value.to_string())
}

pub fn set_bool(store: &dyn MetadataStore, key: &str, value: bool) -> CoreResult<()> {
    store.set_setting(key, if value { "true" } else { "false" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;

    #[test]
    fn round_trips_typed_values() {
        let store = SqliteMetadataStore::new(":memory:").unwrap();
        set_i64(&store, "storage.read_pool_size", 12).unwrap();
        set_bool(&store, "geo_stats.enabled", true).unwrap();
        assert_eq!(get_i64(&store, "storage.read_pool_size", 0).unwrap(), 12);
        assert!(get_bool(&store, "geo_stats.enabled", false).unwrap());
        assert_eq!(get_string(&store, "auth.missing", "fallback").unwrap(), "fallback");
    }
}
