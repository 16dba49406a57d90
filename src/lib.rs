//! Storage core for an S3-compatible object store.
//!
//! This crate implements the storage-layer components of an S3-compatible
//! service: a content-addressed file store, a relational metadata
//! catalog, a credential cache, secret-at-rest crypto, an audit log and
//! geo-stats aggregator, a garbage collector, an integrity checker, and a
//! remote migration engine. It does not include an HTTP front end,
//! request signing, or an admin UI -- those consume this crate.

use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod credcache;
pub mod crypto;
pub mod errors;
pub mod filestore;
pub mod gc;
pub mod geostats;
pub mod integrity;
pub mod metadata;
pub mod migration;
pub mod path;
pub mod serialization;
pub mod settings;

use crate::config::Config;
use crate::credcache::CredentialCache;
use crate::errors::CoreResult;
use crate::filestore::FileStore;
use crate::gc::GarbageCollector;
use crate::geostats::{GeoStatsMode, GeoStatsService};
use crate::integrity::IntegrityChecker;
use crate::metadata::store::MetadataStore;
use crate::metadata::sqlite::SqliteMetadataStore;
use crate::migration::MigrationManager;

/// Wires together every storage-core component from a loaded [`Config`].
///
/// Analogous to the HTTP front-end's `AppState`, but scoped to the
/// storage core only: no server socket, router, or SigV4 verifier live
/// here.
pub struct Core {
    pub config: Config,
    pub metadata: Arc<dyn MetadataStore>,
    pub files: Arc<FileStore>,
    pub credentials: Arc<CredentialCache>,
    pub geo_stats: Arc<GeoStatsService>,
    pub migrations: Arc<MigrationManager>,
    pub encryption_key: [u8; 32],
}

impl Core {
    /// Construct every component. Opens (or creates) the metadata
    /// database and the file store's base directory, loads or generates
    /// the secret-at-rest key, and fetches the process-wide geo-stats and
    /// migration singletons.
    pub fn new(config: Config) -> CoreResult<Self> {
        let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::with_read_pool_size(
            &config.metadata.path,
            config.metadata.read_pool_size,
        )?);
        let files = Arc::new(FileStore::new(&config.storage.root_dir)?);
        let encryption_key = crypto::load_or_create_key(metadata.as_ref())?;
        let credentials = Arc::new(CredentialCache::new(metadata.clone(), encryption_key)?);

        let geo_mode = if config.geo_stats.mode == "realtime" {
            GeoStatsMode::Realtime
        } else {
            GeoStatsMode::Batch
        };
        let geo_stats = GeoStatsService::instance(
            metadata.clone(),
            geo_mode,
            config.geo_stats.batch_size,
            Duration::from_secs(config.geo_stats.flush_interval_secs),
        );
        let migrations = MigrationManager::instance(metadata.clone(), files.clone());

        Ok(Self {
            config,
            metadata,
            files,
            credentials,
            geo_stats,
            migrations,
            encryption_key,
        })
    }

    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.metadata.clone(), self.files.clone())
    }

    pub fn integrity_checker(&self) -> IntegrityChecker {
        IntegrityChecker::new(self.metadata.clone())
    }
}
