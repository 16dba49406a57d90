//! End-to-end scenarios wiring multiple components together through `Core`.

use objectstore_core::config::{
    Config, CryptoConfig, GcConfig, GeoStatsConfig, LoggingConfig, MetadataConfig, MigrationConfig,
    StorageConfig,
};
use objectstore_core::metadata::store::{BucketRecord, MetadataStore};
use objectstore_core::Core;

fn test_config(base: &std::path::Path) -> Config {
    Config {
        storage: StorageConfig { root_dir: base.join("objects").to_string_lossy().to_string() },
        metadata: MetadataConfig {
            path: base.join("metadata.db").to_string_lossy().to_string(),
            read_pool_size: 4,
        },
        crypto: CryptoConfig::default(),
        gc: GcConfig { max_upload_age_secs: 3600, dry_run_default: false },
        migration: MigrationConfig::default(),
        geo_stats: GeoStatsConfig { mode: "batch".to_string(), batch_size: 100, flush_interval_secs: 30 },
        logging: LoggingConfig { level: "info".to_string(), format: "text".to_string() },
    }
}

/// S1: create a bucket, put an object, and check the exact ETag/size/path.
#[test]
fn s1_put_object_lands_at_expected_shard() {
    let dir = tempfile::tempdir().unwrap();
    let core = Core::new(test_config(dir.path())).unwrap();

    core.metadata
        .create_bucket(BucketRecord {
            name: "b1".to_string(),
            creation_date: "2026-01-01T00:00:00+00:00".to_string(),
            is_public: false,
        })
        .unwrap();

    let written = core.files.put_object("b1", "hello.txt", b"Hello, World!".as_slice()).unwrap();

    assert_eq!(written.etag, "65a8e27d8879283831b664bd8b7f0ad4");
    assert_eq!(written.size, 13);
    assert!(written.path.to_string_lossy().ends_with("b1/2b/hello.txt"));

    core.metadata
        .put_object(objectstore_core::metadata::store::ObjectRecord {
            bucket: "b1".to_string(),
            key: "hello.txt".to_string(),
            size: written.size,
            etag: written.etag.clone(),
            content_type: "text/plain".to_string(),
            last_modified: "2026-01-01T00:00:00+00:00".to_string(),
            storage_path: written.path.to_string_lossy().to_string(),
        })
        .unwrap();

    let fetched = core.metadata.get_object("b1", "hello.txt").unwrap().unwrap();
    assert_eq!(fetched.etag, "65a8e27d8879283831b664bd8b7f0ad4");
}

/// S2: two keys with maxKeys=10 are listed in key order with the expected ETags.
#[test]
fn s2_list_objects_orders_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let core = Core::new(test_config(dir.path())).unwrap();

    core.metadata
        .create_bucket(BucketRecord {
            name: "b1".to_string(),
            creation_date: "2026-01-01T00:00:00+00:00".to_string(),
            is_public: false,
        })
        .unwrap();

    for (key, body) in [("k1", b"".as_slice()), ("k2", b"abc".as_slice())] {
        let written = core.files.put_object("b1", key, body).unwrap();
        core.metadata
            .put_object(objectstore_core::metadata::store::ObjectRecord {
                bucket: "b1".to_string(),
                key: key.to_string(),
                size: written.size,
                etag: written.etag,
                content_type: "application/octet-stream".to_string(),
                last_modified: "2026-01-01T00:00:00+00:00".to_string(),
                storage_path: written.path.to_string_lossy().to_string(),
            })
            .unwrap();
    }

    let result = core.metadata.list_objects("b1", "", "", "", 10).unwrap();
    assert!(!result.is_truncated);
    assert_eq!(result.objects.len(), 2);
    assert_eq!(result.objects[0].key, "k1");
    assert_eq!(result.objects[0].etag, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(result.objects[1].key, "k2");
    assert_eq!(result.objects[1].etag, "900150983cd24fb0d6963f7d28e17f72");
}

/// S4: a wildcard deny wins over a more specific per-bucket grant.
#[test]
fn s4_wildcard_permission_wins_through_core() {
    use objectstore_core::metadata::store::ApiKeyRecord;

    let dir = tempfile::tempdir().unwrap();
    let core = Core::new(test_config(dir.path())).unwrap();

    core.metadata
        .create_api_key(ApiKeyRecord {
            access_key_id: "AKIDTEST".to_string(),
            secret_access_key: "irrelevant-for-this-check".to_string(),
            description: "desc".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            enabled: true,
        })
        .unwrap();
    core.metadata.set_permission("AKIDTEST", "*", true, false).unwrap();
    core.metadata.set_permission("AKIDTEST", "b1", true, true).unwrap();

    core.credentials.reload().unwrap();
    assert!(!core.credentials.check_permission("AKIDTEST", "b1", true));
}

/// S6: an expired multipart upload is fully reclaimed by GC.
#[test]
fn s6_gc_reclaims_expired_multipart_upload() {
    use objectstore_core::metadata::store::{MultipartUploadRecord, PartRecord};

    let dir = tempfile::tempdir().unwrap();
    let core = Core::new(test_config(dir.path())).unwrap();

    core.metadata
        .create_bucket(BucketRecord {
            name: "b1".to_string(),
            creation_date: "2026-01-01T00:00:00+00:00".to_string(),
            is_public: false,
        })
        .unwrap();

    let upload_id = "0123456789abcdef0123456789abcdef";
    let two_hours_ago = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    core.metadata
        .create_multipart_upload(MultipartUploadRecord {
            upload_id: upload_id.to_string(),
            bucket: "b1".to_string(),
            key: "big.bin".to_string(),
            initiated: two_hours_ago,
            content_type: "application/octet-stream".to_string(),
        })
        .unwrap();

    for (n, size) in [(1u32, 1500u64), (2u32, 1500u64)] {
        let payload = vec![b'x'; size as usize];
        let (etag, written_size) = core.files.put_part(upload_id, n, payload.as_slice()).unwrap();
        core.metadata
            .put_part(PartRecord {
                upload_id: upload_id.to_string(),
                part_number: n,
                size: written_size,
                etag,
                modified_at: two_hours_ago_fixture(),
            })
            .unwrap();
    }

    let report = core.garbage_collector().run(3600, false).unwrap();
    assert_eq!(report.expired_count(), 1);
    assert!(core.metadata.get_multipart_upload(upload_id).unwrap().is_none());
    assert!(!core.files.base().join(".multipart").join(upload_id).exists());
}

fn two_hours_ago_fixture() -> String {
    (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339()
}
