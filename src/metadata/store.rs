//! Abstract metadata store trait and record types.
//!
//! Any metadata backend must implement [`MetadataStore`]. The trait is
//! synchronous: the only implementation ([`crate::metadata::sqlite::SqliteMetadataStore`])
//! is a locally embedded database, and forcing an async boundary around a
//! blocking call buys nothing here.

use crate::errors::CoreResult;

/// A bucket row.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    pub name: String,
    pub creation_date: String,
    pub is_public: bool,
}

/// An object row. `etag` is stored unquoted; callers add quotes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub last_modified: String,
    pub storage_path: String,
}

/// An in-progress multipart upload container.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartUploadRecord {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: String,
    pub content_type: String,
}

/// A single uploaded part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartRecord {
    pub upload_id: String,
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
    pub modified_at: String,
}

/// A credential row. `secret_access_key` is ciphertext on disk; the store
/// returns it as-is and leaves decryption to [`crate::crypto`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub description: String,
    pub created_at: String,
    pub enabled: bool,
}

/// A single `(accessKeyId, bucketName)` permission row. `bucket_name = "*"`
/// is the wildcard row.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyPermissionRecord {
    pub access_key_id: String,
    pub bucket_name: String,
    pub can_read: bool,
    pub can_write: bool,
}

/// One audit log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogRecord {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub ip: String,
    pub resource: String,
    pub detail: String,
    pub success: bool,
    pub user_agent: String,
}

/// A new audit log entry to be written. `timestamp` is filled by the store
/// when zero-length.
#[derive(Debug, Clone, Default)]
pub struct NewAuditLogEntry {
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub ip: String,
    pub resource: String,
    pub detail: String,
    pub success: bool,
    pub user_agent: String,
}

/// Filter for [`MetadataStore::query_audit_logs`].
#[derive(Debug, Clone, Default)]
pub struct AuditLogFilter {
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub success: Option<bool>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Page of audit log results plus the pre-paging total.
#[derive(Debug, Clone)]
pub struct AuditLogPage {
    pub entries: Vec<AuditLogRecord>,
    pub total: u64,
}

/// Aggregate audit statistics.
#[derive(Debug, Clone)]
pub struct AuditStats {
    pub total: u64,
    pub today: u64,
    pub failed: u64,
    pub top_actions: Vec<(String, u64)>,
}

/// One aggregated geo-stat row.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoStatEntry {
    pub date: String,
    pub country_code: String,
    pub country: String,
    pub city: String,
    pub region: String,
    pub request_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a `listObjects` call.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectRecord>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
}

/// Synchronous contract for the relational metadata catalog.
///
/// Implementors must satisfy (I6): at most one write is ever in flight. A
/// `Send + Sync` implementation lets callers share one store behind an
/// `Arc` across threads; internal locking provides the single-writer
/// guarantee.
pub trait MetadataStore: Send + Sync {
    // -- Buckets -----------------------------------------------------

    fn create_bucket(&self, record: BucketRecord) -> CoreResult<()>;
    fn get_bucket(&self, name: &str) -> CoreResult<Option<BucketRecord>>;
    fn list_buckets(&self) -> CoreResult<Vec<BucketRecord>>;
    /// Deletes the bucket iff it has zero objects; otherwise returns
    /// `CoreError::Conflict`. Runs in a transaction (§4.D).
    fn delete_bucket(&self, name: &str) -> CoreResult<()>;
    fn set_bucket_public(&self, name: &str, is_public: bool) -> CoreResult<()>;

    // -- Objects -------------------------------------------------------

    fn put_object(&self, record: ObjectRecord) -> CoreResult<()>;
    fn get_object(&self, bucket: &str, key: &str) -> CoreResult<Option<ObjectRecord>>;
    fn delete_object(&self, bucket: &str, key: &str) -> CoreResult<()>;
    fn count_objects(&self, bucket: &str) -> CoreResult<u64>;
    fn update_object_etag(&self, bucket: &str, key: &str, etag: &str) -> CoreResult<()>;

    /// Ordered by key ascending; fetches `max_keys + 1` internally to
    /// detect truncation. When `delimiter` and `prefix` are set, keys whose
    /// suffix-after-prefix contains the delimiter collapse into a single
    /// common-prefix entry and do not consume `max_keys`.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: u32,
    ) -> CoreResult<ListObjectsResult>;

    /// `LIKE` match on key with `%`, `_`, `\` escaped via `ESCAPE '\'`.
    /// `max_results` is clamped to `[1, 1000]`.
    fn search_objects(
        &self,
        bucket: &str,
        keyword: &str,
        max_results: u32,
    ) -> CoreResult<Vec<ObjectRecord>>;

    // -- Multipart uploads ----------------------------------------------

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> CoreResult<()>;
    fn get_multipart_upload(&self, upload_id: &str) -> CoreResult<Option<MultipartUploadRecord>>;
    fn list_multipart_uploads(&self, bucket: &str) -> CoreResult<Vec<MultipartUploadRecord>>;
    /// Upsert on re-put by the same part number.
    fn put_part(&self, record: PartRecord) -> CoreResult<()>;
    fn list_parts(&self, upload_id: &str) -> CoreResult<Vec<PartRecord>>;
    /// Deletes the upload row and all of its parts.
    fn delete_multipart_upload(&self, upload_id: &str) -> CoreResult<()>;
    /// Uploads initiated before `now - max_age_secs`, with aggregated
    /// `(part_count, total_size)`.
    fn expired_multipart_uploads(
        &self,
        max_age_secs: i64,
    ) -> CoreResult<Vec<(MultipartUploadRecord, u64, u64)>>;

    // -- Credentials -----------------------------------------------------

    fn create_api_key(&self, record: ApiKeyRecord) -> CoreResult<()>;
    fn get_api_key(&self, access_key_id: &str) -> CoreResult<Option<ApiKeyRecord>>;
    fn list_api_keys(&self) -> CoreResult<Vec<ApiKeyRecord>>;
    fn delete_api_key(&self, access_key_id: &str) -> CoreResult<()>;
    fn set_api_key_secret(&self, access_key_id: &str, secret_ciphertext: &str) -> CoreResult<()>;
    fn set_api_key_enabled(&self, access_key_id: &str, enabled: bool) -> CoreResult<()>;

    fn set_permission(
        &self,
        access_key_id: &str,
        bucket_name: &str,
        can_read: bool,
        can_write: bool,
    ) -> CoreResult<()>;
    fn delete_permission(&self, access_key_id: &str, bucket_name: &str) -> CoreResult<()>;
    fn list_permissions(&self, access_key_id: &str) -> CoreResult<Vec<ApiKeyPermissionRecord>>;

    // -- Settings ---------------------------------------------------------

    fn get_setting(&self, key: &str) -> CoreResult<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> CoreResult<()>;

    // -- Audit log -------------------------------------------------------

    fn write_audit_log(&self, entry: NewAuditLogEntry) -> CoreResult<()>;
    fn query_audit_logs(&self, filter: AuditLogFilter) -> CoreResult<AuditLogPage>;
    fn recent_audit_logs(&self, n: u32) -> CoreResult<Vec<AuditLogRecord>>;
    fn clean_old_audit_logs(&self, days: u32) -> CoreResult<u64>;
    fn audit_stats(&self) -> CoreResult<AuditStats>;

    // -- Geo stats ---------------------------------------------------------

    /// `INSERT ... ON CONFLICT(date, country_code, city) DO UPDATE SET
    /// request_count = request_count + delta`.
    fn upsert_geo_stat(
        &self,
        date: &str,
        country_code: &str,
        city: &str,
        country: &str,
        region: &str,
        delta: u64,
    ) -> CoreResult<()>;
    fn geo_stats_by_country(&self, limit: u32) -> CoreResult<Vec<(String, u64)>>;
    fn geo_stats_by_country_city(&self, limit: u32) -> CoreResult<Vec<(String, String, u64)>>;

    // -- Reconciliation helpers -------------------------------------------

    /// Every `Object.storage_path` in the catalog, for GC reconciliation.
    fn all_object_storage_paths(&self) -> CoreResult<Vec<String>>;
    /// Every live multipart `upload_id`, for GC reconciliation.
    fn all_multipart_upload_ids(&self) -> CoreResult<Vec<String>>;
}
