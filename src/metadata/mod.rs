//! Relational metadata catalog (component D).

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteMetadataStore;
pub use store::{
    ApiKeyPermissionRecord, ApiKeyRecord, AuditLogFilter, AuditLogPage, AuditLogRecord,
    AuditStats, BucketRecord, GeoStatEntry, ListObjectsResult, MetadataStore,
    MultipartUploadRecord, NewAuditLogEntry, ObjectRecord, PartRecord,
};
