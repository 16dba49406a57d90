//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required. A single write connection, guarded by a mutex, serializes
//! every mutation (I6); a small pool of separate connections serves reads
//! without ever blocking on the writer, compatible with the engine's WAL
//! mode. Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`) and
//! forward-compatible columns are added with a guarded `ALTER TABLE`.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::errors::{CoreError, CoreResult};

use super::store::{
    ApiKeyPermissionRecord, ApiKeyRecord, AuditLogFilter, AuditLogPage, AuditLogRecord,
    AuditStats, BucketRecord, ListObjectsResult, MetadataStore, MultipartUploadRecord,
    NewAuditLogEntry, ObjectRecord, PartRecord,
};

/// Number of pooled read connections (§4.D: "a pool of read connections
/// (≈ 10)").
const DEFAULT_READ_POOL_SIZE: usize = 10;

const SCHEMA_VERSION: i64 = 1;

/// Metadata store backed by a single SQLite database file (or a shared
/// in-memory database when `path == ":memory:"`).
pub struct SqliteMetadataStore {
    write: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

fn is_memory(path: &str) -> bool {
    path == ":memory:"
}

fn open_connection(path: &str, read_only: bool) -> rusqlite::Result<Connection> {
    if is_memory(path) {
        let flags = OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(
            "file:objectstore-core-shared-mem?mode=memory&cache=shared",
            flags,
        )
    } else if read_only {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(path, flags)
    } else {
        Connection::open(path)
    }
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    /// Pass `":memory:"` for an in-memory database shared across this
    /// store's connection pool (useful for tests).
    pub fn new(path: &str) -> CoreResult<Self> {
        Self::with_read_pool_size(path, DEFAULT_READ_POOL_SIZE)
    }

    pub fn with_read_pool_size(path: &str, read_pool_size: usize) -> CoreResult<Self> {
        let write_conn = open_connection(path, false)?;
        apply_pragmas(&write_conn)?;
        init_schema(&write_conn)?;

        let mut readers = Vec::with_capacity(read_pool_size.max(1));
        for _ in 0..read_pool_size.max(1) {
            let conn = open_connection(path, true)?;
            apply_pragmas(&conn)?;
            readers.push(Mutex::new(conn));
        }

        Ok(Self {
            write: Mutex::new(write_conn),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    fn with_write<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> CoreResult<T> {
        let conn = self.write.lock().expect("write mutex poisoned");
        Ok(f(&conn)?)
    }

    fn with_read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> CoreResult<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock().expect("read mutex poisoned");
        Ok(f(&conn)?)
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA cache_size = 2000;
        ",
    )
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS buckets (
            name          TEXT PRIMARY KEY,
            creation_date TEXT NOT NULL,
            is_public     INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS objects (
            bucket        TEXT NOT NULL,
            key           TEXT NOT NULL,
            size          INTEGER NOT NULL,
            etag          TEXT NOT NULL,
            content_type  TEXT NOT NULL DEFAULT 'application/octet-stream',
            last_modified TEXT NOT NULL,
            storage_path  TEXT NOT NULL,
            PRIMARY KEY (bucket, key),
            FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_objects_bucket ON objects(bucket);
        CREATE INDEX IF NOT EXISTS idx_objects_bucket_key ON objects(bucket, key);

        CREATE TABLE IF NOT EXISTS multipart_uploads (
            upload_id    TEXT PRIMARY KEY,
            bucket       TEXT NOT NULL,
            key          TEXT NOT NULL,
            initiated    TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_uploads_bucket ON multipart_uploads(bucket);

        CREATE TABLE IF NOT EXISTS parts (
            upload_id     TEXT NOT NULL,
            part_number   INTEGER NOT NULL,
            size          INTEGER NOT NULL,
            etag          TEXT NOT NULL,
            modified_at   TEXT NOT NULL,
            PRIMARY KEY (upload_id, part_number),
            FOREIGN KEY (upload_id) REFERENCES multipart_uploads(upload_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            access_key_id     TEXT PRIMARY KEY,
            secret_access_key TEXT NOT NULL,
            description       TEXT NOT NULL DEFAULT '',
            created_at        TEXT NOT NULL,
            enabled           INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS api_key_permissions (
            access_key_id TEXT NOT NULL,
            bucket_name   TEXT NOT NULL,
            can_read      INTEGER NOT NULL DEFAULT 0,
            can_write     INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (access_key_id, bucket_name),
            FOREIGN KEY (access_key_id) REFERENCES api_keys(access_key_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_permissions_key ON api_key_permissions(access_key_id);

        CREATE TABLE IF NOT EXISTS system_settings (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp  TEXT NOT NULL,
            action     TEXT NOT NULL,
            actor      TEXT NOT NULL DEFAULT '',
            ip         TEXT NOT NULL DEFAULT '',
            resource   TEXT NOT NULL DEFAULT '',
            detail     TEXT NOT NULL DEFAULT '',
            success    INTEGER NOT NULL DEFAULT 1,
            user_agent TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action);
        CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_logs(actor);
        CREATE INDEX IF NOT EXISTS idx_audit_ip ON audit_logs(ip);

        CREATE TABLE IF NOT EXISTS geo_stats (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            date           TEXT NOT NULL,
            country_code   TEXT NOT NULL,
            country        TEXT NOT NULL DEFAULT '',
            city           TEXT NOT NULL DEFAULT '',
            region         TEXT NOT NULL DEFAULT '',
            request_count  INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            UNIQUE(date, country_code, city)
        );
        CREATE INDEX IF NOT EXISTS idx_geo_date ON geo_stats(date);
        CREATE INDEX IF NOT EXISTS idx_geo_country ON geo_stats(country_code);
        ",
    )?;

    let existing: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();

    if existing.unwrap_or(0) < SCHEMA_VERSION {
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now()],
        )?;
    }

    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn row_to_object(row: &rusqlite::Row) -> rusqlite::Result<ObjectRecord> {
    let size: i64 = row.get("size")?;
    Ok(ObjectRecord {
        bucket: row.get("bucket")?,
        key: row.get("key")?,
        size: size as u64,
        etag: row.get("etag")?,
        content_type: row.get("content_type")?,
        last_modified: row.get("last_modified")?,
        storage_path: row.get("storage_path")?,
    })
}

fn row_to_upload(row: &rusqlite::Row) -> rusqlite::Result<MultipartUploadRecord> {
    Ok(MultipartUploadRecord {
        upload_id: row.get("upload_id")?,
        bucket: row.get("bucket")?,
        key: row.get("key")?,
        initiated: row.get("initiated")?,
        content_type: row.get("content_type")?,
    })
}

fn row_to_part(row: &rusqlite::Row) -> rusqlite::Result<PartRecord> {
    let part_number: i64 = row.get("part_number")?;
    let size: i64 = row.get("size")?;
    Ok(PartRecord {
        upload_id: row.get("upload_id")?,
        part_number: part_number as u32,
        size: size as u64,
        etag: row.get("etag")?,
        modified_at: row.get("modified_at")?,
    })
}

fn row_to_api_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKeyRecord> {
    let enabled: i64 = row.get("enabled")?;
    Ok(ApiKeyRecord {
        access_key_id: row.get("access_key_id")?,
        secret_access_key: row.get("secret_access_key")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        enabled: enabled != 0,
    })
}

/// Escape `%`, `_`, and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl MetadataStore for SqliteMetadataStore {
    // -- Buckets -----------------------------------------------------------

    fn create_bucket(&self, record: BucketRecord) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO buckets (name, creation_date, is_public) VALUES (?1, ?2, ?3)",
                params![record.name, record.creation_date, record.is_public as i64],
            )?;
            Ok(())
        })
    }

    fn get_bucket(&self, name: &str) -> CoreResult<Option<BucketRecord>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT name, creation_date, is_public FROM buckets WHERE name = ?1",
                params![name],
                |row| {
                    let is_public: i64 = row.get(2)?;
                    Ok(BucketRecord {
                        name: row.get(0)?,
                        creation_date: row.get(1)?,
                        is_public: is_public != 0,
                    })
                },
            )
            .optional()
        })
    }

    fn list_buckets(&self) -> CoreResult<Vec<BucketRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn
                .prepare("SELECT name, creation_date, is_public FROM buckets ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                let is_public: i64 = row.get(2)?;
                Ok(BucketRecord {
                    name: row.get(0)?,
                    creation_date: row.get(1)?,
                    is_public: is_public != 0,
                })
            })?;
            rows.collect()
        })
    }

    fn delete_bucket(&self, name: &str) -> CoreResult<()> {
        let name = name.to_string();
        self.with_write(move |conn| -> rusqlite::Result<()> {
            let tx = conn.unchecked_transaction()?;
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket = ?1",
                params![name],
                |row| row.get(0),
            )?;
            if count > 0 {
                // Surfaced as Conflict by the caller wrapper below.
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            tx.execute("DELETE FROM buckets WHERE name = ?1", params![name])?;
            tx.commit()
        })
        .map_err(|e| match e {
            CoreError::DBError(_) => CoreError::Conflict(format!("bucket {name} is not empty")),
            other => other,
        })
    }

    fn set_bucket_public(&self, name: &str, is_public: bool) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "UPDATE buckets SET is_public = ?1 WHERE name = ?2",
                params![is_public as i64, name],
            )?;
            Ok(())
        })
    }

    // -- Objects -------------------------------------------------------

    fn put_object(&self, record: ObjectRecord) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO objects (bucket, key, size, etag, content_type, last_modified, storage_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(bucket, key) DO UPDATE SET
                   size = excluded.size,
                   etag = excluded.etag,
                   content_type = excluded.content_type,
                   last_modified = excluded.last_modified,
                   storage_path = excluded.storage_path",
                params![
                    record.bucket,
                    record.key,
                    record.size as i64,
                    record.etag,
                    record.content_type,
                    record.last_modified,
                    record.storage_path,
                ],
            )?;
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> CoreResult<Option<ObjectRecord>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT bucket, key, size, etag, content_type, last_modified, storage_path
                 FROM objects WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                row_to_object,
            )
            .optional()
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )?;
            Ok(())
        })
    }

    fn count_objects(&self, bucket: &str) -> CoreResult<u64> {
        self.with_read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket = ?1",
                params![bucket],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn update_object_etag(&self, bucket: &str, key: &str, etag: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "UPDATE objects SET etag = ?1 WHERE bucket = ?2 AND key = ?3",
                params![etag, bucket, key],
            )?;
            Ok(())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: u32,
    ) -> CoreResult<ListObjectsResult> {
        self.with_read(|conn| {
            let like_pattern = format!("{}%", escape_like(prefix));
            let fetch_limit = max_keys as i64 + 1;
            let mut stmt = conn.prepare(
                "SELECT bucket, key, size, etag, content_type, last_modified, storage_path
                 FROM objects
                 WHERE bucket = ?1 AND key > ?2 AND key LIKE ?3 ESCAPE '\\'
                 ORDER BY key
                 LIMIT ?4",
            )?;
            let rows: Vec<ObjectRecord> = stmt
                .query_map(params![bucket, marker, like_pattern, fetch_limit], row_to_object)?
                .collect::<rusqlite::Result<_>>()?;

            if delimiter.is_empty() {
                let is_truncated = rows.len() > max_keys as usize;
                let objects: Vec<_> = rows.into_iter().take(max_keys as usize).collect();
                Ok(ListObjectsResult {
                    objects,
                    common_prefixes: Vec::new(),
                    is_truncated,
                })
            } else {
                let mut objects = Vec::new();
                let mut common_prefixes = std::collections::BTreeSet::new();
                let mut count = 0u32;
                let mut truncated = false;

                for obj in rows {
                    if count >= max_keys {
                        truncated = true;
                        break;
                    }
                    let after_prefix = &obj.key[prefix.len().min(obj.key.len())..];
                    if let Some(pos) = after_prefix.find(delimiter) {
                        let cp = format!(
                            "{}{}",
                            prefix,
                            &after_prefix[..pos + delimiter.len()]
                        );
                        if common_prefixes.insert(cp) {
                            count += 1;
                        }
                    } else {
                        objects.push(obj);
                        count += 1;
                    }
                }

                Ok(ListObjectsResult {
                    objects,
                    common_prefixes: common_prefixes.into_iter().collect(),
                    is_truncated: truncated,
                })
            }
        })
    }

    fn search_objects(
        &self,
        bucket: &str,
        keyword: &str,
        max_results: u32,
    ) -> CoreResult<Vec<ObjectRecord>> {
        let clamped = max_results.clamp(1, 1000);
        self.with_read(|conn| {
            let pattern = format!("%{}%", escape_like(keyword));
            let mut stmt = conn.prepare(
                "SELECT bucket, key, size, etag, content_type, last_modified, storage_path
                 FROM objects
                 WHERE bucket = ?1 AND key LIKE ?2 ESCAPE '\\'
                 ORDER BY key
                 LIMIT ?3",
            )?;
            stmt.query_map(params![bucket, pattern, clamped], row_to_object)?
                .collect()
        })
    }

    // -- Multipart uploads ----------------------------------------------

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO multipart_uploads (upload_id, bucket, key, initiated, content_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.upload_id,
                    record.bucket,
                    record.key,
                    record.initiated,
                    record.content_type,
                ],
            )?;
            Ok(())
        })
    }

    fn get_multipart_upload(&self, upload_id: &str) -> CoreResult<Option<MultipartUploadRecord>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT upload_id, bucket, key, initiated, content_type
                 FROM multipart_uploads WHERE upload_id = ?1",
                params![upload_id],
                row_to_upload,
            )
            .optional()
        })
    }

    fn list_multipart_uploads(&self, bucket: &str) -> CoreResult<Vec<MultipartUploadRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_id, bucket, key, initiated, content_type
                 FROM multipart_uploads WHERE bucket = ?1 ORDER BY initiated",
            )?;
            stmt.query_map(params![bucket], row_to_upload)?.collect()
        })
    }

    fn put_part(&self, record: PartRecord) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO parts (upload_id, part_number, size, etag, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(upload_id, part_number) DO UPDATE SET
                   size = excluded.size, etag = excluded.etag, modified_at = excluded.modified_at",
                params![
                    record.upload_id,
                    record.part_number,
                    record.size as i64,
                    record.etag,
                    record.modified_at,
                ],
            )?;
            Ok(())
        })
    }

    fn list_parts(&self, upload_id: &str) -> CoreResult<Vec<PartRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_id, part_number, size, etag, modified_at
                 FROM parts WHERE upload_id = ?1 ORDER BY part_number",
            )?;
            stmt.query_map(params![upload_id], row_to_part)?.collect()
        })
    }

    fn delete_multipart_upload(&self, upload_id: &str) -> CoreResult<()> {
        self.with_write(|conn| -> rusqlite::Result<()> {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM parts WHERE upload_id = ?1", params![upload_id])?;
            tx.execute(
                "DELETE FROM multipart_uploads WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.commit()
        })
    }

    fn expired_multipart_uploads(
        &self,
        max_age_secs: i64,
    ) -> CoreResult<Vec<(MultipartUploadRecord, u64, u64)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_id, bucket, key, initiated, content_type
                 FROM multipart_uploads
                 WHERE initiated < datetime('now', '-' || ?1 || ' seconds')",
            )?;
            let uploads: Vec<MultipartUploadRecord> = stmt
                .query_map(params![max_age_secs], row_to_upload)?
                .collect::<rusqlite::Result<_>>()?;

            let mut result = Vec::with_capacity(uploads.len());
            for upload in uploads {
                let (part_count, total_size): (i64, Option<i64>) = conn.query_row(
                    "SELECT COUNT(*), SUM(size) FROM parts WHERE upload_id = ?1",
                    params![upload.upload_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                result.push((upload, part_count as u64, total_size.unwrap_or(0) as u64));
            }
            Ok(result)
        })
    }

    // -- Credentials -----------------------------------------------------

    fn create_api_key(&self, record: ApiKeyRecord) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO api_keys (access_key_id, secret_access_key, description, created_at, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.access_key_id,
                    record.secret_access_key,
                    record.description,
                    record.created_at,
                    record.enabled as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn get_api_key(&self, access_key_id: &str) -> CoreResult<Option<ApiKeyRecord>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT access_key_id, secret_access_key, description, created_at, enabled
                 FROM api_keys WHERE access_key_id = ?1",
                params![access_key_id],
                row_to_api_key,
            )
            .optional()
        })
    }

    fn list_api_keys(&self) -> CoreResult<Vec<ApiKeyRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT access_key_id, secret_access_key, description, created_at, enabled
                 FROM api_keys ORDER BY access_key_id",
            )?;
            stmt.query_map([], row_to_api_key)?.collect()
        })
    }

    fn delete_api_key(&self, access_key_id: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "DELETE FROM api_keys WHERE access_key_id = ?1",
                params![access_key_id],
            )?;
            Ok(())
        })
    }

    fn set_api_key_secret(&self, access_key_id: &str, secret_ciphertext: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "UPDATE api_keys SET secret_access_key = ?1 WHERE access_key_id = ?2",
                params![secret_ciphertext, access_key_id],
            )?;
            Ok(())
        })
    }

    fn set_api_key_enabled(&self, access_key_id: &str, enabled: bool) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "UPDATE api_keys SET enabled = ?1 WHERE access_key_id = ?2",
                params![enabled as i64, access_key_id],
            )?;
            Ok(())
        })
    }

    fn set_permission(
        &self,
        access_key_id: &str,
        bucket_name: &str,
        can_read: bool,
        can_write: bool,
    ) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO api_key_permissions (access_key_id, bucket_name, can_read, can_write)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(access_key_id, bucket_name) DO UPDATE SET
                   can_read = excluded.can_read, can_write = excluded.can_write",
                params![access_key_id, bucket_name, can_read as i64, can_write as i64],
            )?;
            Ok(())
        })
    }

    fn delete_permission(&self, access_key_id: &str, bucket_name: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "DELETE FROM api_key_permissions WHERE access_key_id = ?1 AND bucket_name = ?2",
                params![access_key_id, bucket_name],
            )?;
            Ok(())
        })
    }

    fn list_permissions(&self, access_key_id: &str) -> CoreResult<Vec<ApiKeyPermissionRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT access_key_id, bucket_name, can_read, can_write
                 FROM api_key_permissions WHERE access_key_id = ?1",
            )?;
            let rows = stmt.query_map(params![access_key_id], |row| {
                let can_read: i64 = row.get(2)?;
                let can_write: i64 = row.get(3)?;
                Ok(ApiKeyPermissionRecord {
                    access_key_id: row.get(0)?,
                    bucket_name: row.get(1)?,
                    can_read: can_read != 0,
                    can_write: can_write != 0,
                })
            })?;
            rows.collect()
        })
    }

    // -- Settings ---------------------------------------------------------

    fn get_setting(&self, key: &str) -> CoreResult<Option<String>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set_setting(&self, key: &str, value: &str) -> CoreResult<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now()],
            )?;
            Ok(())
        })
    }

    // -- Audit log -------------------------------------------------------

    fn write_audit_log(&self, mut entry: NewAuditLogEntry) -> CoreResult<()> {
        if entry.timestamp.is_empty() {
            entry.timestamp = now();
        }
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO audit_logs (timestamp, action, actor, ip, resource, detail, success, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.timestamp,
                    entry.action,
                    entry.actor,
                    entry.ip,
                    entry.resource,
                    entry.detail,
                    entry.success as i64,
                    entry.user_agent,
                ],
            )?;
            Ok(())
        })
    }

    fn query_audit_logs(&self, filter: AuditLogFilter) -> CoreResult<AuditLogPage> {
        self.with_read(|conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref actor) = filter.actor {
                clauses.push("actor LIKE ?".to_string());
                binds.push(Box::new(format!("%{}%", escape_like(actor))));
            }
            if let Some(ref ip) = filter.ip {
                clauses.push("ip LIKE ?".to_string());
                binds.push(Box::new(format!("%{}%", escape_like(ip))));
            }
            if let Some(ref resource) = filter.resource {
                clauses.push("resource LIKE ?".to_string());
                binds.push(Box::new(format!("%{}%", escape_like(resource))));
            }
            if let Some(ref action) = filter.action {
                clauses.push("action = ?".to_string());
                binds.push(Box::new(action.clone()));
            }
            if let Some(success) = filter.success {
                clauses.push("success = ?".to_string());
                binds.push(Box::new(success as i64));
            }
            if let Some(ref since) = filter.since {
                clauses.push("timestamp >= ?".to_string());
                binds.push(Box::new(since.clone()));
            }
            if let Some(ref until) = filter.until {
                clauses.push("timestamp < ?".to_string());
                binds.push(Box::new(until.clone()));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = {
                let sql = format!("SELECT COUNT(*) FROM audit_logs {where_clause}");
                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    binds.iter().map(|b| b.as_ref()).collect();
                conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?
            };

            let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
            let sql = format!(
                "SELECT id, timestamp, action, actor, ip, resource, detail, success, user_agent
                 FROM audit_logs {where_clause}
                 ORDER BY timestamp DESC
                 LIMIT {limit} OFFSET {}",
                filter.offset
            );
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let entries: Vec<AuditLogRecord> = stmt
                .query_map(param_refs.as_slice(), |row| {
                    let success: i64 = row.get(7)?;
                    Ok(AuditLogRecord {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        action: row.get(2)?,
                        actor: row.get(3)?,
                        ip: row.get(4)?,
                        resource: row.get(5)?,
                        detail: row.get(6)?,
                        success: success != 0,
                        user_agent: row.get(8)?,
                    })
                })?
                .collect::<rusqlite::Result<_>>()?;

            Ok(AuditLogPage {
                entries,
                total: total as u64,
            })
        })
    }

    fn recent_audit_logs(&self, n: u32) -> CoreResult<Vec<AuditLogRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, action, actor, ip, resource, detail, success, user_agent
                 FROM audit_logs ORDER BY timestamp DESC LIMIT ?1",
            )?;
            stmt.query_map(params![n], |row| {
                let success: i64 = row.get(7)?;
                Ok(AuditLogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action: row.get(2)?,
                    actor: row.get(3)?,
                    ip: row.get(4)?,
                    resource: row.get(5)?,
                    detail: row.get(6)?,
                    success: success != 0,
                    user_agent: row.get(8)?,
                })
            })?
            .collect()
        })
    }

    fn clean_old_audit_logs(&self, days: u32) -> CoreResult<u64> {
        self.with_write(|conn| {
            let n = conn.execute(
                "DELETE FROM audit_logs WHERE timestamp < datetime('now', '-' || ?1 || ' days')",
                params![days],
            )?;
            Ok(n as u64)
        })
    }

    fn audit_stats(&self) -> CoreResult<AuditStats> {
        self.with_read(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_logs", [], |r| r.get(0))?;
            let today: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE date(timestamp) = date('now', 'localtime')",
                [],
                |r| r.get(0),
            )?;
            let failed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE success = 0",
                [],
                |r| r.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT action, COUNT(*) as cnt FROM audit_logs
                 GROUP BY action ORDER BY cnt DESC LIMIT 10",
            )?;
            let top_actions: Vec<(String, u64)> = stmt
                .query_map([], |row| {
                    let cnt: i64 = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, cnt as u64))
                })?
                .collect::<rusqlite::Result<_>>()?;

            Ok(AuditStats {
                total: total as u64,
                today: today as u64,
                failed: failed as u64,
                top_actions,
            })
        })
    }

    // -- Geo stats ---------------------------------------------------------

    fn upsert_geo_stat(
        &self,
        date: &str,
        country_code: &str,
        city: &str,
        country: &str,
        region: &str,
        delta: u64,
    ) -> CoreResult<()> {
        self.with_write(|conn| {
            let ts = now();
            conn.execute(
                "INSERT INTO geo_stats (date, country_code, city, country, region, request_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(date, country_code, city) DO UPDATE SET
                   request_count = request_count + ?6,
                   country = excluded.country,
                   region = excluded.region,
                   updated_at = ?7",
                params![date, country_code, city, country, region, delta as i64, ts],
            )?;
            Ok(())
        })
    }

    fn geo_stats_by_country(&self, limit: u32) -> CoreResult<Vec<(String, u64)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT country_code, SUM(request_count) as total FROM geo_stats
                 GROUP BY country_code ORDER BY total DESC LIMIT ?1",
            )?;
            stmt.query_map(params![limit.clamp(1, 1000)], |row| {
                let total: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, total as u64))
            })?
            .collect()
        })
    }

    fn geo_stats_by_country_city(&self, limit: u32) -> CoreResult<Vec<(String, String, u64)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT country_code, city, SUM(request_count) as total FROM geo_stats
                 GROUP BY country_code, city ORDER BY total DESC LIMIT ?1",
            )?;
            stmt.query_map(params![limit.clamp(1, 1000)], |row| {
                let total: i64 = row.get(2)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, total as u64))
            })?
            .collect()
        })
    }

    // -- Reconciliation helpers -------------------------------------------

    fn all_object_storage_paths(&self) -> CoreResult<Vec<String>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT storage_path FROM objects")?;
            stmt.query_map([], |row| row.get(0))?.collect()
        })
    }

    fn all_multipart_upload_ids(&self) -> CoreResult<Vec<String>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT upload_id FROM multipart_uploads")?;
            stmt.query_map([], |row| row.get(0))?.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::with_read_pool_size(":memory:", 3).unwrap()
    }

    fn bucket(name: &str) -> BucketRecord {
        BucketRecord {
            name: name.to_string(),
            creation_date: now(),
            is_public: false,
        }
    }

    #[test]
    fn create_and_get_bucket_round_trips() {
        let store = store();
        store.create_bucket(bucket("b1")).unwrap();
        let got = store.get_bucket("b1").unwrap().unwrap();
        assert_eq!(got.name, "b1");
        assert!(!got.is_public);
    }

    #[test]
    fn delete_bucket_requires_empty() {
        let store = store();
        store.create_bucket(bucket("b1")).unwrap();
        store
            .put_object(ObjectRecord {
                bucket: "b1".into(),
                key: "k".into(),
                size: 0,
                etag: "e".into(),
                content_type: "application/octet-stream".into(),
                last_modified: now(),
                storage_path: "/tmp/x".into(),
            })
            .unwrap();

        let err = store.delete_bucket("b1").unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(store.get_bucket("b1").unwrap().is_some());

        store.delete_object("b1", "k").unwrap();
        store.delete_bucket("b1").unwrap();
        assert!(store.get_bucket("b1").unwrap().is_none());
    }

    #[test]
    fn list_objects_with_delimiter_collapses_common_prefixes() {
        let store = store();
        store.create_bucket(bucket("b1")).unwrap();
        for key in ["a/x", "a/y", "b"] {
            store
                .put_object(ObjectRecord {
                    bucket: "b1".into(),
                    key: key.into(),
                    size: 0,
                    etag: "e".into(),
                    content_type: "application/octet-stream".into(),
                    last_modified: now(),
                    storage_path: format!("/tmp/{key}"),
                })
                .unwrap();
        }

        let result = store.list_objects("b1", "", "", "/", 10).unwrap();
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].key, "b");
        assert_eq!(result.common_prefixes, vec!["a/".to_string()]);
    }

    #[test]
    fn wildcard_permission_row_stored_and_listed() {
        let store = store();
        store
            .create_api_key(ApiKeyRecord {
                access_key_id: "k1".into(),
                secret_access_key: "secret".into(),
                description: "".into(),
                created_at: now(),
                enabled: true,
            })
            .unwrap();
        store.set_permission("k1", "*", true, false).unwrap();
        store.set_permission("k1", "b1", true, true).unwrap();
        let perms = store.list_permissions("k1").unwrap();
        assert_eq!(perms.len(), 2);
    }

    #[test]
    fn expired_uploads_report_aggregate_part_size() {
        let store = store();
        store.create_bucket(bucket("b1")).unwrap();
        store
            .create_multipart_upload(MultipartUploadRecord {
                upload_id: "a".repeat(32),
                bucket: "b1".into(),
                key: "k".into(),
                initiated: "2000-01-01T00:00:00+00:00".into(),
                content_type: "application/octet-stream".into(),
            })
            .unwrap();
        store
            .put_part(PartRecord {
                upload_id: "a".repeat(32),
                part_number: 1,
                size: 1500,
                etag: "e1".into(),
                modified_at: now(),
            })
            .unwrap();
        store
            .put_part(PartRecord {
                upload_id: "a".repeat(32),
                part_number: 2,
                size: 1500,
                etag: "e2".into(),
                modified_at: now(),
            })
            .unwrap();

        let expired = store.expired_multipart_uploads(3600).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, 2);
        assert_eq!(expired[0].2, 3000);
    }
}
