//! Metadata serialization: export/import between SQLite and JSON.

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const VERSION: &str = "0.1.0";
pub const EXPORT_VERSION: i64 = 1;

pub const ALL_TABLES: &[&str] = &[
    "buckets",
    "objects",
    "multipart_uploads",
    "parts",
    "api_keys",
    "api_key_permissions",
    "system_settings",
];

const BOOL_FIELDS: &[&str] = &["is_public", "enabled", "can_read", "can_write"];

const TABLE_COLUMNS: &[(&str, &[&str])] = &[
    ("buckets", &["name", "creation_date", "is_public"]),
    (
        "objects",
        &["bucket", "key", "size", "etag", "content_type", "last_modified", "storage_path"],
    ),
    (
        "multipart_uploads",
        &["upload_id", "bucket", "key", "initiated", "content_type"],
    ),
    ("parts", &["upload_id", "part_number", "size", "etag", "modified_at"]),
    (
        "api_keys",
        &["access_key_id", "secret_access_key", "description", "created_at", "enabled"],
    ),
    (
        "api_key_permissions",
        &["access_key_id", "bucket_name", "can_read", "can_write"],
    ),
    ("system_settings", &["key", "value", "updated_at"]),
];

const TABLE_ORDER_BY: &[(&str, &str)] = &[
    ("buckets", "name"),
    ("objects", "bucket, key"),
    ("multipart_uploads", "upload_id"),
    ("parts", "upload_id, part_number"),
    ("api_keys", "access_key_id"),
    ("api_key_permissions", "access_key_id, bucket_name"),
    ("system_settings", "key"),
];

const DELETE_ORDER: &[&str] = &[
    "parts",
    "multipart_uploads",
    "objects",
    "api_key_permissions",
    "api_keys",
    "buckets",
    "system_settings",
];
const INSERT_ORDER: &[&str] = &[
    "buckets",
    "objects",
    "multipart_uploads",
    "parts",
    "api_keys",
    "api_key_permissions",
    "system_settings",
];

/// Setting keys holding secret material; always redacted on export unless
/// `include_secrets` is set.
const SECRET_SETTING_KEYS: &[&str] = &["system.encryption_key"];

pub struct ExportOptions {
    pub tables: Vec<String>,
    pub include_secrets: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            tables: ALL_TABLES.iter().map(|s| s.to_string()).collect(),
            include_secrets: false,
        }
    }
}

pub struct ImportOptions {
    pub replace: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { replace: false }
    }
}

pub struct ImportResult {
    pub counts: BTreeMap<String, usize>,
    pub skipped: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

fn is_bool_field(col: &str) -> bool {
    BOOL_FIELDS.contains(&col)
}

fn get_columns(table: &str) -> Option<&'static [&'static str]> {
    TABLE_COLUMNS.iter().find(|(t, _)| *t == table).map(|(_, cols)| *cols)
}

fn get_order_by(table: &str) -> &'static str {
    TABLE_ORDER_BY
        .iter()
        .find(|(t, _)| *t == table)
        .map(|(_, o)| *o)
        .unwrap_or("rowid")
}

fn get_schema_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .unwrap_or(1)
}

/// Read a column value from a rusqlite Row and convert to serde_json Value.
fn read_column(row: &rusqlite::Row, idx: usize, col: &str) -> Value {
    if is_bool_field(col) {
        let v: Option<i64> = row.get(idx).ok();
        match v {
            None => Value::Null,
            Some(v) => Value::Bool(v != 0),
        }
    } else if let Ok(v) = row.get::<_, i64>(idx) {
        Value::Number(v.into())
    } else if let Ok(v) = row.get::<_, f64>(idx) {
        serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
    } else if let Ok(v) = row.get::<_, String>(idx) {
        Value::String(v)
    } else {
        Value::Null
    }
}

pub fn export_metadata(db_path: &str, opts: &ExportOptions) -> anyhow::Result<String> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let schema_version = get_schema_version(&conn);

    let mut result = BTreeMap::<String, Value>::new();
    result.insert(
        "objectstore_export".to_string(),
        json!({
            "exported_at": Utc::now().to_rfc3339(),
            "schema_version": schema_version,
            "source": format!("rust/{}", VERSION),
            "version": EXPORT_VERSION,
        }),
    );

    for table in &opts.tables {
        let columns = match get_columns(table) {
            Some(c) => c,
            None => continue,
        };
        let order_by = get_order_by(table);
        let query = format!("SELECT * FROM {} ORDER BY {}", table, order_by);
        let mut stmt = conn.prepare(&query)?;

        let mut rows_out: Vec<Value> = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut obj = Map::new();
            for (i, col) in columns.iter().enumerate() {
                obj.insert(col.to_string(), read_column(row, i, col));
            }
            if table == "api_keys" {
                obj.insert("secret_access_key".to_string(), Value::String("REDACTED".to_string()));
            }
            if table == "system_settings" {
                if let Some(Value::String(key)) = obj.get("key") {
                    if SECRET_SETTING_KEYS.contains(&key.as_str()) && !opts.include_secrets {
                        obj.insert("value".to_string(), Value::String("REDACTED".to_string()));
                    }
                }
            }
            rows_out.push(Value::Object(obj));
        }
        result.insert(table.to_string(), Value::Array(rows_out));
    }

    let json = serde_json::to_string_pretty(&result)?;
    Ok(json)
}

pub fn import_metadata(db_path: &str, json_str: &str, opts: &ImportOptions) -> anyhow::Result<ImportResult> {
    let data: BTreeMap<String, Value> = serde_json::from_str(json_str)?;

    let envelope = data
        .get("objectstore_export")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow::anyhow!("missing objectstore_export envelope"))?;
    let version = envelope.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
    if version < 1 || version > EXPORT_VERSION {
        anyhow::bail!("unsupported export version: {}", version);
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    let mut result = ImportResult {
        counts: BTreeMap::new(),
        skipped: BTreeMap::new(),
        warnings: Vec::new(),
    };

    let tx = conn.unchecked_transaction()?;

    if opts.replace {
        for table in DELETE_ORDER {
            if data.contains_key(*table) {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
        }
    }

    for table in INSERT_ORDER {
        let rows_data = match data.get(*table) {
            Some(Value::Array(arr)) => arr,
            _ => continue,
        };
        let columns = match get_columns(table) {
            Some(c) => c,
            None => continue,
        };

        let mut inserted = 0usize;
        let mut skipped = 0usize;

        for row_val in rows_data {
            let row = match row_val.as_object() {
                Some(m) => m,
                None => {
                    skipped += 1;
                    continue;
                }
            };

            if *table == "api_keys" {
                if let Some(Value::String(secret)) = row.get("secret_access_key") {
                    if secret == "REDACTED" {
                        skipped += 1;
                        let ak = row.get("access_key_id").and_then(|v| v.as_str()).unwrap_or("?");
                        result.warnings.push(format!("Skipped api key '{}': REDACTED secret", ak));
                        continue;
                    }
                }
            }

            let col_names = columns.join(", ");
            let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
            let ph = placeholders.join(", ");

            let sql = if opts.replace {
                format!("INSERT INTO {} ({}) VALUES ({})", table, col_names, ph)
            } else {
                format!("INSERT OR IGNORE INTO {} ({}) VALUES ({})", table, col_names, ph)
            };

            let values: Vec<Box<dyn rusqlite::types::ToSql>> = columns
                .iter()
                .map(|col| collapse_value(row.get(*col).cloned().unwrap_or(Value::Null), col))
                .collect();

            let param_refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();

            match tx.execute(&sql, param_refs.as_slice()) {
                Ok(n) if n > 0 => inserted += 1,
                Ok(_) => skipped += 1,
                Err(e) => {
                    skipped += 1;
                    result.warnings.push(format!("Skipped {} row: {}", table, e));
                }
            }
        }

        result.counts.insert(table.to_string(), inserted);
        result.skipped.insert(table.to_string(), skipped);
    }

    tx.commit()?;
    Ok(result)
}

fn collapse_value(val: Value, col: &str) -> Box<dyn rusqlite::types::ToSql> {
    if is_bool_field(col) {
        match val {
            Value::Null => Box::new(Option::<i64>::None),
            Value::Bool(b) => Box::new(if b { 1i64 } else { 0i64 }),
            _ => Box::new(0i64),
        }
    } else {
        match val {
            Value::Null => Box::new(Option::<String>::None),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Box::new(i)
                } else if let Some(f) = n.as_f64() {
                    Box::new(f)
                } else {
                    Box::new(n.to_string())
                }
            }
            Value::String(s) => Box::new(s),
            _ => Box::new(serde_json::to_string(&val).unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::{ApiKeyRecord, BucketRecord, MetadataStore, ObjectRecord};

    fn seed(path: &str) {
        let store = SqliteMetadataStore::new(path).unwrap();
        store
            .create_bucket(BucketRecord {
                name: "test-bucket".into(),
                creation_date: "2026-02-25T12:00:00+00:00".into(),
                is_public: false,
            })
            .unwrap();
        store
            .put_object(ObjectRecord {
                bucket: "test-bucket".into(),
                key: "photos/cat.jpg".into(),
                size: 142857,
                etag: "d41d8cd98f00b204e9800998ecf8427e".into(),
                content_type: "image/jpeg".into(),
                last_modified: "2026-02-25T14:30:45+00:00".into(),
                storage_path: "/data/objects/test-bucket/00/photos/cat.jpg".into(),
            })
            .unwrap();
        store
            .create_api_key(ApiKeyRecord {
                access_key_id: "objectstore".into(),
                secret_access_key: "objectstore-secret".into(),
                description: "seed".into(),
                created_at: "2026-02-25T12:00:00+00:00".into(),
                enabled: true,
            })
            .unwrap();
    }

    #[test]
    fn export_all_tables_round_trips_counts() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        seed(db_str);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();

        let envelope = data["objectstore_export"].as_object().unwrap();
        assert_eq!(envelope["version"], 1);
        assert_eq!(data["buckets"].as_array().unwrap().len(), 1);
        assert_eq!(data["objects"].as_array().unwrap().len(), 1);
        assert_eq!(data["api_keys"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn export_redacts_secrets_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        seed(db_str);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();
        assert_eq!(data["api_keys"][0]["secret_access_key"], "REDACTED");
    }

    #[test]
    fn import_skips_redacted_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let db1 = dir.path().join("source.db");
        let db2 = dir.path().join("target.db");
        seed(db1.to_str().unwrap());
        SqliteMetadataStore::new(db2.to_str().unwrap()).unwrap();

        let exported = export_metadata(db1.to_str().unwrap(), &ExportOptions::default()).unwrap();
        let result = import_metadata(db2.to_str().unwrap(), &exported, &ImportOptions::default()).unwrap();

        assert_eq!(*result.skipped.get("api_keys").unwrap(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("REDACTED"));
        assert_eq!(*result.counts.get("buckets").unwrap(), 1);
        assert_eq!(*result.counts.get("objects").unwrap(), 1);
    }

    #[test]
    fn import_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        seed(db.to_str().unwrap());

        let exported = export_metadata(db.to_str().unwrap(), &ExportOptions::default()).unwrap();
        let result = import_metadata(db.to_str().unwrap(), &exported, &ImportOptions::default()).unwrap();
        assert_eq!(*result.counts.get("buckets").unwrap(), 0);
    }

    #[test]
    fn import_rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        SqliteMetadataStore::new(db.to_str().unwrap()).unwrap();

        let err = import_metadata(
            db.to_str().unwrap(),
            r#"{"objectstore_export":{"version":99}}"#,
            &ImportOptions::default(),
        );
        assert!(err.is_err());
    }
}
