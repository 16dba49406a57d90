//! Integrity checker (component I).

use std::sync::Arc;
use std::time::Instant;

use md5::{Digest, Md5};
use tracing::{info, warn};

use crate::errors::CoreResult;
use crate::metadata::store::MetadataStore;

/// Kind of integrity issue found for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    MissingFile,
    EtagMismatch,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub bucket: String,
    pub key: String,
    pub kind: IssueKind,
    pub repairable: bool,
    pub detail: String,
}

/// Result of a check pass.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub total_checked: u64,
    pub missing_files: u64,
    pub etag_mismatches: u64,
    pub issues: Vec<Issue>,
    pub duration_ms: u64,
}

impl CheckReport {
    pub fn issues_found(&self) -> u64 {
        self.missing_files + self.etag_mismatches
    }
}

/// Result of applying repairs.
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    pub repaired_count: u64,
    pub errors: Vec<String>,
}

pub struct IntegrityChecker {
    store: Arc<dyn MetadataStore>,
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim_matches('"')
}

impl IntegrityChecker {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Check every object across every bucket (or a single bucket if
    /// `bucket` is set), optionally capped at `limit` objects (0 = no
    /// limit). When `verify_etag` is set, recomputes MD5 of the file and
    /// compares against the stored ETag (with and without quotes).
    pub fn check(&self, bucket: Option<&str>, verify_etag: bool, limit: u64) -> CoreResult<CheckReport> {
        let start = Instant::now();
        let mut report = CheckReport::default();

        let buckets = match bucket {
            Some(name) => vec![name.to_string()],
            None => self.store.list_buckets()?.into_iter().map(|b| b.name).collect(),
        };

        'outer: for bucket_name in buckets {
            let mut marker = String::new();
            loop {
                let page = self.store.list_objects(&bucket_name, "", &marker, "", 1000)?;
                if page.objects.is_empty() {
                    break;
                }
                for object in &page.objects {
                    if limit > 0 && report.total_checked >= limit {
                        break 'outer;
                    }
                    report.total_checked += 1;

                    let path = std::path::Path::new(&object.storage_path);
                    if !path.exists() {
                        report.missing_files += 1;
                        report.issues.push(Issue {
                            bucket: object.bucket.clone(),
                            key: object.key.clone(),
                            kind: IssueKind::MissingFile,
                            repairable: true,
                            detail: format!("file missing at {}", object.storage_path),
                        });
                        continue;
                    }

                    if verify_etag {
                        let data = std::fs::read(path)?;
                        let recomputed = hex::encode(Md5::digest(&data));
                        let stored_bare = strip_quotes(&object.etag);
                        if recomputed != object.etag && recomputed != stored_bare {
                            report.etag_mismatches += 1;
                            report.issues.push(Issue {
                                bucket: object.bucket.clone(),
                                key: object.key.clone(),
                                kind: IssueKind::EtagMismatch,
                                repairable: true,
                                detail: format!(
                                    "stored etag {} does not match recomputed {recomputed}",
                                    object.etag
                                ),
                            });
                        }
                    }
                }
                if !page.is_truncated {
                    break;
                }
                marker = page.objects.last().map(|o| o.key.clone()).unwrap_or_default();
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "integrity check: {} checked, {} missing, {} etag mismatches in {} ms",
            report.total_checked, report.missing_files, report.etag_mismatches, report.duration_ms
        );
        Ok(report)
    }

    /// Apply fixes for every repairable issue in `issues`.
    pub fn repair(&self, issues: &[Issue]) -> CoreResult<RepairReport> {
        let mut report = RepairReport::default();
        for issue in issues {
            if !issue.repairable {
                continue;
            }
            let result = match issue.kind {
                IssueKind::MissingFile => self.store.delete_object(&issue.bucket, &issue.key),
                IssueKind::EtagMismatch => self.repair_etag(&issue.bucket, &issue.key),
            };
            match result {
                Ok(()) => report.repaired_count += 1,
                Err(e) => {
                    warn!("failed to repair {}/{}: {e}", issue.bucket, issue.key);
                    report.errors.push(format!("{}/{}: {e}", issue.bucket, issue.key));
                }
            }
        }
        Ok(report)
    }

    fn repair_etag(&self, bucket: &str, key: &str) -> CoreResult<()> {
        let Some(object) = self.store.get_object(bucket, key)? else {
            return Ok(());
        };
        let data = std::fs::read(&object.storage_path)?;
        let recomputed = hex::encode(Md5::digest(&data));
        self.store.update_object_etag(bucket, key, &format!("\"{recomputed}\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::{BucketRecord, ObjectRecord};

    fn setup() -> (Arc<dyn MetadataStore>, IntegrityChecker) {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        store
            .create_bucket(BucketRecord {
                name: "b1".into(),
                creation_date: "now".into(),
                is_public: false,
            })
            .unwrap();
        let checker = IntegrityChecker::new(store.clone());
        (store, checker)
    }

    #[test]
    fn missing_file_is_repairable_and_matches_s5() {
        let (store, checker) = setup();
        store
            .put_object(ObjectRecord {
                bucket: "b1".into(),
                key: "gone.txt".into(),
                size: 0,
                etag: "e".into(),
                content_type: "application/octet-stream".into(),
                last_modified: "now".into(),
                storage_path: "/nonexistent/gone.txt".into(),
            })
            .unwrap();

        let report = checker.check(None, false, 0).unwrap();
        assert_eq!(report.total_checked, 1);
        assert_eq!(report.missing_files, 1);
        assert_eq!(report.issues_found(), 1);

        let repair = checker.repair(&report.issues).unwrap();
        assert_eq!(repair.repaired_count, 1);
        assert!(store.get_object("b1", "gone.txt").unwrap().is_none());
    }

    #[test]
    fn repair_then_recheck_yields_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("obj.bin");
        std::fs::write(&file_path, b"hello").unwrap();

        let (store, checker) = setup();
        store
            .put_object(ObjectRecord {
                bucket: "b1".into(),
                key: "obj.bin".into(),
                size: 5,
                etag: "\"wrong\"".into(),
                content_type: "application/octet-stream".into(),
                last_modified: "now".into(),
                storage_path: file_path.to_string_lossy().to_string(),
            })
            .unwrap();

        let report = checker.check(None, true, 0).unwrap();
        assert_eq!(report.etag_mismatches, 1);
        checker.repair(&report.issues).unwrap();

        let second = checker.check(None, true, 0).unwrap();
        assert_eq!(second.issues_found(), 0);
    }
}
