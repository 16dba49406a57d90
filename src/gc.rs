//! Garbage collector (component H): three-step reconciliation between the
//! catalog and the filesystem.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::CoreResult;
use crate::filestore::FileStore;
use crate::metadata::store::MetadataStore;
use crate::path;

/// One expired multipart upload, with its aggregated part stats.
#[derive(Debug, Clone)]
pub struct ExpiredUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub part_count: u64,
    pub total_size: u64,
}

/// Result of a GC pass. In dry-run, these are the items that *would* be
/// removed; otherwise they are what was actually removed (modulo
/// per-item failures, which are reported but do not roll back earlier
/// successes).
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub orphan_files: Vec<String>,
    pub multipart_orphans: Vec<String>,
    pub expired_uploads: Vec<ExpiredUpload>,
    pub errors: Vec<String>,
}

impl GcReport {
    pub fn orphan_count(&self) -> usize {
        self.orphan_files.len()
    }
    pub fn expired_count(&self) -> usize {
        self.expired_uploads.len()
    }
}

pub struct GarbageCollector {
    store: Arc<dyn MetadataStore>,
    files: Arc<FileStore>,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn MetadataStore>, files: Arc<FileStore>) -> Self {
        Self { store, files }
    }

    /// Run the full three-step reconciliation. `max_age_secs` bounds what
    /// counts as an expired multipart upload. When `dry_run` is set,
    /// nothing is deleted; the report describes what would be removed.
    pub fn run(&self, max_age_secs: i64, dry_run: bool) -> CoreResult<GcReport> {
        let mut report = GcReport::default();

        // Step 1: orphan objects.
        let known_paths: HashSet<String> = self.store.all_object_storage_paths()?.into_iter().collect();
        let orphan_files = self.files.scan_orphan_files(&known_paths)?;
        report.orphan_files = orphan_files.iter().map(|p| p.to_string_lossy().to_string()).collect();

        // Step 2: orphan multipart parts.
        let active_uploads: HashSet<String> = self.store.all_multipart_upload_ids()?.into_iter().collect();
        let multipart_orphans = self.files.scan_multipart_orphans(&active_uploads)?;
        report.multipart_orphans = multipart_orphans
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        // Step 3: expired multipart uploads.
        for (upload, part_count, total_size) in self.store.expired_multipart_uploads(max_age_secs)? {
            report.expired_uploads.push(ExpiredUpload {
                upload_id: upload.upload_id,
                bucket: upload.bucket,
                key: upload.key,
                part_count,
                total_size,
            });
        }

        info!(
            "gc scan: {} orphan files, {} orphan multipart files, {} expired uploads (dry_run={})",
            report.orphan_files.len(),
            report.multipart_orphans.len(),
            report.expired_uploads.len(),
            dry_run
        );

        if dry_run {
            return Ok(report);
        }

        for candidate in &orphan_files {
            let confined = match path::confine(self.files.base(), candidate) {
                Ok(p) => p,
                Err(e) => {
                    warn!("refusing to remove orphan outside base {}: {e}", candidate.display());
                    report
                        .errors
                        .push(format!("refusing to remove orphan outside base {}: {e}", candidate.display()));
                    continue;
                }
            };
            match std::fs::remove_file(&confined) {
                Ok(()) => {
                    if let Some(parent) = confined.parent() {
                        self.files.clean_empty_dirs(parent);
                    }
                }
                Err(e) => {
                    warn!("failed to remove orphan {}: {e}", confined.display());
                    report.errors.push(format!("failed to remove orphan {}: {e}", confined.display()));
                }
            }
        }

        for candidate in &multipart_orphans {
            let confined = match path::confine(self.files.base(), candidate) {
                Ok(p) => p,
                Err(e) => {
                    warn!("refusing to remove multipart orphan outside base {}: {e}", candidate.display());
                    report.errors.push(format!(
                        "refusing to remove multipart orphan outside base {}: {e}",
                        candidate.display()
                    ));
                    continue;
                }
            };
            if let Err(e) = std::fs::remove_file(&confined) {
                report
                    .errors
                    .push(format!("failed to remove multipart orphan {}: {e}", confined.display()));
            }
        }

        for expired in &report.expired_uploads {
            if let Err(e) = self.store.delete_multipart_upload(&expired.upload_id) {
                report
                    .errors
                    .push(format!("failed to delete upload row {}: {e}", expired.upload_id));
                continue;
            }
            if let Err(e) = self.files.abort_multipart_upload(&expired.upload_id) {
                report
                    .errors
                    .push(format!("failed to remove upload subtree {}: {e}", expired.upload_id));
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::{BucketRecord, MultipartUploadRecord, ObjectRecord, PartRecord};
    use std::io::Cursor;

    fn setup() -> (tempfile::TempDir, GarbageCollector, Arc<dyn MetadataStore>, Arc<FileStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        let files = Arc::new(FileStore::new(dir.path()).unwrap());
        let gc = GarbageCollector::new(store.clone(), files.clone());
        (dir, gc, store, files)
    }

    #[test]
    fn dry_run_reports_without_deleting() {
        let (_dir, gc, _store, files) = setup();
        let written = files.put_object("b1", "orphan.txt", Cursor::new(b"x")).unwrap();

        let report = gc.run(3600, true).unwrap();
        assert_eq!(report.orphan_count(), 1);
        assert!(written.path.exists());
    }

    #[test]
    fn gc_convergence_matches_s6() {
        let (_dir, gc, store, files) = setup();
        store
            .create_bucket(BucketRecord {
                name: "b1".into(),
                creation_date: "now".into(),
                is_public: false,
            })
            .unwrap();
        let upload_id = "c".repeat(32);
        store
            .create_multipart_upload(MultipartUploadRecord {
                upload_id: upload_id.clone(),
                bucket: "b1".into(),
                key: "k".into(),
                initiated: "2000-01-01T00:00:00+00:00".into(),
                content_type: "application/octet-stream".into(),
            })
            .unwrap();
        store
            .put_part(PartRecord {
                upload_id: upload_id.clone(),
                part_number: 1,
                size: 1500,
                etag: "e1".into(),
                modified_at: "now".into(),
            })
            .unwrap();
        store
            .put_part(PartRecord {
                upload_id: upload_id.clone(),
                part_number: 2,
                size: 1500,
                etag: "e2".into(),
                modified_at: "now".into(),
            })
            .unwrap();
        files.put_part(&upload_id, 1, Cursor::new(vec![0u8; 1500])).unwrap();
        files.put_part(&upload_id, 2, Cursor::new(vec![0u8; 1500])).unwrap();

        let report = gc.run(3600, false).unwrap();
        assert_eq!(report.expired_count(), 1);
        assert!(store.get_multipart_upload(&upload_id).unwrap().is_none());
        assert!(!files.base().join(".multipart").join(&upload_id).exists());
    }

    #[test]
    fn does_not_delete_object_rows_with_missing_files() {
        let (_dir, gc, store, _files) = setup();
        store
            .create_bucket(BucketRecord {
                name: "b1".into(),
                creation_date: "now".into(),
                is_public: false,
            })
            .unwrap();
        store
            .put_object(ObjectRecord {
                bucket: "b1".into(),
                key: "missing.txt".into(),
                size: 0,
                etag: "e".into(),
                content_type: "application/octet-stream".into(),
                last_modified: "now".into(),
                storage_path: "/nonexistent/path".into(),
            })
            .unwrap();

        gc.run(0, false).unwrap();
        assert!(store.get_object("b1", "missing.txt").unwrap().is_some());
    }
}
