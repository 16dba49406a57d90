//! Migration engine (component J): pulls objects from a remote
//! S3-compatible bucket into this store.
//!
//! The remote client setup (path-style, static credentials, custom
//! endpoint) and the `ListObjectsV2` pagination loop are generalized from
//! the AWS gateway backend's `delete_parts`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aws_sdk_s3::Client;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::filestore::FileStore;
use crate::metadata::store::{MetadataStore, ObjectRecord};

static REGISTRY: Mutex<Option<Arc<MigrationManager>>> = Mutex::new(None);

/// Configuration for a single migration job.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub endpoint_url: String,
    pub region: Option<String>,
    pub source_access_key: String,
    pub source_secret_key: String,
    pub source_bucket: String,
    pub source_prefix: Option<String>,
    pub target_bucket: String,
    pub target_prefix: Option<String>,
    pub overwrite_existing: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Live progress of a migration job.
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub total_objects: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub transfer_size: u64,
    pub failed_objects: Vec<String>,
    pub error: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
}

impl MigrationProgress {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            total_objects: 0,
            completed: 0,
            skipped: 0,
            failed: 0,
            transfer_size: 0,
            failed_objects: Vec::new(),
            error: None,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
        }
    }
}

/// Per-state job counts, per [`MigrationManager::job_stats`].
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct JobEntry {
    progress: Mutex<MigrationProgress>,
    cancel_requested: AtomicBool,
}

/// Process-wide migration job registry.
pub struct MigrationManager {
    store: Arc<dyn MetadataStore>,
    files: Arc<FileStore>,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
}

fn generate_job_id() -> CoreResult<String> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CoreError::CryptoUnavailable(e.to_string()))?;
    Ok(hex::encode(bytes))
}

impl MigrationManager {
    fn new(store: Arc<dyn MetadataStore>, files: Arc<FileStore>) -> Self {
        Self {
            store,
            files,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the process-wide instance, constructing it on first use.
    pub fn instance(store: Arc<dyn MetadataStore>, files: Arc<FileStore>) -> Arc<Self> {
        let mut guard = REGISTRY.lock().expect("migration registry lock poisoned");
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let manager = Arc::new(Self::new(store, files));
        *guard = Some(manager.clone());
        manager
    }

    /// Tear down the singleton. Intended for test teardown.
    pub fn reset_for_test() {
        *REGISTRY.lock().expect("migration registry lock poisoned") = None;
    }

    fn validate_config(&self, config: &MigrateConfig) -> CoreResult<()> {
        if config.endpoint_url.is_empty() {
            return Err(CoreError::InvalidKey("endpoint is required".into()));
        }
        if config.source_access_key.is_empty() || config.source_secret_key.is_empty() {
            return Err(CoreError::InvalidKey("source credentials are required".into()));
        }
        if config.source_bucket.is_empty() {
            return Err(CoreError::InvalidKey("source bucket is required".into()));
        }
        if config.target_bucket.is_empty() {
            return Err(CoreError::InvalidKey("target bucket is required".into()));
        }
        if self.store.get_bucket(&config.target_bucket)?.is_none() {
            return Err(CoreError::NotFound(format!(
                "target bucket does not exist: {}",
                config.target_bucket
            )));
        }
        Ok(())
    }

    async fn build_client(config: &MigrateConfig) -> Client {
        let region = config.region.clone().unwrap_or_else(default_region);
        let creds = aws_sdk_s3::config::Credentials::new(
            &config.source_access_key,
            &config.source_secret_key,
            None,
            None,
            "objectstore-migration",
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .endpoint_url(&config.endpoint_url)
            .credentials_provider(creds)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        Client::from_conf(s3_config)
    }

    /// Probe the source with a 10-second-deadline single-object list.
    pub async fn validate_migrate_config(&self, config: &MigrateConfig) -> CoreResult<()> {
        self.validate_config(config)?;
        let client = Self::build_client(config).await;
        let mut req = client.list_objects_v2().bucket(&config.source_bucket).max_keys(1);
        if let Some(ref prefix) = config.source_prefix {
            req = req.prefix(prefix);
        }
        tokio::time::timeout(Duration::from_secs(10), req.send())
            .await
            .map_err(|_| CoreError::IOError("source probe timed out".into()))?
            .map_err(|e| CoreError::IOError(format!("source probe failed: {e}")))?;
        Ok(())
    }

    /// Validate, register, and spawn the background worker. Returns the
    /// new job's id immediately.
    pub fn start_migration(self: &Arc<Self>, config: MigrateConfig) -> CoreResult<String> {
        self.validate_config(&config)?;
        let job_id = generate_job_id()?;

        let entry = Arc::new(JobEntry {
            progress: Mutex::new(MigrationProgress::new(job_id.clone())),
            cancel_requested: AtomicBool::new(false),
        });
        self.jobs
            .lock()
            .expect("migration jobs lock poisoned")
            .insert(job_id.clone(), entry.clone());

        let manager = self.clone();
        let job_id_for_worker = job_id.clone();
        tokio::spawn(async move {
            manager.run_worker(job_id_for_worker, entry, config).await;
        });

        Ok(job_id)
    }

    async fn run_worker(self: Arc<Self>, job_id: String, entry: Arc<JobEntry>, config: MigrateConfig) {
        {
            let mut progress = entry.progress.lock().expect("progress lock poisoned");
            progress.status = JobStatus::Running;
        }

        let client = Self::build_client(&config).await;
        let mut source_objects: Vec<(String, u64, String)> = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut req = client.list_objects_v2().bucket(&config.source_bucket);
            if let Some(ref prefix) = config.source_prefix {
                req = req.prefix(prefix);
            }
            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    self.finish_with_error(&entry, format!("list_objects_v2 failed: {e}"));
                    return;
                }
            };
            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                let size = object.size().unwrap_or(0).max(0) as u64;
                let etag = object.e_tag().unwrap_or_default().trim_matches('"').to_string();
                source_objects.push((key.to_string(), size, etag));
            }
            if resp.is_truncated() == Some(true) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        {
            let mut progress = entry.progress.lock().expect("progress lock poisoned");
            progress.total_objects = source_objects.len() as u64;
        }

        for (source_key, _size, _etag) in source_objects {
            if entry.cancel_requested.load(Ordering::SeqCst) {
                return;
            }
            {
                let status = entry.progress.lock().expect("progress lock poisoned").status;
                if status == JobStatus::Cancelled {
                    return;
                }
            }

            let target_key = rewrite_prefix(&source_key, &config);

            if !config.overwrite_existing {
                match self.store.get_object(&config.target_bucket, &target_key) {
                    Ok(Some(_)) => {
                        let mut progress = entry.progress.lock().expect("progress lock poisoned");
                        progress.skipped += 1;
                        progress.completed += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("migration job {job_id}: failed to check target existence: {e}");
                    }
                }
            }

            match self.transfer_one(&client, &config, &source_key, &target_key).await {
                Ok(size) => {
                    let mut progress = entry.progress.lock().expect("progress lock poisoned");
                    progress.completed += 1;
                    progress.transfer_size += size;
                }
                Err(e) => {
                    let mut progress = entry.progress.lock().expect("progress lock poisoned");
                    progress.failed += 1;
                    progress.failed_objects.push(source_key.clone());
                    drop(progress);
                    warn!("migration job {job_id}: failed to transfer {source_key}: {e}");
                }
            }
        }

        let mut progress = entry.progress.lock().expect("progress lock poisoned");
        progress.status = JobStatus::Completed;
        if progress.failed > 0 {
            progress.error = Some(format!("{} objects failed", progress.failed));
        }
        progress.end_time = Some(Utc::now().to_rfc3339());
        info!("migration job {job_id} completed: {:?}", *progress);
    }

    async fn transfer_one(
        &self,
        client: &Client,
        config: &MigrateConfig,
        source_key: &str,
        target_key: &str,
    ) -> CoreResult<u64> {
        let resp = client
            .get_object()
            .bucket(&config.source_bucket)
            .key(source_key)
            .send()
            .await
            .map_err(|e| CoreError::IOError(format!("get_object failed: {e}")))?;
        let content_type = resp.content_type().unwrap_or("application/octet-stream").to_string();
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| CoreError::IOError(format!("failed to read source body: {e}")))?
            .into_bytes();

        let written = self
            .files
            .put_object(&config.target_bucket, target_key, std::io::Cursor::new(&body[..]))?;

        let put_result = self.store.put_object(ObjectRecord {
            bucket: config.target_bucket.clone(),
            key: target_key.to_string(),
            size: written.size,
            etag: written.etag.clone(),
            content_type,
            last_modified: Utc::now().to_rfc3339(),
            storage_path: written.path.to_string_lossy().to_string(),
        });

        if let Err(e) = put_result {
            let _ = self.files.delete_object(&written.path.to_string_lossy());
            return Err(e);
        }

        Ok(written.size)
    }

    fn finish_with_error(&self, entry: &JobEntry, message: String) {
        let mut progress = entry.progress.lock().expect("progress lock poisoned");
        progress.status = JobStatus::Failed;
        progress.error = Some(message);
        progress.end_time = Some(Utc::now().to_rfc3339());
    }

    pub fn get_progress(&self, job_id: &str) -> Option<MigrationProgress> {
        let jobs = self.jobs.lock().expect("migration jobs lock poisoned");
        jobs.get(job_id).map(|entry| entry.progress.lock().expect("progress lock poisoned").clone())
    }

    pub fn get_all_jobs(&self) -> Vec<MigrationProgress> {
        let jobs = self.jobs.lock().expect("migration jobs lock poisoned");
        jobs.values()
            .map(|entry| entry.progress.lock().expect("progress lock poisoned").clone())
            .collect()
    }

    /// Allowed only from `pending` or `running`.
    pub fn cancel_migration(&self, job_id: &str) -> CoreResult<()> {
        let jobs = self.jobs.lock().expect("migration jobs lock poisoned");
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| CoreError::NotFound(format!("migration job not found: {job_id}")))?;
        let mut progress = entry.progress.lock().expect("progress lock poisoned");
        if progress.status.is_terminal() {
            return Err(CoreError::AlreadyTerminal(format!(
                "job {job_id} is already {:?}",
                progress.status
            )));
        }
        progress.status = JobStatus::Cancelled;
        progress.end_time = Some(Utc::now().to_rfc3339());
        entry.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Allowed only from a terminal state.
    pub fn delete_job(&self, job_id: &str) -> CoreResult<()> {
        let mut jobs = self.jobs.lock().expect("migration jobs lock poisoned");
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| CoreError::NotFound(format!("migration job not found: {job_id}")))?;
        let terminal = entry.progress.lock().expect("progress lock poisoned").status.is_terminal();
        if !terminal {
            return Err(CoreError::Conflict(format!("job {job_id} is still active")));
        }
        jobs.remove(job_id);
        Ok(())
    }

    pub fn job_stats(&self) -> JobStats {
        let jobs = self.jobs.lock().expect("migration jobs lock poisoned");
        let mut stats = JobStats::default();
        for entry in jobs.values() {
            match entry.progress.lock().expect("progress lock poisoned").status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

/// `sourcePrefix`+`targetPrefix` → replace; only `targetPrefix` → prepend;
/// neither → unchanged.
fn rewrite_prefix(key: &str, config: &MigrateConfig) -> String {
    match (&config.source_prefix, &config.target_prefix) {
        (Some(src), Some(dst)) => {
            if let Some(rest) = key.strip_prefix(src.as_str()) {
                format!("{dst}{rest}")
            } else {
                key.to_string()
            }
        }
        (None, Some(dst)) => format!("{dst}{key}"),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(source_prefix: Option<&str>, target_prefix: Option<&str>) -> MigrateConfig {
        MigrateConfig {
            endpoint_url: "http://localhost:9000".into(),
            region: None,
            source_access_key: "ak".into(),
            source_secret_key: "sk".into(),
            source_bucket: "src".into(),
            source_prefix: source_prefix.map(String::from),
            target_bucket: "dst".into(),
            target_prefix: target_prefix.map(String::from),
            overwrite_existing: false,
        }
    }

    #[test]
    fn rewrite_prefix_replaces_matching_source_prefix() {
        assert_eq!(rewrite_prefix("a/x/y", &cfg(Some("a/"), Some("b/"))), "b/x/y");
    }

    #[test]
    fn rewrite_prefix_prepends_when_only_target_set() {
        assert_eq!(rewrite_prefix("k", &cfg(None, Some("b/"))), "b/k");
    }

    #[test]
    fn rewrite_prefix_unchanged_when_neither_set() {
        assert_eq!(rewrite_prefix("k", &cfg(None, None)), "k");
    }
}
