//! CLI entry point for objectstore-admin: garbage collection, integrity
//! checking, and remote migration.

use clap::{Parser, Subcommand};
use objectstore_core::config::load_config;
use objectstore_core::migration::MigrateConfig;
use objectstore_core::Core;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "objectstore-admin", about = "Object store maintenance tool")]
struct Cli {
    #[arg(short, long, default_value = "objectstore.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the file store against the metadata catalog.
    Gc {
        #[arg(long)]
        max_age_secs: Option<i64>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Verify object rows against the file store.
    Integrity {
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long, default_value_t = false)]
        verify_etag: bool,
        #[arg(long, default_value_t = false)]
        repair: bool,
        #[arg(long, default_value_t = 10_000)]
        limit: u64,
    },
    /// Copy objects from a remote S3-compatible bucket into this store.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Start a new migration job.
    Start {
        #[arg(long)]
        endpoint_url: String,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        source_access_key: String,
        #[arg(long)]
        source_secret_key: String,
        #[arg(long)]
        source_bucket: String,
        #[arg(long)]
        source_prefix: Option<String>,
        #[arg(long)]
        target_bucket: String,
        #[arg(long)]
        target_prefix: Option<String>,
        #[arg(long, default_value_t = false)]
        overwrite_existing: bool,
        /// Poll and print progress until the job reaches a terminal state.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Print the current progress of a job.
    Status { job_id: String },
    /// Request cooperative cancellation of a running job.
    Cancel { job_id: String },
    /// List every known job with a one-line summary each.
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rc = run(cli).await;
    std::process::exit(rc);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return 1;
        }
    };

    let core = match Core::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error initializing core: {}", e);
            return 1;
        }
    };

    match cli.command {
        Commands::Gc { max_age_secs, dry_run } => run_gc(&core, max_age_secs, dry_run),
        Commands::Integrity { bucket, verify_etag, repair, limit } => {
            run_integrity(&core, bucket, verify_etag, repair, limit)
        }
        Commands::Migrate { action } => run_migrate_action(&core, action).await,
    }
}

async fn run_migrate_action(core: &Core, action: MigrateAction) -> i32 {
    match action {
        MigrateAction::Start {
            endpoint_url,
            region,
            source_access_key,
            source_secret_key,
            source_bucket,
            source_prefix,
            target_bucket,
            target_prefix,
            overwrite_existing,
            wait,
        } => {
            run_migrate_start(
                core,
                MigrateConfig {
                    endpoint_url,
                    region,
                    source_access_key,
                    source_secret_key,
                    source_bucket,
                    source_prefix,
                    target_bucket,
                    target_prefix,
                    overwrite_existing,
                },
                wait,
            )
            .await
        }
        MigrateAction::Status { job_id } => run_migrate_status(core, &job_id),
        MigrateAction::Cancel { job_id } => run_migrate_cancel(core, &job_id),
        MigrateAction::List => run_migrate_list(core),
    }
}

fn run_gc(core: &Core, max_age_secs: Option<i64>, dry_run: bool) -> i32 {
    let max_age = max_age_secs.unwrap_or(core.config.gc.max_upload_age_secs);
    let gc = core.garbage_collector();
    match gc.run(max_age, dry_run) {
        Ok(report) => {
            println!("orphan files:       {}", report.orphan_files.len());
            println!("orphan multiparts:  {}", report.multipart_orphans.len());
            println!("expired uploads:    {}", report.expired_count());
            if !report.errors.is_empty() {
                eprintln!("errors:");
                for e in &report.errors {
                    eprintln!("  {}", e);
                }
                return 1;
            }
            0
        }
        Err(e) => {
            eprintln!("Error running gc: {}", e);
            1
        }
    }
}

fn run_integrity(core: &Core, bucket: Option<String>, verify_etag: bool, repair: bool, limit: u64) -> i32 {
    let checker = core.integrity_checker();
    let report = match checker.check(bucket.as_deref(), verify_etag, limit) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error running integrity check: {}", e);
            return 1;
        }
    };

    println!("checked:         {}", report.total_checked);
    println!("missing files:   {}", report.missing_files);
    println!("etag mismatches: {}", report.etag_mismatches);
    println!("duration:        {} ms", report.duration_ms);

    for issue in &report.issues {
        println!("  {}/{}: {:?} ({})", issue.bucket, issue.key, issue.kind, issue.detail);
    }

    if repair && !report.issues.is_empty() {
        match checker.repair(&report.issues) {
            Ok(rr) => {
                println!("repaired: {}", rr.repaired_count);
                if !rr.errors.is_empty() {
                    for e in &rr.errors {
                        eprintln!("  repair error: {}", e);
                    }
                    return 1;
                }
            }
            Err(e) => {
                eprintln!("Error repairing: {}", e);
                return 1;
            }
        }
    }

    0
}

async fn run_migrate_start(core: &Core, config: MigrateConfig, wait: bool) -> i32 {
    let job_id = match core.migrations.start_migration(config) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error starting migration: {}", e);
            return 1;
        }
    };
    println!("started job {}", job_id);

    if !wait {
        return 0;
    }

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let progress = match core.migrations.get_progress(&job_id) {
            Some(p) => p,
            None => {
                eprintln!("job {} disappeared", job_id);
                return 1;
            }
        };
        println!(
            "status={:?} completed={} skipped={} failed={} total={}",
            progress.status, progress.completed, progress.skipped, progress.failed, progress.total_objects
        );
        if progress.status.is_terminal() {
            return if matches!(progress.status, objectstore_core::migration::JobStatus::Completed) {
                0
            } else {
                1
            };
        }
    }
}

fn run_migrate_status(core: &Core, job_id: &str) -> i32 {
    match core.migrations.get_progress(job_id) {
        Some(progress) => {
            println!(
                "status={:?} completed={} skipped={} failed={} total={} transfer_size={}",
                progress.status,
                progress.completed,
                progress.skipped,
                progress.failed,
                progress.total_objects,
                progress.transfer_size
            );
            if let Some(err) = &progress.error {
                println!("error: {}", err);
            }
            for key in &progress.failed_objects {
                println!("  failed: {}", key);
            }
            0
        }
        None => {
            eprintln!("no such job: {}", job_id);
            1
        }
    }
}

fn run_migrate_cancel(core: &Core, job_id: &str) -> i32 {
    match core.migrations.cancel_migration(job_id) {
        Ok(()) => {
            println!("cancellation requested for {}", job_id);
            0
        }
        Err(e) => {
            eprintln!("Error cancelling {}: {}", job_id, e);
            1
        }
    }
}

fn run_migrate_list(core: &Core) -> i32 {
    let jobs = core.migrations.get_all_jobs();
    let stats = core.migrations.job_stats();
    for job in &jobs {
        println!(
            "{} status={:?} completed={} failed={} total={}",
            job.job_id, job.status, job.completed, job.failed, job.total_objects
        );
    }
    println!(
        "pending={} running={} completed={} failed={} cancelled={}",
        stats.pending, stats.running, stats.completed, stats.failed, stats.cancelled
    );
    0
}
