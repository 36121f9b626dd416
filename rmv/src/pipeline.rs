//! Dual-pool execution pipeline.
//!
//! Two semaphore-bounded pools of equal size run the show: the transfer pool
//! owns the bulk phase of every task (pack + extract, or the large-file
//! move), the cleanup pool owns source deletion and cache teardown. Source
//! deletion is dispatched as soon as an archive is sealed so it overlaps the
//! extract running against the target disk; the per-task finalizer chains on
//! the delete future rather than on any lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use common::fs as cfs;
use common::progress::ProgressTracker;

use crate::archiver::{self, ArchiverSettings, ChildOutcome};
use crate::error::Error;
use crate::planner::{FileEntry, Task};
use crate::report::Reporter;
use crate::session::{CacheLayout, CompletionQueue};

/// A pack ready for execution. `resume_extract` marks a pack whose archive
/// already exists in the cache from an earlier run, so the pack phase is
/// skipped and only extract + delete remain.
#[derive(Debug, Clone)]
pub struct PackJob {
    pub task_id: String,
    pub pack_id: u32,
    pub files: Vec<FileEntry>,
    pub resume_extract: bool,
}

#[derive(Debug, Clone)]
pub struct MoveJob {
    pub task_id: String,
    pub file: FileEntry,
}

/// Work split by scheduling priority: archives already paid for extract
/// first, freeing cache space and source-disk pressure before any new
/// packing starts.
#[derive(Debug, Default)]
pub struct Jobs {
    pub resume: Vec<PackJob>,
    pub packs: Vec<PackJob>,
    pub moves: Vec<MoveJob>,
}

impl Jobs {
    pub fn len(&self) -> usize {
        self.resume.len() + self.packs.len() + self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn pending tasks into executable jobs, probing the cache for archives
/// that survived a previous run.
pub async fn jobs_from_tasks(cache: &CacheLayout, tasks: Vec<Task>) -> Jobs {
    let mut jobs = Jobs::default();
    for task in tasks {
        match task {
            Task::Pack {
                task_id,
                pack_id,
                files,
            } => {
                let archived = tokio::fs::try_exists(cache.archive_path(pack_id))
                    .await
                    .unwrap_or(false);
                let job = PackJob {
                    task_id,
                    pack_id,
                    files,
                    resume_extract: archived,
                };
                if archived {
                    jobs.resume.push(job);
                } else {
                    jobs.packs.push(job);
                }
            }
            Task::MoveLarge { task_id, file_info } => {
                jobs.moves.push(MoveJob {
                    task_id,
                    file: file_info,
                });
            }
        }
    }
    jobs
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub packs_created: u64,
    pub packs_reused: u64,
    pub large_files_moved: u64,
    pub files_transferred: u64,
    pub files_removed: u64,
    pub directories_reclaimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

#[derive(Default)]
struct Counters {
    packs_created: AtomicU64,
    packs_reused: AtomicU64,
    large_files_moved: AtomicU64,
    files_transferred: AtomicU64,
    files_removed: AtomicU64,
    directories_reclaimed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
}

/// Everything a worker needs, shared across both pools.
pub struct Context {
    pub source_root: std::path::PathBuf,
    pub dest_root: std::path::PathBuf,
    pub cache: CacheLayout,
    pub archiver: ArchiverSettings,
    pub copy_only: bool,
    pub cancel: Arc<AtomicBool>,
    pub progress: Arc<ProgressTracker>,
    pub reporter: Reporter,
    pub completions: CompletionQueue,
    transfer_slots: Arc<tokio::sync::Semaphore>,
    cleanup_slots: Arc<tokio::sync::Semaphore>,
    cleanup_tasks: std::sync::Mutex<tokio::task::JoinSet<()>>,
    // serializes credit + emission so reported percentages never reorder
    status_lock: std::sync::Mutex<()>,
    counters: Counters,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_root: std::path::PathBuf,
        dest_root: std::path::PathBuf,
        cache: CacheLayout,
        archiver: ArchiverSettings,
        copy_only: bool,
        workers: usize,
        cancel: Arc<AtomicBool>,
        progress: Arc<ProgressTracker>,
        reporter: Reporter,
        completions: CompletionQueue,
    ) -> Self {
        let workers = std::cmp::max(1, workers);
        Self {
            source_root,
            dest_root,
            cache,
            archiver,
            copy_only,
            cancel,
            progress,
            reporter,
            completions,
            transfer_slots: Arc::new(tokio::sync::Semaphore::new(workers)),
            cleanup_slots: Arc::new(tokio::sync::Semaphore::new(workers)),
            cleanup_tasks: std::sync::Mutex::new(tokio::task::JoinSet::new()),
            status_lock: std::sync::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn spawn_cleanup<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cleanup_tasks.lock().unwrap().spawn(future);
    }

    /// Credit bytes to the progress aggregator, emitting a status update when
    /// the integer percentage advanced.
    fn credit(&self, bytes: u64) {
        let _guard = self.status_lock.lock().unwrap();
        if let Some(percent) = self.progress.credit(bytes) {
            let message = format!(
                "{} / {}",
                bytesize::ByteSize(self.progress.processed_bytes()),
                bytesize::ByteSize(self.progress.total_bytes())
            );
            self.reporter.status(&message, Some(percent));
        }
    }

    /// A task failure never aborts siblings: log it, credit the task's bytes
    /// so the progress indicator stays monotone, and leave the task id out of
    /// the completed set so a later run re-attempts it.
    fn fail_task(&self, task_id: &str, bytes: u64, error: &dyn std::fmt::Display) {
        self.reporter
            .error(&format!("task {task_id} failed: {error:#}"));
        self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.credit(bytes);
    }

    fn mark_complete(&self, task_id: &str, files: u64) {
        self.completions.mark_complete(task_id);
        self.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .files_transferred
            .fetch_add(files, Ordering::Relaxed);
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            packs_created: self.counters.packs_created.load(Ordering::Relaxed),
            packs_reused: self.counters.packs_reused.load(Ordering::Relaxed),
            large_files_moved: self.counters.large_files_moved.load(Ordering::Relaxed),
            files_transferred: self.counters.files_transferred.load(Ordering::Relaxed),
            files_removed: self.counters.files_removed.load(Ordering::Relaxed),
            directories_reclaimed: self.counters.directories_reclaimed.load(Ordering::Relaxed),
            tasks_completed: self.counters.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

/// Run every job to completion (or cancellation) and drain both pools.
pub async fn execute(ctx: Arc<Context>, jobs: Jobs) -> PipelineStats {
    let mut transfer = tokio::task::JoinSet::new();
    for job in jobs.resume.into_iter().chain(jobs.packs) {
        let ctx = ctx.clone();
        transfer.spawn(run_pack_job(ctx, job));
    }
    for job in jobs.moves {
        let ctx = ctx.clone();
        transfer.spawn(run_move_job(ctx, job));
    }
    while let Some(result) = transfer.join_next().await {
        if let Err(error) = result {
            tracing::error!("transfer worker panicked: {error}");
        }
    }
    // every finalizer is registered by now; the transfer pool is gone
    let mut cleanup = std::mem::take(&mut *ctx.cleanup_tasks.lock().unwrap());
    while let Some(result) = cleanup.join_next().await {
        if let Err(error) = result {
            tracing::error!("cleanup worker panicked: {error}");
        }
    }
    ctx.stats()
}

async fn run_pack_job(ctx: Arc<Context>, job: PackJob) {
    if ctx.cancelled() {
        return;
    }
    let _permit = match ctx.transfer_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if ctx.cancelled() {
        return;
    }
    let bytes: u64 = job.files.iter().map(|file| file.size).sum();
    tracing::debug!(
        "pack {}: {} files, {} (resume_extract: {})",
        job.pack_id,
        job.files.len(),
        bytesize::ByteSize(bytes),
        job.resume_extract
    );
    if !job.resume_extract {
        match pack_phase(&ctx, &job).await {
            Ok(ChildOutcome::Completed) => {
                ctx.counters.packs_created.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ChildOutcome::Cancelled) => return,
            Err(error) => {
                ctx.fail_task(&job.task_id, bytes, &error);
                return;
            }
        }
    } else {
        ctx.counters.packs_reused.fetch_add(1, Ordering::Relaxed);
    }
    // source deletion runs against the source disk while the extract below
    // runs against the target disk; the slower leg dictates wall time
    let delete_handle = if ctx.copy_only {
        None
    } else {
        let ctx = ctx.clone();
        let files = job.files.clone();
        Some(tokio::spawn(delete_sources(ctx, files)))
    };
    match extract_phase(&ctx, &job).await {
        Ok(ChildOutcome::Completed) => {}
        Ok(ChildOutcome::Cancelled) => {
            park_delete(&ctx, delete_handle);
            return;
        }
        Err(error) => {
            // the archive stays in the cache: the next resume turns this
            // task into a plain extract
            park_delete(&ctx, delete_handle);
            ctx.fail_task(&job.task_id, bytes, &error);
            return;
        }
    }
    let finalize_ctx = ctx.clone();
    ctx.spawn_cleanup(async move {
        finalize_pack(finalize_ctx, job, delete_handle, bytes).await;
    });
}

/// Keep an already-dispatched delete future attached to the cleanup pool so
/// `execute` still waits for it when the task itself bailed out.
fn park_delete(
    ctx: &Arc<Context>,
    delete_handle: Option<tokio::task::JoinHandle<(Vec<std::path::PathBuf>, bool)>>,
) {
    if let Some(handle) = delete_handle {
        ctx.spawn_cleanup(async move {
            let _ = handle.await;
        });
    }
}

async fn pack_phase(ctx: &Context, job: &PackJob) -> Result<ChildOutcome, Error> {
    let mut lines = String::new();
    for file in &job.files {
        let relative = file
            .path
            .strip_prefix(&ctx.source_root)
            .map_err(|_| Error::IoFatal(std::io::Error::other(format!(
                "{:?} is not under source root {:?}",
                file.path, ctx.source_root
            ))))?;
        lines.push_str(&relative_line(relative));
        lines.push('\n');
    }
    let filelist = ctx.cache.filelist_path(job.pack_id);
    tokio::fs::write(&filelist, lines).await?;
    archiver::create_archive(
        &ctx.archiver,
        &ctx.source_root,
        &filelist,
        &ctx.cache.archive_path(job.pack_id),
        &ctx.cancel,
    )
    .await
}

async fn extract_phase(ctx: &Context, job: &PackJob) -> Result<ChildOutcome, Error> {
    tokio::fs::create_dir_all(&ctx.dest_root).await?;
    archiver::extract_archive(
        &ctx.archiver,
        &ctx.cache.archive_path(job.pack_id),
        &ctx.dest_root,
        &ctx.cancel,
    )
    .await
}

#[cfg(unix)]
fn relative_line(relative: &std::path::Path) -> String {
    relative.to_string_lossy().into_owned()
}

#[cfg(windows)]
fn relative_line(relative: &std::path::Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

/// Cleanup-pool job: remove the source files of a sealed pack. Returns the
/// removed paths (reclamation seeds) and whether every file is gone.
async fn delete_sources(ctx: Arc<Context>, files: Vec<FileEntry>) -> (Vec<std::path::PathBuf>, bool) {
    let _permit = match ctx.cleanup_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (Vec::new(), false),
    };
    let mut deleted = Vec::with_capacity(files.len());
    let mut all_deleted = true;
    for file in files {
        if ctx.cancelled() {
            all_deleted = false;
            break;
        }
        if cfs::remove_file_retrying(&file.path, cfs::REMOVE_ATTEMPTS, cfs::REMOVE_DELAY).await {
            deleted.push(file.path);
        } else {
            all_deleted = false;
        }
    }
    ctx.counters
        .files_removed
        .fetch_add(deleted.len() as u64, Ordering::Relaxed);
    (deleted, all_deleted)
}

/// Per-task epilogue, chained on the delete future: reclaim emptied source
/// directories, drop the cache artifacts once every source file is gone,
/// record completion, credit the task's bytes to progress. If any source
/// file survived deletion the archive is retained so a later resume can
/// extract it rather than re-pack a partially-deleted source.
async fn finalize_pack(
    ctx: Arc<Context>,
    job: PackJob,
    delete_handle: Option<tokio::task::JoinHandle<(Vec<std::path::PathBuf>, bool)>>,
    bytes: u64,
) {
    let (seeds, sources_done) = match delete_handle {
        Some(handle) => handle.await.unwrap_or((Vec::new(), false)),
        None => (Vec::new(), true),
    };
    if ctx.cancelled() && !sources_done {
        // leave the archive behind; the next resume extracts it again and
        // re-deletes whatever sources remain
        return;
    }
    let _permit = match ctx.cleanup_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if !seeds.is_empty() {
        let reclaimed = cfs::reclaim_empty_dirs(&seeds, &ctx.source_root).await;
        ctx.counters
            .directories_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
    }
    if sources_done {
        cfs::remove_file_retrying(
            &ctx.cache.archive_path(job.pack_id),
            cfs::REMOVE_ATTEMPTS,
            cfs::REMOVE_DELAY,
        )
        .await;
        cfs::remove_file_retrying(
            &ctx.cache.filelist_path(job.pack_id),
            cfs::REMOVE_ATTEMPTS,
            cfs::REMOVE_DELAY,
        )
        .await;
        ctx.mark_complete(&job.task_id, job.files.len() as u64);
    } else {
        // the task stays pending and its archive stays in the cache, so the
        // next resume extracts it again instead of re-packing source files
        // that are partially gone; counting it failed also keeps teardown
        // from wiping the cache this run
        ctx.reporter.error(&format!(
            "pack {} left undeletable source files; archive kept for resume",
            job.pack_id
        ));
        ctx.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }
    ctx.credit(bytes);
}

async fn run_move_job(ctx: Arc<Context>, job: MoveJob) {
    if ctx.cancelled() {
        return;
    }
    let _permit = match ctx.transfer_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if ctx.cancelled() {
        return;
    }
    let bytes = job.file.size;
    if let Err(error) = transfer_large(&ctx, &job).await {
        ctx.fail_task(&job.task_id, bytes, &format!("{error:#}"));
        return;
    }
    ctx.counters
        .large_files_moved
        .fetch_add(1, Ordering::Relaxed);
    let finalize_ctx = ctx.clone();
    ctx.spawn_cleanup(async move {
        finalize_move(finalize_ctx, job, bytes).await;
    });
}

async fn transfer_large(ctx: &Context, job: &MoveJob) -> Result<()> {
    let relative = job
        .file
        .path
        .strip_prefix(&ctx.source_root)
        .with_context(|| {
            format!(
                "{:?} is not under source root {:?}",
                job.file.path, ctx.source_root
            )
        })?;
    let dst = ctx.dest_root.join(relative);
    // direct tokio::fs calls below go through normalized paths like every
    // other engine syscall, so deeply nested files survive the legacy path
    // length limit
    let src_normalized = cfs::normalize(&job.file.path)?;
    let dst_normalized = cfs::normalize(&dst)?;
    if let Some(parent) = dst_normalized.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create target directory {:?}", parent))?;
    }
    tracing::debug!(
        "moving {:?} -> {:?} ({})",
        job.file.path,
        dst,
        bytesize::ByteSize(job.file.size)
    );
    if ctx.copy_only {
        cfs::copy_large_retrying(&job.file.path, &dst, cfs::COPY_ATTEMPTS, cfs::COPY_DELAY)
            .await?;
        return Ok(());
    }
    // try the cheap rename first; across devices it fails and we fall back
    // to copy-then-delete
    match tokio::fs::rename(&src_normalized, &dst_normalized).await {
        Ok(()) => Ok(()),
        Err(rename_error) => {
            tracing::debug!(
                "rename {:?} -> {:?} failed ({}), copying instead",
                job.file.path,
                dst,
                rename_error
            );
            cfs::copy_large_retrying(&job.file.path, &dst, cfs::COPY_ATTEMPTS, cfs::COPY_DELAY)
                .await?;
            if !cfs::remove_file_retrying(&job.file.path, cfs::REMOVE_ATTEMPTS, cfs::REMOVE_DELAY)
                .await
            {
                anyhow::bail!("copied {:?} but could not remove the source", job.file.path);
            }
            Ok(())
        }
    }
}

async fn finalize_move(ctx: Arc<Context>, job: MoveJob, bytes: u64) {
    let _permit = match ctx.cleanup_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if !ctx.copy_only {
        let reclaimed = cfs::reclaim_empty_dirs(
            std::slice::from_ref(&job.file.path),
            &ctx.source_root,
        )
        .await;
        ctx.counters
            .directories_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
    }
    ctx.mark_complete(&job.task_id, 1);
    ctx.credit(bytes);
}
