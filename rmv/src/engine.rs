//! Engine lifecycle: plan or resume, execute, tear down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use common::fs as cfs;
use common::progress::ProgressTracker;

use crate::archiver::{self, ArchiverSettings};
use crate::config::{Config, DEFAULT_SUBPROCESS_RETRIES};
use crate::error::Error;
use crate::pipeline::{self, PipelineStats};
use crate::planner;
use crate::report::Reporter;
use crate::session::{self, CacheLayout, SessionState, SessionWriter};

/// Outcome counters of a finished run.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrateSummary {
    pub packs_created: u64,
    pub packs_reused: u64,
    pub large_files_moved: u64,
    pub files_transferred: u64,
    pub files_removed: u64,
    pub directories_reclaimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub bytes_total: u64,
    pub symlink_created: bool,
    pub duration: std::time::Duration,
}

impl MigrateSummary {
    fn from_stats(stats: PipelineStats) -> Self {
        Self {
            packs_created: stats.packs_created,
            packs_reused: stats.packs_reused,
            large_files_moved: stats.large_files_moved,
            files_transferred: stats.files_transferred,
            files_removed: stats.files_removed,
            directories_reclaimed: stats.directories_reclaimed,
            tasks_completed: stats.tasks_completed,
            tasks_failed: stats.tasks_failed,
            ..Default::default()
        }
    }
}

impl std::fmt::Display for MigrateSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "packs created: {}\n\
            packs reused: {}\n\
            large files moved: {}\n\
            files transferred: {}\n\
            source files removed: {}\n\
            directories reclaimed: {}\n\
            tasks completed: {}\n\
            tasks failed: {}\n\
            total size: {}\n\
            duration: {:.2}s",
            self.packs_created,
            self.packs_reused,
            self.large_files_moved,
            self.files_transferred,
            self.files_removed,
            self.directories_reclaimed,
            self.tasks_completed,
            self.tasks_failed,
            bytesize::ByteSize(self.bytes_total),
            self.duration.as_secs_f64(),
        )
    }
}

/// The migration engine. Construct once, [`run`](Engine::run) once; `stop`
/// may be called from any thread to request cooperative cancellation.
pub struct Engine {
    config: Config,
    reporter: Reporter,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config, reporter: Reporter) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            reporter,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Request cancellation: raise the flag, then kill every registered
    /// archiver child so blocked workers wake up promptly. `run()` must still
    /// be awaited; it drains both pools before returning.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
        archiver::kill_registered_children();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub async fn run(&self) -> Result<MigrateSummary> {
        let started = std::time::Instant::now();
        let cache = CacheLayout::new(&self.config.source_root);
        cache.prepare().await?;
        let (state, completed_bytes, pending) = self.load_or_plan(&cache).await?;
        let total_tasks = state.task_plan.len();
        let progress = Arc::new(ProgressTracker::new(state.total_transfer_size));
        let bytes_total = state.total_transfer_size;
        if completed_bytes > 0 {
            if let Some(percent) = progress.credit(completed_bytes) {
                self.reporter.status(
                    &format!(
                        "resuming: {} of {} tasks already complete",
                        total_tasks - pending.len(),
                        total_tasks
                    ),
                    Some(percent),
                );
            }
        }
        tokio::fs::create_dir_all(self.config.dest_root())
            .await
            .with_context(|| {
                format!("cannot create target directory {:?}", self.config.dest_root())
            })?;
        let writer = SessionWriter::spawn(cache.clone(), state);
        let jobs = pipeline::jobs_from_tasks(&cache, pending).await;
        self.reporter.info(&format!(
            "executing {} tasks ({} resumed archives)",
            jobs.len(),
            jobs.resume.len()
        ));
        let ctx = Arc::new(pipeline::Context::new(
            self.config.source_root.clone(),
            self.config.dest_root(),
            cache.clone(),
            ArchiverSettings {
                program: self.config.archiver_program.clone(),
                timeout: self.config.subprocess_timeout,
                retries: DEFAULT_SUBPROCESS_RETRIES,
            },
            self.config.copy_only,
            self.config.resolved_workers(),
            self.cancel.clone(),
            progress,
            self.reporter.clone(),
            writer.queue(),
        ));
        let stats = pipeline::execute(ctx, jobs).await;
        // join the writer before touching the cache so the last batch lands
        let flushes = writer.shutdown().await?;
        tracing::debug!("session writer performed {} flushes", flushes);
        let mut summary = MigrateSummary::from_stats(stats);
        summary.bytes_total = bytes_total;
        if self.is_cancelled() {
            self.reporter.status("migration cancelled", None);
            summary.duration = started.elapsed();
            return Err(Error::Cancelled.into());
        }
        if stats.tasks_failed > 0 {
            self.reporter.status(
                &format!(
                    "migration finished with {} failed tasks; run again to retry",
                    stats.tasks_failed
                ),
                None,
            );
            summary.duration = started.elapsed();
            return Ok(summary);
        }
        summary.symlink_created = self.teardown(&cache).await?;
        summary.duration = started.elapsed();
        self.reporter.status("migration complete", Some(100));
        Ok(summary)
    }

    /// Recover the stored session when resuming, otherwise plan fresh. A
    /// rejected or unreadable session falls back to a fresh run.
    async fn load_or_plan(
        &self,
        cache: &CacheLayout,
    ) -> Result<(SessionState, u64, Vec<planner::Task>)> {
        if self.config.resume_session {
            match session::load_for_resume(
                cache,
                &self.config.source_root,
                &self.config.target_root,
            )
            .await
            {
                Ok(recovered) => {
                    self.reporter.info(&format!(
                        "resuming stored session: {} tasks pending",
                        recovered.pending.len()
                    ));
                    return Ok((recovered.state, recovered.completed_bytes, recovered.pending));
                }
                Err(Error::PlanRejected(reason)) => {
                    self.reporter
                        .error(&format!("stored session rejected ({reason}), planning fresh"));
                }
                Err(error) => {
                    self.reporter
                        .info(&format!("no resumable session ({error}), planning fresh"));
                }
            }
        }
        cache.clear_stale_artifacts().await?;
        self.reporter.status("scanning source tree", None);
        let plan = planner::build_plan(&self.config)
            .await
            .context("cannot plan migration")?;
        self.reporter.info(&format!(
            "planned {} tasks, {} total",
            plan.tasks.len(),
            bytesize::ByteSize(plan.total_bytes)
        ));
        let state = SessionState::from_plan(&plan);
        session::write_state(cache, &state)
            .await
            .context("cannot persist fresh session")?;
        let pending = state.task_plan.clone();
        Ok((state, 0, pending))
    }

    /// Final teardown after a fully successful run: drop the cache, remove
    /// the source root (unless copy-only), optionally leave a directory
    /// symlink in its place. Returns whether a symlink was created.
    async fn teardown(&self, cache: &CacheLayout) -> Result<bool> {
        self.reporter.debug("removing cache directory");
        cfs::remove_tree_native(cache.root())
            .await
            .context("cannot remove cache directory")?;
        if self.config.copy_only {
            return Ok(false);
        }
        self.reporter.debug("removing migrated source root");
        cfs::remove_tree_native(&self.config.source_root)
            .await
            .context("cannot remove migrated source root")?;
        if !self.config.create_symlink {
            return Ok(false);
        }
        // the source root is gone, so its original name is free for the link
        match cfs::make_dir_symlink(&self.config.dest_root(), &self.config.source_root).await {
            Ok(()) => {
                self.reporter.info(&format!(
                    "replaced {:?} with a symlink to {:?}",
                    self.config.source_root,
                    self.config.dest_root()
                ));
                Ok(true)
            }
            Err(error) => {
                // no recovery attempted: the data is safe at the target, only
                // the convenience link is missing
                let error = if error.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PrivilegeDenied(format!(
                        "creating directory symlinks requires elevation: {error}"
                    ))
                } else {
                    Error::IoFatal(error)
                };
                self.reporter
                    .error(&format!("could not create symlink: {error}"));
                Ok(false)
            }
        }
    }
}
