//! Durable session state and the batched atomic writer.
//!
//! The session file is the crash log of a migration: the stored plan plus the
//! set of task ids whose effects are known to have landed. Completions are
//! funneled through an unbounded queue to a single writer task that batches
//! them on a five-second cadence and replaces the file atomically, keeping
//! write amplification proportional to run duration instead of task count.

use anyhow::{Context, Result};

use crate::archiver::ARCHIVE_EXT;
use crate::config::CACHE_DIR_NAME;
use crate::error::Error;
use crate::planner::{Plan, Task};

pub const SESSION_FILE_NAME: &str = "transfer_session.json";
/// Minimum spacing between two session rewrites.
pub const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
/// Queue poll granularity; bounds how late a flush can be observed.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Paths of everything the engine keeps inside `<source_root>/_fast_transfer_cache_/`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: std::path::PathBuf,
}

impl CacheLayout {
    pub fn new(source_root: &std::path::Path) -> Self {
        Self {
            root: source_root.join(CACHE_DIR_NAME),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn session_file(&self) -> std::path::PathBuf {
        self.root.join(SESSION_FILE_NAME)
    }

    fn session_tmp_file(&self) -> std::path::PathBuf {
        self.root.join(format!("{SESSION_FILE_NAME}.tmp"))
    }

    pub fn archive_path(&self, pack_id: u32) -> std::path::PathBuf {
        self.root.join(format!("pack_{pack_id}.{ARCHIVE_EXT}"))
    }

    pub fn filelist_path(&self, pack_id: u32) -> std::path::PathBuf {
        self.root.join(format!("filelist_{pack_id}.txt"))
    }

    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("cannot create cache directory {:?}", self.root))
    }

    /// Drop leftovers of an abandoned session so a fresh plan can never pick
    /// up another run's archives.
    pub async fn clear_stale_artifacts(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("cannot enumerate cache directory {:?}", self.root));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing cache directory {:?}", self.root))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("pack_")
                || name.starts_with("filelist_")
                || name.starts_with(SESSION_FILE_NAME)
            {
                tracing::debug!("clearing stale cache artifact {:?}", entry.path());
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

/// The persisted form of a migration session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionState {
    pub source_dir: std::path::PathBuf,
    pub target_dir: std::path::PathBuf,
    pub total_transfer_size: u64,
    pub task_plan: Vec<Task>,
    pub completed_task_ids: Vec<String>,
}

impl SessionState {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            source_dir: plan.source_root.clone(),
            target_dir: plan.target_root.clone(),
            total_transfer_size: plan.total_bytes,
            task_plan: plan.tasks.clone(),
            completed_task_ids: Vec::new(),
        }
    }
}

/// Write `state` to the session file via temp-file-then-rename.
pub async fn write_state(cache: &CacheLayout, state: &SessionState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("cannot serialize session state")?;
    let tmp = cache.session_tmp_file();
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("cannot write session file {:?}", tmp))?;
    tokio::fs::rename(&tmp, cache.session_file())
        .await
        .with_context(|| format!("cannot replace session file {:?}", cache.session_file()))?;
    Ok(())
}

/// What a resume request recovered from the cache.
#[derive(Debug)]
pub struct RecoveredSession {
    /// The full stored state, fed back to the writer so the plan survives
    /// further rewrites.
    pub state: SessionState,
    /// Bytes belonging to already-completed tasks, folded into the progress
    /// baseline for continuity.
    pub completed_bytes: u64,
    /// Tasks still to execute.
    pub pending: Vec<Task>,
}

/// Load and validate the stored session for a resume request. The stored
/// roots must match the caller's; any mismatch rejects the session and the
/// caller falls back to a fresh run.
pub async fn load_for_resume(
    cache: &CacheLayout,
    source_root: &std::path::Path,
    target_root: &std::path::Path,
) -> Result<RecoveredSession, Error> {
    let raw = tokio::fs::read(cache.session_file()).await?;
    let state: SessionState = serde_json::from_slice(&raw)
        .map_err(|error| Error::PlanRejected(format!("session file unreadable: {error}")))?;
    if state.source_dir != source_root {
        return Err(Error::PlanRejected(format!(
            "stored source {:?} does not match requested {:?}",
            state.source_dir, source_root
        )));
    }
    if state.target_dir != target_root {
        return Err(Error::PlanRejected(format!(
            "stored target {:?} does not match requested {:?}",
            state.target_dir, target_root
        )));
    }
    let completed: std::collections::HashSet<&str> = state
        .completed_task_ids
        .iter()
        .map(String::as_str)
        .collect();
    let mut completed_bytes = 0u64;
    let mut pending = Vec::new();
    for task in &state.task_plan {
        if completed.contains(task.task_id()) {
            completed_bytes += task.total_bytes();
        } else {
            pending.push(task.clone());
        }
    }
    Ok(RecoveredSession {
        state,
        completed_bytes,
        pending,
    })
}

/// Clonable sender half of the completion queue.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: tokio::sync::mpsc::UnboundedSender<Option<String>>,
}

impl CompletionQueue {
    pub fn mark_complete(&self, task_id: &str) {
        // a closed queue means the writer already shut down; nothing to record
        let _ = self.tx.send(Some(task_id.to_string()));
    }
}

/// Single-threaded owner of the completed set. Spawned once per run; consumes
/// completions until the shutdown sentinel, flushing at most once per
/// [`FLUSH_INTERVAL`] plus a final flush on shutdown.
pub struct SessionWriter {
    queue: CompletionQueue,
    handle: tokio::task::JoinHandle<Result<u64>>,
}

impl SessionWriter {
    pub fn spawn(cache: CacheLayout, state: SessionState) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_loop(cache, state, rx));
        Self {
            queue: CompletionQueue { tx },
            handle,
        }
    }

    pub fn queue(&self) -> CompletionQueue {
        self.queue.clone()
    }

    /// Send the shutdown sentinel and wait for the final flush. Returns the
    /// number of session rewrites performed.
    pub async fn shutdown(self) -> Result<u64> {
        let _ = self.queue.tx.send(None);
        self.handle.await.context("session writer panicked")?
    }
}

async fn writer_loop(
    cache: CacheLayout,
    state: SessionState,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Option<String>>,
) -> Result<u64> {
    let mut completed: std::collections::HashSet<String> =
        state.completed_task_ids.iter().cloned().collect();
    let mut dirty = false;
    let mut flushes = 0u64;
    let mut last_flush = tokio::time::Instant::now();
    loop {
        let shutdown = match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
            Ok(Some(Some(task_id))) => {
                completed.insert(task_id);
                dirty = true;
                false
            }
            Ok(Some(None)) | Ok(None) => true,
            Err(_elapsed) => false,
        };
        if shutdown {
            break;
        }
        if dirty && last_flush.elapsed() >= FLUSH_INTERVAL {
            flush(&cache, &state, &completed).await?;
            flushes += 1;
            dirty = false;
            last_flush = tokio::time::Instant::now();
        }
    }
    if dirty {
        flush(&cache, &state, &completed).await?;
        flushes += 1;
    }
    tracing::debug!(
        "session writer exiting after {} flushes, {} tasks complete",
        flushes,
        completed.len()
    );
    Ok(flushes)
}

async fn flush(
    cache: &CacheLayout,
    fallback: &SessionState,
    completed: &std::collections::HashSet<String>,
) -> Result<()> {
    // re-read the stored plan and only replace the completed set; if the file
    // is gone or mangled, re-synthesize from the in-memory plan
    let mut state = match tokio::fs::read(cache.session_file()).await {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|error| {
            tracing::warn!("session file corrupt, re-synthesizing: {}", error);
            fallback.clone()
        }),
        Err(_) => fallback.clone(),
    };
    let mut ids: Vec<String> = completed.iter().cloned().collect();
    ids.sort_unstable();
    state.completed_task_ids = ids;
    write_state(cache, &state).await
}
