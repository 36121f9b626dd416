//! Supervisor for the external archiver child process.
//!
//! The archiver is the bulk-IO engine: it aggregates many small files into a
//! store-mode archive on the source volume and extracts archives on the
//! target volume. Children run with a per-invocation timeout; timeouts are
//! retried, deterministic failures are not. Every live child is registered in
//! a global registry so `stop()` can kill them from any thread.
//!
//! The default archiver is `tar`, which is single-threaded. That is a
//! deliberate trade-off: a store-format archive is IO-bound, and the
//! pipeline already runs up to one archiver child per worker concurrently,
//! so parallelism lives at the pool level rather than inside a single
//! child. A tool with in-child threading (7-Zip style) can be substituted
//! through the configurable program, at the cost of adapting the argv
//! builders below.
//!
//! Paths handed to the child stay in raw form; archivers generally do not
//! tolerate the Windows long-path sentinel.

use crate::error::Error;

/// Extension of the store-mode archives produced in the cache directory.
pub const ARCHIVE_EXT: &str = "tar";

#[derive(Debug, Clone)]
pub struct ArchiverSettings {
    pub program: std::path::PathBuf,
    pub timeout: std::time::Duration,
    pub retries: u32,
}

/// Result of a supervised child run that did not error.
#[derive(Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    Completed,
    Cancelled,
}

lazy_static::lazy_static! {
    static ref ACTIVE_CHILDREN: std::sync::Mutex<std::collections::HashSet<u32>> =
        std::sync::Mutex::new(std::collections::HashSet::new());
}

fn register_child(pid: u32) {
    ACTIVE_CHILDREN.lock().unwrap().insert(pid);
}

fn unregister_child(pid: u32) {
    ACTIVE_CHILDREN.lock().unwrap().remove(&pid);
}

/// Forcibly kill every registered child. Safe to call from any thread; used
/// by the cooperative stop path to unblock workers waiting on child exit.
pub fn kill_registered_children() {
    let pids: Vec<u32> = ACTIVE_CHILDREN.lock().unwrap().iter().copied().collect();
    for pid in pids {
        tracing::debug!("killing archiver child {pid}");
        kill_pid(pid);
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

#[cfg(windows)]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}

/// Spawn `program args` in `cwd`, capture its output and wait up to
/// `timeout`. The child is registered for the duration of the wait so a
/// concurrent stop can kill it. When the cancel flag is observed the call
/// resolves to [`ChildOutcome::Cancelled`] instead of an error.
pub async fn run_child(
    program: &std::path::Path,
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    timeout: std::time::Duration,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<ChildOutcome, Error> {
    if cancel.load(std::sync::atomic::Ordering::Acquire) {
        return Ok(ChildOutcome::Cancelled);
    }
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW, the child must not flash a console
        use std::os::windows::process::CommandExt;
        command.creation_flags(0x0800_0000);
    }
    let child = command.spawn()?;
    let pid = child.id();
    if let Some(pid) = pid {
        register_child(pid);
    }
    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    if let Some(pid) = pid {
        unregister_child(pid);
    }
    match waited {
        // dropping the timed-out future reaps the child via kill_on_drop
        Err(_elapsed) => {
            if cancel.load(std::sync::atomic::Ordering::Acquire) {
                Ok(ChildOutcome::Cancelled)
            } else {
                tracing::debug!("archiver {:?} timed out after {:?}", program, timeout);
                Err(Error::Timeout(timeout))
            }
        }
        Ok(Err(error)) => Err(error.into()),
        Ok(Ok(output)) => {
            if cancel.load(std::sync::atomic::Ordering::Acquire) {
                return Ok(ChildOutcome::Cancelled);
            }
            if output.status.success() {
                Ok(ChildOutcome::Completed)
            } else {
                Err(Error::NonZeroExit {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

/// Run a child, retrying timeouts only. A non-zero exit is deterministic and
/// re-raised immediately.
pub async fn run_child_with_retry(
    settings: &ArchiverSettings,
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<ChildOutcome, Error> {
    let attempts = std::cmp::max(1, settings.retries);
    let mut last_timeout = Error::Timeout(settings.timeout);
    for attempt in 1..=attempts {
        match run_child(&settings.program, args, cwd, settings.timeout, cancel).await {
            Err(Error::Timeout(timeout)) => {
                tracing::warn!(
                    "archiver attempt {}/{} timed out after {:?}",
                    attempt,
                    attempts,
                    timeout
                );
                last_timeout = Error::Timeout(timeout);
            }
            other => return other,
        }
    }
    Err(last_timeout)
}

/// Create a store-mode archive at `archive` whose entries are the
/// source-relative paths listed in `filelist`. The child runs with
/// `cwd = source_root` so entry names resolve against the source tree.
///
/// No threading flag is passed: `tar` has none, and concurrent create
/// children across the transfer pool carry the parallelism instead (see the
/// module docs).
pub async fn create_archive(
    settings: &ArchiverSettings,
    source_root: &std::path::Path,
    filelist: &std::path::Path,
    archive: &std::path::Path,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<ChildOutcome, Error> {
    let args: Vec<std::ffi::OsString> = vec![
        "-c".into(),
        "-f".into(),
        archive.as_os_str().to_owned(),
        "-T".into(),
        filelist.as_os_str().to_owned(),
    ];
    run_child_with_retry(settings, &args, source_root, cancel).await
}

/// Extract `archive` into `dest_dir`, overwriting existing entries. Like
/// create, extraction is single-threaded per child and parallel across
/// children.
pub async fn extract_archive(
    settings: &ArchiverSettings,
    archive: &std::path::Path,
    dest_dir: &std::path::Path,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<ChildOutcome, Error> {
    let args: Vec<std::ffi::OsString> = vec![
        "-x".into(),
        "-f".into(),
        archive.as_os_str().to_owned(),
        "-C".into(),
        dest_dir.as_os_str().to_owned(),
    ];
    run_child_with_retry(settings, &args, dest_dir, cancel).await
}
