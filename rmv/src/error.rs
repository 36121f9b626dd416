//! Error kinds that drive retry and propagation decisions.
//!
//! Transient IO errors never surface here; the filesystem primitives retry
//! them internally and only the exhausted form escapes as [`Error::IoFatal`].

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The archiver child exceeded its per-invocation timeout. Retried by the
    /// supervisor; surfaces only after retries are exhausted.
    #[error("archiver timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The archiver child exited with a failure status. Deterministic, never
    /// retried.
    #[error("archiver exited with status {code:?}\nstdout: {stdout}\nstderr: {stderr}")]
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// An IO operation failed after the primitive-level retries ran out.
    #[error("io error: {0}")]
    IoFatal(#[from] std::io::Error),

    /// The stored session does not describe the requested migration.
    #[error("stored session rejected: {0}")]
    PlanRejected(String),

    /// Cooperative stop was requested.
    #[error("migration cancelled")]
    Cancelled,

    /// The configuration record failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Directory symlink creation was refused by the OS.
    #[error("privilege denied: {0}")]
    PrivilegeDenied(String),
}
