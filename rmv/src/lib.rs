//! `rmv` - high-throughput cross-volume directory migration.
//!
//! Given a source directory tree and a target directory tree on a different
//! physical volume, `rmv` moves (or copies) every regular file so the target
//! mirrors the source layout, then optionally removes the emptied source and
//! replaces it with a directory symlink. The work is planned into resumable
//! tasks: small files are aggregated into store-mode archives created and
//! extracted by an external archiver, large files are moved individually.
//!
//! The interesting part is the overlap. Packing reads the source disk,
//! extraction writes the target disk, and source deletion touches only the
//! source again - so the engine runs them on two worker pools at once and
//! keeps both spindles busy instead of serializing three IO phases.
//!
//! Every task completion is recorded in a session file inside the on-source
//! cache directory. An interrupted migration restarts exactly where it
//! stopped, and archives that were already paid for are extracted first.
//!
//! # Library usage
//!
//! ```no_run
//! use rmv::{Config, Engine, Reporter};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = Config::new("/mnt/ssd/projects".into(), "/mnt/hdd/archive".into());
//! config.worker_count = 8;
//! let engine = Engine::new(config, Reporter::new())?;
//! let summary = engine.run().await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod archiver;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod session;

pub use config::Config;
pub use engine::{Engine, MigrateSummary};
pub use error::Error;
pub use report::{Reporter, Verbosity};
