//! Configuration record consumed at engine construction.

use crate::error::Error;

/// Name of the on-source cache directory holding session state, archives and
/// file listings. Keeping it on the source volume keeps archive writes off
/// the target disk while extraction runs there.
pub const CACHE_DIR_NAME: &str = "_fast_transfer_cache_";

pub const DEFAULT_CHUNK_SIZE_LIMIT: u64 = 64 * 1024 * 1024;
pub const DEFAULT_CHUNK_FILE_LIMIT: usize = 2000;
pub const DEFAULT_SUBPROCESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
pub const DEFAULT_SUBPROCESS_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the data to migrate. Must be an existing directory.
    pub source_root: std::path::PathBuf,
    /// Directory under which `basename(source_root)` is created and populated.
    pub target_root: std::path::PathBuf,
    /// Size of each of the two worker pools, 0 means number of cores.
    pub worker_count: usize,
    /// Byte safety valve for pack size.
    pub chunk_size_limit: u64,
    /// Upper bound on files per pack when no worker-balanced target applies.
    pub chunk_file_limit: usize,
    /// Per-invocation archiver timeout.
    pub subprocess_timeout: std::time::Duration,
    /// Archiver program driven by the supervisor.
    pub archiver_program: std::path::PathBuf,
    /// Never delete source files or the source root; never create a symlink.
    pub copy_only: bool,
    /// Replace the source root with a directory symlink after teardown.
    pub create_symlink: bool,
    /// Resume from an existing session file instead of planning fresh.
    pub resume_session: bool,
}

impl Config {
    pub fn new(source_root: std::path::PathBuf, target_root: std::path::PathBuf) -> Self {
        Self {
            source_root,
            target_root,
            worker_count: 0,
            chunk_size_limit: DEFAULT_CHUNK_SIZE_LIMIT,
            chunk_file_limit: DEFAULT_CHUNK_FILE_LIMIT,
            subprocess_timeout: DEFAULT_SUBPROCESS_TIMEOUT,
            archiver_program: std::path::PathBuf::from("tar"),
            copy_only: false,
            create_symlink: false,
            resume_session: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let source_meta = std::fs::metadata(&self.source_root).map_err(|error| {
            Error::ConfigInvalid(format!(
                "source root {:?} is not accessible: {}",
                self.source_root, error
            ))
        })?;
        if !source_meta.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "source root {:?} is not a directory",
                self.source_root
            )));
        }
        if self.source_root.file_name().is_none() {
            return Err(Error::ConfigInvalid(format!(
                "source root {:?} has no basename to mirror under the target",
                self.source_root
            )));
        }
        if self.target_root == self.source_root || self.target_root.starts_with(&self.source_root)
        {
            return Err(Error::ConfigInvalid(format!(
                "target root {:?} lies inside source root {:?}",
                self.target_root, self.source_root
            )));
        }
        if self.source_root.starts_with(&self.target_root) {
            return Err(Error::ConfigInvalid(format!(
                "source root {:?} lies inside target root {:?}",
                self.source_root, self.target_root
            )));
        }
        if self.chunk_size_limit == 0 {
            return Err(Error::ConfigInvalid(
                "chunk size limit must be positive".to_string(),
            ));
        }
        if self.chunk_file_limit == 0 {
            return Err(Error::ConfigInvalid(
                "chunk file limit must be positive".to_string(),
            ));
        }
        if self.subprocess_timeout.is_zero() {
            return Err(Error::ConfigInvalid(
                "subprocess timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The worker pool size with `0 = number of cores` resolved.
    pub fn resolved_workers(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.source_root.join(CACHE_DIR_NAME)
    }

    /// The populated folder under the target: `target_root/basename(source_root)`.
    pub fn dest_root(&self) -> std::path::PathBuf {
        match self.source_root.file_name() {
            Some(name) => self.target_root.join(name),
            None => self.target_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(tmp_dir: &tempfile::TempDir) -> Config {
        let source = tmp_dir.path().join("data");
        let target = tmp_dir.path().join("volume");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        Config::new(source, target)
    }

    #[test]
    fn accepts_sane_configuration() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let config = valid_config(&tmp_dir);
        assert!(config.validate().is_ok());
        assert!(config.resolved_workers() >= 1);
        assert!(config.dest_root().ends_with("volume/data"));
    }

    #[test]
    fn rejects_missing_source() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(&tmp_dir);
        config.source_root = tmp_dir.path().join("nope");
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_target_inside_source() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(&tmp_dir);
        config.target_root = config.source_root.join("sub");
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_source_inside_target() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(&tmp_dir);
        let nested = config.target_root.join("data");
        std::fs::create_dir_all(&nested).unwrap();
        config.source_root = nested;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_zero_limits() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(&tmp_dir);
        config.chunk_size_limit = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
        let mut config = valid_config(&tmp_dir);
        config.subprocess_timeout = std::time::Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }
}
