//! Two-phase planner: walk and size the source tree, classify files into
//! individually-moved large files and packable small files, then partition
//! the small files into balanced, shuffled chunks.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;

use crate::config::Config;

/// Lower clamp of the dynamic large-file threshold.
pub const LARGE_FILE_FLOOR: u64 = 16 * 1024 * 1024;
/// Upper clamp of the dynamic large-file threshold.
pub const LARGE_FILE_CEILING: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileEntry {
    pub path: std::path::PathBuf,
    pub size: u64,
}

/// A unit of resumable work. Pack tasks aggregate small files into one
/// archive; move tasks transfer one large file directly. Task ids are opaque
/// and stable across runs; pack ids are dense from 1 and name the archive
/// artifacts in the cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Pack {
        task_id: String,
        pack_id: u32,
        files: Vec<FileEntry>,
    },
    MoveLarge {
        task_id: String,
        file_info: FileEntry,
    },
}

impl Task {
    pub fn task_id(&self) -> &str {
        match self {
            Task::Pack { task_id, .. } => task_id,
            Task::MoveLarge { task_id, .. } => task_id,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            Task::Pack { files, .. } => files.iter().map(|file| file.size).sum(),
            Task::MoveLarge { file_info, .. } => file_info.size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub source_root: std::path::PathBuf,
    pub target_root: std::path::PathBuf,
    pub total_bytes: u64,
    pub tasks: Vec<Task>,
}

/// Pick the large-file cutoff for this tree:
/// `clamp(min(avg * 10, 256 MiB), 16 MiB, 256 MiB)`. Ten times the average
/// separates "a few big outliers" from the bulk without fixed tuning.
pub fn compute_threshold(total_bytes: u64, file_count: usize) -> u64 {
    if file_count == 0 {
        return LARGE_FILE_FLOOR;
    }
    let average = total_bytes / file_count as u64;
    average
        .saturating_mul(10)
        .min(LARGE_FILE_CEILING)
        .max(LARGE_FILE_FLOOR)
}

/// Partition the (already shuffled) small-file list into chunks. The primary
/// rule is the balanced per-worker file count; the byte limit is a safety
/// valve so one chunk never grows into a disk-filling archive. With no
/// workers to balance against, `chunk_file_limit` caps chunks instead.
pub fn chunk_small_files(
    files: Vec<FileEntry>,
    workers: usize,
    chunk_size_limit: u64,
    chunk_file_limit: usize,
) -> Vec<Vec<FileEntry>> {
    if files.is_empty() {
        return Vec::new();
    }
    let ideal_per_pack = if workers > 0 {
        std::cmp::max(1, files.len().div_ceil(workers))
    } else {
        std::cmp::max(1, chunk_file_limit)
    };
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;
    for file in files {
        let over_size = current_bytes.saturating_add(file.size) > chunk_size_limit;
        if !current.is_empty() && (current.len() >= ideal_per_pack || over_size) {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Enumerate every regular file under `source_root`, skipping the cache
/// directory. Files that vanish mid-scan and dangling symlinks are skipped
/// silently; a tree mutating under us is not an error.
async fn scan_tree(
    source_root: &std::path::Path,
    cache_dir: &std::path::Path,
) -> Result<(Vec<FileEntry>, u64)> {
    let mut files = Vec::new();
    let mut total_bytes = 0u64;
    let mut stack = vec![source_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if dir == source_root => {
                return Err(error)
                    .with_context(|| format!("cannot enumerate source root {:?}", source_root));
            }
            Err(error) => {
                tracing::warn!("skipping unreadable directory {:?}: {}", dir, error);
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!("error traversing {:?}: {}", dir, error);
                    break;
                }
            };
            let path = entry.path();
            if path.starts_with(cache_dir) {
                continue;
            }
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                // vanished between readdir and stat
                Err(_) => continue,
            };
            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                total_bytes += metadata.len();
                files.push(FileEntry {
                    path,
                    size: metadata.len(),
                });
            }
        }
    }
    Ok((files, total_bytes))
}

fn fresh_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build the full migration plan for a fresh run.
pub async fn build_plan(config: &Config) -> Result<Plan> {
    let (files, total_bytes) = scan_tree(&config.source_root, &config.cache_dir()).await?;
    let threshold = compute_threshold(total_bytes, files.len());
    tracing::debug!(
        "scanned {} files ({}), large-file threshold {}",
        files.len(),
        bytesize::ByteSize(total_bytes),
        bytesize::ByteSize(threshold)
    );
    let (large, mut small): (Vec<FileEntry>, Vec<FileEntry>) =
        files.into_iter().partition(|file| file.size >= threshold);
    // mixing directories within each pack spreads concurrent reads across the
    // tree instead of hammering one directory per worker
    small.shuffle(&mut rand::thread_rng());
    let chunks = chunk_small_files(
        small,
        config.resolved_workers(),
        config.chunk_size_limit,
        config.chunk_file_limit,
    );
    let mut tasks = Vec::with_capacity(chunks.len() + large.len());
    for (index, files) in chunks.into_iter().enumerate() {
        tasks.push(Task::Pack {
            task_id: fresh_task_id(),
            pack_id: index as u32 + 1,
            files,
        });
    }
    for file_info in large {
        tasks.push(Task::MoveLarge {
            task_id: fresh_task_id(),
            file_info,
        });
    }
    Ok(Plan {
        source_root: config.source_root.clone(),
        target_root: config.target_root.clone(),
        total_bytes,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    fn entries(sizes: &[u64]) -> Vec<FileEntry> {
        sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| FileEntry {
                path: std::path::PathBuf::from(format!("/data/file{index}")),
                size,
            })
            .collect()
    }

    #[test]
    fn threshold_clamps_to_floor_for_small_averages() {
        // 1000 x 100 KiB plus 3 x 500 MiB: the average keeps the threshold at
        // the 16 MiB floor, which only the 500 MiB files exceed
        let total = 1000 * 100 * KIB + 3 * 500 * MIB;
        let threshold = compute_threshold(total, 1003);
        assert_eq!(threshold, LARGE_FILE_FLOOR);
        assert!(500 * MIB >= threshold);
        assert!(100 * KIB < threshold);
    }

    #[test]
    fn threshold_clamps_to_ceiling_for_huge_averages() {
        let threshold = compute_threshold(100 * 1024 * MIB, 10);
        assert_eq!(threshold, LARGE_FILE_CEILING);
    }

    #[test]
    fn threshold_scales_between_clamps() {
        // avg 2 MiB -> 20 MiB threshold
        let threshold = compute_threshold(20 * MIB, 10);
        assert_eq!(threshold, 20 * MIB);
    }

    #[test]
    fn threshold_of_empty_tree_is_floor() {
        assert_eq!(compute_threshold(0, 0), LARGE_FILE_FLOOR);
    }

    #[test]
    fn chunking_balances_file_counts_across_workers() {
        let files = entries(&vec![0; 20_000]);
        let chunks = chunk_small_files(files, 8, 64 * MIB, 2000);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|chunk| chunk.len() == 2500));
    }

    #[test]
    fn chunking_respects_byte_safety_valve() {
        let files = entries(&vec![30 * MIB; 10]);
        let chunks = chunk_small_files(files, 2, 64 * MIB, 2000);
        // the balanced target of 5 per chunk would blow past 64 MiB
        assert!(chunks.iter().all(|chunk| chunk.len() <= 2));
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn oversized_file_still_forms_its_own_chunk() {
        let files = entries(&[100 * MIB, KIB, KIB]);
        let chunks = chunk_small_files(files, 1, 64 * MIB, 2000);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(chunks[0][0].size, 100 * MIB);
    }

    #[test]
    fn chunk_file_limit_caps_only_the_workerless_fallback() {
        let files = entries(&vec![0; 100]);
        let chunks = chunk_small_files(files, 0, 64 * MIB, 30);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 30));
        // with workers configured the balanced target wins over the cap
        let files = entries(&vec![0; 100]);
        let chunks = chunk_small_files(files, 2, 64 * MIB, 30);
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn plan_covers_every_file_once_and_skips_cache() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let source = tmp_dir.path().join("data");
        let target = tmp_dir.path().join("volume");
        tokio::fs::create_dir_all(source.join("a").join("b")).await?;
        tokio::fs::create_dir_all(&target).await?;
        let mut expected = std::collections::BTreeSet::new();
        for (name, content) in [
            ("a/one.bin", "1"),
            ("a/two.bin", "22"),
            ("a/b/three.bin", "333"),
            ("four.bin", "4444"),
        ] {
            let path = source.join(name);
            tokio::fs::write(&path, content).await?;
            expected.insert(path);
        }
        // cache leftovers must never be planned
        let cache = source.join(crate::config::CACHE_DIR_NAME);
        tokio::fs::create_dir_all(&cache).await?;
        tokio::fs::write(cache.join("pack_1.tar"), b"stale").await?;
        let mut config = Config::new(source, target);
        config.worker_count = 2;
        let plan = build_plan(&config).await?;
        assert_eq!(plan.total_bytes, 10);
        let mut planned = std::collections::BTreeSet::new();
        for task in &plan.tasks {
            match task {
                Task::Pack { files, .. } => {
                    for file in files {
                        assert!(planned.insert(file.path.clone()), "duplicate {:?}", file);
                    }
                }
                Task::MoveLarge { file_info, .. } => {
                    assert!(planned.insert(file_info.path.clone()));
                }
            }
        }
        assert_eq!(planned, expected);
        // dense pack ids from 1
        let pack_ids: Vec<u32> = plan
            .tasks
            .iter()
            .filter_map(|task| match task {
                Task::Pack { pack_id, .. } => Some(*pack_id),
                Task::MoveLarge { .. } => None,
            })
            .collect();
        assert_eq!(pack_ids, (1..=pack_ids.len() as u32).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_source_root_is_fatal() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let source = tmp_dir.path().join("missing");
        let config = Config::new(source, tmp_dir.path().join("volume"));
        assert!(build_plan(&config).await.is_err());
    }
}
