// ============================================================
// Layer 6 — Checkpoint Discovery
// ============================================================
// Finds the checkpoints a training run has written to the model
// directory and picks the ones eval/predict should run against.
//
// File naming convention (one index file per saved step):
//   model_dir/
//     model.ckpt-0.index
//     model.ckpt-5000.index
//     model.ckpt-10000.index
//     ...
//
// Selector resolution:
//   Latest         → the highest step on disk
//   Step(s)        → the step on disk closest to s
//   Steps([..])    → closest step for each, sorted, no duplicates
//   Continuous     → not resolved here; the caller keeps calling
//                    `wait_for_next`, which skips to the newest
//                    step on disk, until it returns None
//
// Only local directories are listed. A remote model dir such as
// `gs://bucket/run` never exists locally, so it reports no steps;
// `new` warns when it sees one.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crate::domain::checkpoint::CheckpointSelector;
use crate::domain::config::CheckpointWatchConfig;
use crate::domain::traits::CheckpointSource;

const INDEX_PATTERN: &str = r"^model\.ckpt-(\d+)\.index$";

/// Checkpoints stored as files in a model directory.
#[derive(Debug, Clone)]
pub struct DirectoryCheckpoints {
    dir:           PathBuf,
    poll_interval: Duration,
    /// `None` waits forever
    timeout:       Option<Duration>,
}

impl DirectoryCheckpoints {
    pub fn new(dir: impl Into<PathBuf>, watch: &CheckpointWatchConfig) -> Self {
        let dir = dir.into();
        if looks_remote(&dir) {
            tracing::warn!(
                "Model dir '{}' looks like a remote URL; only local checkpoint files are listed, \
                 so eval/predict will find no checkpoints there",
                dir.display()
            );
        }
        Self {
            dir,
            poll_interval: Duration::from_secs(watch.poll_interval_secs),
            timeout:       watch.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// True for `scheme://...` paths that `fs` cannot list.
fn looks_remote(dir: &Path) -> bool {
    dir.to_str().is_some_and(|s| s.contains("://"))
}

impl CheckpointSource for DirectoryCheckpoints {
    fn available_steps(&self) -> Result<Vec<u64>> {
        // A model dir that does not exist yet simply has no checkpoints
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = Regex::new(INDEX_PATTERN)?;
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot list model dir '{}'", self.dir.display()))?;

        let mut steps = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(caps) = pattern.captures(name) {
                if let Ok(step) = caps[1].parse::<u64>() {
                    steps.push(step);
                }
            }
        }
        steps.sort_unstable();
        steps.dedup();
        Ok(steps)
    }

    fn wait_for_next(&self, after: Option<u64>) -> Result<Option<u64>> {
        let started = Instant::now();
        loop {
            let next = self
                .available_steps()?
                .into_iter()
                .filter(|&s| after.map_or(true, |a| s > a))
                .max();
            if next.is_some() {
                return Ok(next);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    tracing::info!(
                        "No new checkpoint in '{}' after {:?}; stopping",
                        self.dir.display(),
                        timeout
                    );
                    return Ok(None);
                }
            }
            tracing::debug!("Waiting for a checkpoint newer than {:?}", after);
            thread::sleep(self.poll_interval);
        }
    }
}

/// Resolve a fixed selector against the steps that exist.
/// `Continuous` resolves to nothing; the caller polls instead.
pub fn resolve_steps(selector: &CheckpointSelector, source: &dyn CheckpointSource) -> Result<Vec<u64>> {
    if matches!(selector, CheckpointSelector::Continuous) {
        return Ok(Vec::new());
    }

    let available = source.available_steps()?;
    if available.is_empty() {
        bail!("no checkpoints found for checkpoint selector '{selector}'");
    }

    let mut steps = match selector {
        CheckpointSelector::Latest      => available.last().copied().into_iter().collect(),
        CheckpointSelector::Step(s)     => vec![closest(&available, *s)],
        CheckpointSelector::Steps(list) => list.iter().map(|&s| closest(&available, s)).collect(),
        CheckpointSelector::Continuous  => Vec::new(),
    };
    steps.sort_unstable();
    steps.dedup();
    Ok(steps)
}

/// Closest available step; ties go to the earlier checkpoint.
/// `available` must be sorted and non-empty.
fn closest(available: &[u64], target: u64) -> u64 {
    let mut best = available[0];
    for &step in available {
        if step.abs_diff(target) < best.abs_diff(target) {
            best = step;
        }
    }
    if best != target {
        tracing::info!("Using checkpoint {best} for requested step {target}");
    }
    best
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, step: u64) {
        fs::write(dir.join(format!("model.ckpt-{step}.index")), b"").unwrap();
        fs::write(dir.join(format!("model.ckpt-{step}.data-00000-of-00001")), b"").unwrap();
    }

    fn source(dir: &Path) -> DirectoryCheckpoints {
        DirectoryCheckpoints::new(dir, &CheckpointWatchConfig::default())
            .with_poll_interval(Duration::from_millis(5))
            .with_timeout(Some(Duration::from_millis(50)))
    }

    #[test]
    fn test_lists_index_files_in_step_order() {
        let dir = tempdir().unwrap();
        for step in [10_000, 0, 5_000] {
            touch(dir.path(), step);
        }
        fs::write(dir.path().join("checkpoint"), b"").unwrap();
        assert_eq!(source(dir.path()).available_steps().unwrap(), vec![0, 5_000, 10_000]);
    }

    #[test]
    fn test_missing_dir_has_no_steps() {
        let dir = tempdir().unwrap();
        let s = source(&dir.path().join("not-yet"));
        assert!(s.available_steps().unwrap().is_empty());
    }

    #[test]
    fn test_remote_model_dir_is_detected() {
        assert!(looks_remote(Path::new("gs://bucket/models/t5")));
        assert!(!looks_remote(Path::new("/models/t5")));
        assert!(!looks_remote(Path::new("models/gs")));
        // still constructs, and reports nothing rather than failing
        let s = source(Path::new("gs://bucket/models/t5"));
        assert!(s.available_steps().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_matches_closest_and_dedups() {
        let dir = tempdir().unwrap();
        for step in [1_000, 2_000, 3_000] {
            touch(dir.path(), step);
        }
        let s = source(dir.path());
        let steps = resolve_steps(&CheckpointSelector::Steps(vec![2_900, 1_100, 3_000]), &s).unwrap();
        assert_eq!(steps, vec![1_000, 3_000]);
        assert_eq!(resolve_steps(&CheckpointSelector::Step(1_400), &s).unwrap(), vec![1_000]);
        assert_eq!(resolve_steps(&CheckpointSelector::Latest, &s).unwrap(), vec![3_000]);
        assert!(resolve_steps(&CheckpointSelector::Continuous, &s).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_without_checkpoints_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(resolve_steps(&CheckpointSelector::Latest, &source(dir.path())).is_err());
    }

    #[test]
    fn test_wait_returns_newest_step() {
        let dir = tempdir().unwrap();
        touch(dir.path(), 100);
        touch(dir.path(), 200);
        let s = source(dir.path());
        assert_eq!(s.wait_for_next(None).unwrap(), Some(200));
        assert_eq!(s.wait_for_next(Some(100)).unwrap(), Some(200));
        assert_eq!(s.wait_for_next(Some(200)).unwrap(), None);
    }

    #[test]
    fn test_wait_times_out() {
        let dir = tempdir().unwrap();
        touch(dir.path(), 100);
        assert_eq!(source(dir.path()).wait_for_next(Some(100)).unwrap(), None);
    }
}
