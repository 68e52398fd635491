//! Cgroup v2 accounting and scoping.
//!
//! Two roles: best-effort usage reads (`memory.peak`, `memory.events`,
//! `pids.events`, `cpu.stat`) for result accounting and exit
//! classification, and an owned child scope for the syscall-filter tier
//! so its limits are hard cgroup ceilings rather than rlimits alone.
//!
//! All reads are bounded and fail-safe: a missing or unreadable file
//! yields `None` for that field, never an error - stats must not be able
//! to fail a job.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Maximum bytes read from any single cgroup file. Stat files are
/// typically well under 1 KiB.
pub const MAX_CGROUP_READ: u64 = 8192;

/// Observed usage from a call's cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    /// Peak memory in bytes, from `memory.peak` or `memory.current`.
    pub peak_memory_bytes: Option<u64>,
    /// OOM kills recorded in `memory.events`.
    pub oom_kills: Option<u64>,
    /// Times the PIDs limit blocked a fork, from `pids.events`.
    pub pids_limit_hits: Option<u64>,
    /// CPU time in microseconds, from `cpu.stat`.
    pub cpu_time_us: Option<u64>,
}

impl CgroupUsage {
    /// Whether the memory controller killed anything.
    #[must_use]
    pub fn oom_killed(&self) -> bool {
        self.oom_kills.is_some_and(|n| n > 0)
    }

    /// Whether the PIDs controller blocked a fork.
    #[must_use]
    pub fn pids_exhausted(&self) -> bool {
        self.pids_limit_hits.is_some_and(|n| n > 0)
    }
}

/// Reads usage from a cgroup directory. Every field is best-effort.
#[must_use]
pub fn read_usage(dir: &Path) -> CgroupUsage {
    CgroupUsage {
        peak_memory_bytes: read_scalar(&dir.join("memory.peak"))
            .or_else(|| read_scalar(&dir.join("memory.current"))),
        oom_kills: read_flat_keyed(&dir.join("memory.events"), "oom_kill"),
        pids_limit_hits: read_flat_keyed(&dir.join("pids.events"), "max"),
        cpu_time_us: read_flat_keyed(&dir.join("cpu.stat"), "usage_usec"),
    }
}

fn read_bounded(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let mut content = String::new();
    file.take(MAX_CGROUP_READ).read_to_string(&mut content).ok()?;
    Some(content)
}

/// Parses a single-value file such as `memory.peak`.
fn read_scalar(path: &Path) -> Option<u64> {
    read_bounded(path)?.trim().parse().ok()
}

/// Parses a `key value` line out of a flat-keyed file such as
/// `memory.events` or `cpu.stat`.
fn read_flat_keyed(path: &Path, key: &str) -> Option<u64> {
    let content = read_bounded(path)?;
    parse_flat_keyed(&content, key)
}

fn parse_flat_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next() != Some(key) {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

/// The current process's own cgroup directory, from `/proc/self/cgroup`
/// (`0::<path>` on the v2 unified hierarchy).
#[must_use]
pub fn self_cgroup_dir() -> Option<PathBuf> {
    let content = read_bounded(Path::new("/proc/self/cgroup"))?;
    let path = content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))?
        .trim();
    Some(PathBuf::from("/sys/fs/cgroup").join(path.trim_start_matches('/')))
}

/// An owned per-call cgroup scope under a delegated parent.
///
/// Creation is opportunistic: on hosts without a writable delegated
/// subtree the scope simply is not created and the caller falls back to
/// rlimits. Removal happens on [`CgroupScope::finish`], after usage has
/// been read.
#[derive(Debug)]
pub struct CgroupScope {
    dir: PathBuf,
}

impl CgroupScope {
    /// Tries to create a scope with hard memory/PIDs ceilings.
    ///
    /// Swap is pinned to zero so the memory limit cannot be laundered
    /// through swap. Returns `None` when the hierarchy is not delegated
    /// to us.
    #[must_use]
    pub fn create(name: &str, memory_max: u64, pids_max: u32) -> Option<Self> {
        let parent = self_cgroup_dir()?;
        let dir = parent.join(name);
        fs::create_dir(&dir).ok()?;

        let scope = Self { dir };
        let ok = scope.write("memory.max", &memory_max.to_string())
            && scope.write("pids.max", &pids_max.to_string());
        // Best-effort: memory.swap.max is absent without swap accounting.
        let _ = scope.write("memory.swap.max", "0");
        if ok {
            Some(scope)
        } else {
            let _ = fs::remove_dir(&scope.dir);
            None
        }
    }

    fn write(&self, file: &str, value: &str) -> bool {
        match fs::write(self.dir.join(file), value) {
            Ok(()) => true,
            Err(e) => {
                debug!(file, error = %e, "cgroup write failed");
                false
            }
        }
    }

    /// Moves a process into the scope.
    #[must_use]
    pub fn attach(&self, pid: u32) -> bool {
        self.write("cgroup.procs", &pid.to_string())
    }

    /// Reads current usage.
    #[must_use]
    pub fn usage(&self) -> CgroupUsage {
        read_usage(&self.dir)
    }

    /// Reads final usage and removes the scope. Removal can only succeed
    /// once every member process has been reaped, so callers reap first.
    #[must_use]
    pub fn finish(self) -> CgroupUsage {
        let usage = read_usage(&self.dir);
        if let Err(e) = fs::remove_dir(&self.dir) {
            debug!(dir = %self.dir.display(), error = %e, "cgroup scope removal failed");
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_keyed() {
        let content = "low 0\nhigh 3\nmax 17\noom 2\noom_kill 1\n";
        assert_eq!(parse_flat_keyed(content, "oom_kill"), Some(1));
        assert_eq!(parse_flat_keyed(content, "max"), Some(17));
        assert_eq!(parse_flat_keyed(content, "absent"), None);
    }

    #[test]
    fn test_parse_flat_keyed_malformed() {
        assert_eq!(parse_flat_keyed("oom_kill notanumber\n", "oom_kill"), None);
        assert_eq!(parse_flat_keyed("", "oom_kill"), None);
        assert_eq!(parse_flat_keyed("oom_kill\n", "oom_kill"), None);
    }

    #[test]
    fn test_read_usage_from_fixture_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memory.peak"), "1048576\n").unwrap();
        fs::write(dir.path().join("memory.events"), "low 0\noom_kill 1\n").unwrap();
        fs::write(dir.path().join("pids.events"), "max 4\n").unwrap();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 1500\n").unwrap();

        let usage = read_usage(dir.path());
        assert_eq!(usage.peak_memory_bytes, Some(1_048_576));
        assert!(usage.oom_killed());
        assert!(usage.pids_exhausted());
        assert_eq!(usage.cpu_time_us, Some(1500));
    }

    #[test]
    fn test_read_usage_missing_files_is_all_none() {
        let dir = tempfile::tempdir().unwrap();
        let usage = read_usage(dir.path());
        assert_eq!(usage, CgroupUsage::default());
        assert!(!usage.oom_killed());
        assert!(!usage.pids_exhausted());
    }

    #[test]
    fn test_memory_current_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memory.current"), "2048\n").unwrap();
        let usage = read_usage(dir.path());
        assert_eq!(usage.peak_memory_bytes, Some(2048));
    }
}
