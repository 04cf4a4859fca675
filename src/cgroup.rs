//! Resource-group (cgroup) lifecycle, shaped after
//! `benchmark/cgroups.py` (see SPEC_FULL.md §12): discover the
//! subsystem mount points and this process's own cgroup, create one
//! scoped subdirectory per needed subsystem, copy `cpuset.cpus`/
//! `cpuset.mems` into a freshly created cpuset group so tasks can
//! actually be added to it, and provide the three-stage kill
//! (SIGINT/SIGTERM/SIGKILL with a pause between tries) plus a
//! retry-once removal.
//!
//! Tolerant of a system with cgroups unavailable or unwritable: every
//! operation degrades to "subsystem not enabled" rather than failing
//! the run, per spec §4.5 "If the memory subsystem is available,
//! memory limits are enforced by kernel policy; otherwise memory is
//! only observed."

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

const CGROUP_NAME_PREFIX: &str = "bencheck_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Subsystem {
    CpuAcct,
    CpuSet,
    Memory,
}

impl Subsystem {
    fn mount_option_name(self) -> &'static str {
        match self {
            Subsystem::CpuAcct => "cpuacct",
            Subsystem::CpuSet => "cpuset",
            Subsystem::Memory => "memory",
        }
    }
}

/// Per-subsystem mount points and this process's own cgroup path
/// within each, discovered once and reused for every run in the
/// process lifetime.
#[derive(Debug, Default)]
pub struct CgroupMounts {
    parents: BTreeMap<Subsystem, PathBuf>,
}

fn find_cgroup_mounts() -> BTreeMap<&'static str, PathBuf> {
    let mut mounts = BTreeMap::new();
    let Ok(content) = fs::read_to_string("/proc/mounts") else {
        return mounts;
    };
    for line in content.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 4 || fields[2] != "cgroup" {
            continue;
        }
        let mountpoint = fields[1];
        for option in fields[3].split(',') {
            for subsystem in ["cpuacct", "cpuset", "memory"] {
                if option == subsystem {
                    mounts.insert(subsystem, PathBuf::from(mountpoint));
                }
            }
        }
    }
    mounts
}

fn find_own_cgroups() -> BTreeMap<&'static str, String> {
    let mut own = BTreeMap::new();
    let Ok(content) = fs::read_to_string("/proc/self/cgroup") else {
        return own;
    };
    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            continue;
        }
        let path = parts[2].trim_start_matches('/');
        for subsystem_name in parts[1].split(',') {
            for subsystem in ["cpuacct", "cpuset", "memory"] {
                if subsystem_name == subsystem {
                    own.insert(subsystem, path.to_string());
                }
            }
        }
    }
    own
}

impl CgroupMounts {
    pub fn discover() -> Self {
        let mounts = find_cgroup_mounts();
        let own = find_own_cgroups();
        let mut parents = BTreeMap::new();
        for (subsystem, key) in [
            (Subsystem::CpuAcct, "cpuacct"),
            (Subsystem::CpuSet, "cpuset"),
            (Subsystem::Memory, "memory"),
        ] {
            if let (Some(mount), Some(own_path)) = (mounts.get(key), own.get(key)) {
                parents.insert(subsystem, mount.join(own_path));
            }
        }
        Self { parents }
    }

    fn parent_for(&self, subsystem: Subsystem) -> Option<&Path> {
        self.parents.get(&subsystem).map(|p| p.as_path())
    }
}

/// A single scoped cgroup created for one run, spanning whichever of
/// CPU accounting / core-set pinning / memory accounting the host
/// made available.
#[derive(Debug, Default)]
pub struct ResourceGroup {
    dirs: BTreeMap<Subsystem, PathBuf>,
    warnings: Vec<String>,
}

impl ResourceGroup {
    /// Attempts to create a scoped cgroup under each available
    /// subsystem. Never fails: subsystems that can't be used (not
    /// mounted, or mkdir refused) are recorded as warnings and simply
    /// absent from `dirs`.
    pub fn create(mounts: &CgroupMounts) -> Self {
        let mut dirs = BTreeMap::new();
        let mut warnings = Vec::new();
        for subsystem in [Subsystem::CpuAcct, Subsystem::CpuSet, Subsystem::Memory] {
            let Some(parent) = mounts.parent_for(subsystem) else {
                warnings.push(format!(
                    "cgroup subsystem {} not enabled",
                    subsystem.mount_option_name()
                ));
                continue;
            };
            match create_one(parent) {
                Ok(dir) => {
                    if subsystem == Subsystem::CpuSet {
                        // Without allowed cpus/mems inherited, no task
                        // can be added to this group.
                        let _ = fs::copy(parent.join("cpuset.cpus"), dir.join("cpuset.cpus"));
                        let _ = fs::copy(parent.join("cpuset.mems"), dir.join("cpuset.mems"));
                    }
                    dirs.insert(subsystem, dir);
                }
                Err(e) => warnings.push(format!(
                    "cannot use cgroup hierarchy at {parent:?}: {e}"
                )),
            }
        }
        Self { dirs, warnings }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_memory(&self) -> bool {
        self.dirs.contains_key(&Subsystem::Memory)
    }

    pub fn has_cpuset(&self) -> bool {
        self.dirs.contains_key(&Subsystem::CpuSet)
    }

    pub fn set_memory_limit_bytes(&self, limit: u64) -> io::Result<()> {
        let Some(dir) = self.dirs.get(&Subsystem::Memory) else {
            return Ok(());
        };
        fs::write(dir.join("memory.limit_in_bytes"), limit.to_string())
    }

    pub fn set_allowed_cpus(&self, core_ids: &[u32]) -> io::Result<()> {
        let Some(dir) = self.dirs.get(&Subsystem::CpuSet) else {
            return Ok(());
        };
        let list = core_ids
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        fs::write(dir.join("cpuset.cpus"), list)
    }

    pub fn add_task(&self, pid: Pid) -> io::Result<()> {
        for dir in self.dirs.values() {
            // Multiple subsystems can share one mount; writing to each
            // task file independently is harmless if they coincide.
            let _ = fs::write(dir.join("tasks"), pid.as_raw().to_string());
        }
        Ok(())
    }

    pub fn peak_memory_bytes(&self) -> Option<u64> {
        let dir = self.dirs.get(&Subsystem::Memory)?;
        let content = fs::read_to_string(dir.join("memory.max_usage_in_bytes")).ok()?;
        content.trim().parse().ok()
    }

    pub fn cpu_time_ns(&self) -> Option<u64> {
        let dir = self.dirs.get(&Subsystem::CpuAcct)?;
        let content = fs::read_to_string(dir.join("cpuacct.usage")).ok()?;
        content.trim().parse().ok()
    }

    /// Kill any residual processes left in the group: SIGINT, then
    /// SIGTERM, then SIGKILL, with a short pause between tries.
    pub fn kill_all_tasks(&self) {
        for dir in self.dirs.values() {
            kill_all_in(dir);
        }
    }

    /// Remove every created subdirectory; retry once per directory on
    /// failure (the kernel sometimes reports the group as busy for a
    /// moment after the last task leaves).
    pub fn remove(self) -> Vec<String> {
        let mut warnings = self.warnings;
        for dir in self.dirs.values() {
            if fs::remove_dir(dir).is_err() {
                thread::sleep(Duration::from_millis(50));
                if let Err(e) = fs::remove_dir(dir) {
                    warnings.push(format!("failed to remove cgroup {dir:?}: {e}"));
                }
            }
        }
        warnings
    }
}

fn create_one(parent: &Path) -> io::Result<PathBuf> {
    let unique = format!(
        "{CGROUP_NAME_PREFIX}{}-{}",
        std::process::id(),
        rand::random::<u32>()
    );
    let dir = parent.join(unique);
    fs::create_dir(&dir)?;
    Ok(dir)
}

fn kill_all_in(dir: &Path) {
    let tasks_path = dir.join("tasks");
    for (attempt, sig) in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL]
        .into_iter()
        .enumerate()
    {
        let Ok(content) = fs::read_to_string(&tasks_path) else {
            return;
        };
        let pids: Vec<Pid> = content
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect();
        if pids.is_empty() {
            return;
        }
        for pid in &pids {
            let _ = kill(*pid, sig);
        }
        if attempt == 2 {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
}
