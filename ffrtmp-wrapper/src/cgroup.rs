use crate::constraints::{Constraints, DEFAULT_CPU_WEIGHT};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CFS_PERIOD_US: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V2,
    V1,
}

/// Detects the mounted cgroup hierarchy under `root`. `None` means no
/// usable hierarchy; callers degrade to nice-only governance.
pub fn detect(root: &Path) -> Option<CgroupVersion> {
    if root.join("cgroup.controllers").is_file() {
        Some(CgroupVersion::V2)
    } else if root.join("cpu").is_dir() || root.join("memory").is_dir() {
        Some(CgroupVersion::V1)
    } else {
        None
    }
}

/// One cgroup per workload: `<root>/<namespace>-<job_id>` on v2, the
/// same leaf name under each controller hierarchy on v1. Creation and
/// every write are best effort; failures are logged and swallowed so
/// constraints degrade to whatever is available.
#[derive(Debug, Clone)]
pub struct CgroupBinding {
    version: CgroupVersion,
    name: String,
    root: PathBuf,
}

impl CgroupBinding {
    pub fn create(root: &Path, namespace: &str, job_id: &str) -> Option<CgroupBinding> {
        let version = detect(root)?;
        let name = format!("{namespace}-{job_id}");
        let binding = CgroupBinding {
            version,
            name,
            root: root.to_path_buf(),
        };

        let created = match version {
            CgroupVersion::V2 => binding.create_dir(&binding.v2_dir()),
            CgroupVersion::V1 => {
                // Partial creation is acceptable: a writable cpu
                // hierarchy with a read-only memory one still buys us
                // CPU governance.
                let mut any = false;
                for dir in binding.v1_dirs() {
                    any |= binding.create_dir(&dir);
                }
                any
            }
        };

        if created {
            debug!(cgroup = %binding.name, version = ?version, "created workload cgroup");
            Some(binding)
        } else {
            warn!(cgroup = %binding.name, "could not create any cgroup directory");
            None
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes the constraint files. Unset or zero ("unlimited") knobs
    /// are skipped entirely.
    pub fn apply(&self, constraints: &Constraints) {
        match self.version {
            CgroupVersion::V2 => self.apply_v2(constraints),
            CgroupVersion::V1 => self.apply_v1(constraints),
        }
    }

    fn apply_v2(&self, constraints: &Constraints) {
        let dir = self.v2_dir();

        if let Some(percent) = constraints.cpu_quota_percent.filter(|p| *p > 0) {
            let quota = percent as u64 * CFS_PERIOD_US / 100;
            self.write(&dir.join("cpu.max"), &format!("{quota} {CFS_PERIOD_US}"));
        }
        if let Some(weight) = constraints.cpu_weight {
            self.write(&dir.join("cpu.weight"), &weight.to_string());
        }
        if let Some(mb) = constraints.memory_limit_mb.filter(|m| *m > 0) {
            self.write(&dir.join("memory.max"), &(mb * 1024 * 1024).to_string());
        }
        if let Some(percent) = constraints.io_weight_percent {
            // io.weight is 1..=1000 with a default of 100.
            let weight = (percent * 10).max(1);
            self.write(&dir.join("io.weight"), &format!("default {weight}"));
        }
    }

    fn apply_v1(&self, constraints: &Constraints) {
        let cpu = self.root.join("cpu").join(&self.name);
        let memory = self.root.join("memory").join(&self.name);

        if let Some(percent) = constraints.cpu_quota_percent.filter(|p| *p > 0) {
            let quota = percent as u64 * CFS_PERIOD_US / 100;
            self.write(&cpu.join("cpu.cfs_period_us"), &CFS_PERIOD_US.to_string());
            self.write(&cpu.join("cpu.cfs_quota_us"), &quota.to_string());
        }
        if let Some(weight) = constraints.cpu_weight {
            // cpu.shares default is 1024 at the default weight of 100.
            let shares = (weight as u64 * 1024 / DEFAULT_CPU_WEIGHT as u64).max(2);
            self.write(&cpu.join("cpu.shares"), &shares.to_string());
        }
        if let Some(mb) = constraints.memory_limit_mb.filter(|m| *m > 0) {
            self.write(
                &memory.join("memory.limit_in_bytes"),
                &(mb * 1024 * 1024).to_string(),
            );
        }
        if constraints.io_weight_percent.is_some() {
            debug!(cgroup = %self.name, "io weight is unsupported on cgroup v1, skipping");
        }
    }

    /// Joins the workload into the cgroup by pid.
    pub fn add_pid(&self, pid: u32) {
        match self.version {
            CgroupVersion::V2 => {
                self.write(&self.v2_dir().join("cgroup.procs"), &pid.to_string());
            }
            CgroupVersion::V1 => {
                for dir in self.v1_dirs() {
                    if dir.is_dir() {
                        self.write(&dir.join("cgroup.procs"), &pid.to_string());
                    }
                }
            }
        }
    }

    /// Number of OOM kills recorded against this cgroup (v2 only).
    pub fn oom_kill_count(&self) -> u64 {
        if self.version != CgroupVersion::V2 {
            return 0;
        }
        let Ok(events) = fs::read_to_string(self.v2_dir().join("memory.events")) else {
            return 0;
        };
        events
            .lines()
            .find_map(|line| line.strip_prefix("oom_kill "))
            .and_then(|count| count.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Best-effort removal; a cgroup directory can only be removed once
    /// no process remains in it.
    pub fn remove(&self) {
        let dirs = match self.version {
            CgroupVersion::V2 => vec![self.v2_dir()],
            CgroupVersion::V1 => self.v1_dirs(),
        };
        for dir in dirs {
            if dir.is_dir() {
                // cgroupfs directories are removed with rmdir even when
                // they still show interface files; fall back to a
                // recursive removal for regular filesystems.
                if fs::remove_dir(&dir).is_err() {
                    if let Err(err) = fs::remove_dir_all(&dir) {
                        warn!(cgroup = %self.name, "could not remove {}: {err}", dir.display());
                    }
                }
            }
        }
    }

    fn v2_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn v1_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("cpu").join(&self.name),
            self.root.join("memory").join(&self.name),
        ]
    }

    fn create_dir(&self, dir: &Path) -> bool {
        match fs::create_dir_all(dir) {
            Ok(()) => true,
            Err(err) => {
                warn!(cgroup = %self.name, "could not create {}: {err}", dir.display());
                false
            }
        }
    }

    fn write(&self, path: &Path, value: &str) {
        if let Err(err) = fs::write(path, value) {
            warn!(cgroup = %self.name, "could not write {} = {value}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_v2_root() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("cgroup.controllers"), "cpu io memory").unwrap();
        root
    }

    fn fake_v1_root() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("cpu")).unwrap();
        fs::create_dir(root.path().join("memory")).unwrap();
        root
    }

    #[test]
    fn detects_hierarchy_version() {
        let v2 = fake_v2_root();
        assert_eq!(detect(v2.path()), Some(CgroupVersion::V2));

        let v1 = fake_v1_root();
        assert_eq!(detect(v1.path()), Some(CgroupVersion::V1));

        let none = TempDir::new().unwrap();
        assert_eq!(detect(none.path()), None);
    }

    #[test]
    fn v2_apply_writes_constraint_files() {
        let root = fake_v2_root();
        let binding = CgroupBinding::create(root.path(), "ffrtmp", "job1").unwrap();

        binding.apply(&Constraints {
            cpu_quota_percent: Some(150),
            cpu_weight: Some(200),
            memory_limit_mb: Some(256),
            io_weight_percent: Some(50),
            ..Constraints::default()
        });

        let dir = root.path().join("ffrtmp-job1");
        assert_eq!(
            fs::read_to_string(dir.join("cpu.max")).unwrap(),
            "150000 100000"
        );
        assert_eq!(fs::read_to_string(dir.join("cpu.weight")).unwrap(), "200");
        assert_eq!(
            fs::read_to_string(dir.join("memory.max")).unwrap(),
            (256u64 * 1024 * 1024).to_string()
        );
        assert_eq!(
            fs::read_to_string(dir.join("io.weight")).unwrap(),
            "default 500"
        );
    }

    #[test]
    fn v1_apply_writes_per_controller_files() {
        let root = fake_v1_root();
        let binding = CgroupBinding::create(root.path(), "ffrtmp", "job1").unwrap();

        binding.apply(&Constraints {
            cpu_quota_percent: Some(50),
            cpu_weight: Some(100),
            memory_limit_mb: Some(128),
            ..Constraints::default()
        });

        let cpu = root.path().join("cpu/ffrtmp-job1");
        let memory = root.path().join("memory/ffrtmp-job1");
        assert_eq!(
            fs::read_to_string(cpu.join("cpu.cfs_quota_us")).unwrap(),
            "50000"
        );
        assert_eq!(fs::read_to_string(cpu.join("cpu.shares")).unwrap(), "1024");
        assert_eq!(
            fs::read_to_string(memory.join("memory.limit_in_bytes")).unwrap(),
            (128u64 * 1024 * 1024).to_string()
        );
    }

    #[test]
    fn create_apply_remove_leaves_no_residue() {
        let root = fake_v2_root();
        let binding = CgroupBinding::create(root.path(), "ffrtmp", "job2").unwrap();
        binding.apply(&Constraints {
            memory_limit_mb: Some(64),
            ..Constraints::default()
        });
        assert!(root.path().join("ffrtmp-job2").is_dir());

        binding.remove();
        assert!(!root.path().join("ffrtmp-job2").exists());
    }

    #[test]
    fn zero_limits_are_skipped() {
        let root = fake_v2_root();
        let binding = CgroupBinding::create(root.path(), "ffrtmp", "job3").unwrap();
        binding.apply(&Constraints {
            cpu_quota_percent: Some(0),
            memory_limit_mb: Some(0),
            ..Constraints::default()
        });

        let dir = root.path().join("ffrtmp-job3");
        assert!(!dir.join("cpu.max").exists());
        assert!(!dir.join("memory.max").exists());
    }

    #[test]
    fn oom_kill_count_parses_memory_events() {
        let root = fake_v2_root();
        let binding = CgroupBinding::create(root.path(), "ffrtmp", "job4").unwrap();
        assert_eq!(binding.oom_kill_count(), 0);

        fs::write(
            root.path().join("ffrtmp-job4/memory.events"),
            "low 0\nhigh 2\nmax 5\noom 1\noom_kill 1\n",
        )
        .unwrap();
        assert_eq!(binding.oom_kill_count(), 1);
    }
}
