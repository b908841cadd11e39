use std::fs;
use std::path::{Path, PathBuf};

use crate::compartment::Compartment;
use crate::error::{Error, Result};
use crate::registry::{HookOutcome, Module};

/// Per-compartment cgroup paths, compile-time selected between the
/// unified v2 hierarchy and the legacy per-controller v1 layout (§4.3,
/// same "mutually exclusive, compile-time selectable" treatment as
/// `idshift`'s uid-shift/idmapped-mount split). v2 removed the `devices`
/// controller in favor of eBPF, so `device_cgroup` needs to know which
/// of these is active too -- both modules key off the same
/// `cgroup_v1` feature flag.
enum CgroupPaths {
    V2 { unified: PathBuf },
    V1 { memory: PathBuf, freezer: PathBuf },
}

struct CgroupState {
    paths: CgroupPaths,
}

/// Creates and tears down the per-compartment cgroup, applies the
/// configured memory limit, moves the child process in once it exists,
/// and implements freeze/thaw via the freezer controller (§4.3, §4.5).
pub struct CgroupModule {
    idx: usize,
    cgroup_root: PathBuf,
}

impl CgroupModule {
    pub fn new(idx: usize, cgroup_root: PathBuf) -> Self {
        Self { idx, cgroup_root }
    }

    fn paths_for(&self, name: &str) -> CgroupPaths {
        if cfg!(feature = "cgroup_v1") {
            CgroupPaths::V1 {
                memory: self.cgroup_root.join("memory/cmld").join(name),
                freezer: self.cgroup_root.join("freezer/cmld").join(name),
            }
        } else {
            CgroupPaths::V2 { unified: self.cgroup_root.join("cmld").join(name) }
        }
    }

    fn create_dirs(paths: &CgroupPaths) -> Result<()> {
        let dirs: &[&Path] = match paths {
            CgroupPaths::V2 { unified } => &[unified],
            CgroupPaths::V1 { memory, freezer } => &[memory, freezer],
        };
        for dir in dirs {
            fs::create_dir_all(dir)
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("creating {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    fn apply_memory_limit(paths: &CgroupPaths, limit: u64) -> Result<()> {
        let (dir, file) = match paths {
            CgroupPaths::V2 { unified } => (unified, "memory.max"),
            CgroupPaths::V1 { memory, .. } => (memory, "memory.limit_in_bytes"),
        };
        fs::write(dir.join(file), limit.to_string())
            .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing {file}: {e}")))
    }

    fn enroll_pid(paths: &CgroupPaths, pid: i32) -> Result<()> {
        let procs_files: Vec<PathBuf> = match paths {
            CgroupPaths::V2 { unified } => vec![unified.join("cgroup.procs")],
            CgroupPaths::V1 { memory, freezer } => {
                vec![memory.join("cgroup.procs"), freezer.join("cgroup.procs")]
            }
        };
        for f in procs_files {
            fs::write(&f, pid.to_string())
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing {}: {e}", f.display())))?;
        }
        Ok(())
    }

    fn write_freeze(paths: &CgroupPaths, frozen: bool) -> Result<()> {
        match paths {
            CgroupPaths::V2 { unified } => fs::write(unified.join("cgroup.freeze"), if frozen { "1" } else { "0" })
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing cgroup.freeze: {e}"))),
            CgroupPaths::V1 { freezer, .. } => fs::write(
                freezer.join("freezer.state"),
                if frozen { "FROZEN" } else { "THAWED" },
            )
            .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing freezer.state: {e}"))),
        }
    }

    /// Kills every process still in the cgroup. Run from `stop`, before
    /// `cleanup`'s rmdir: a v2 `cgroup.kill` write is synchronous and
    /// recursive, but v1 has no equivalent, so a freeze/SIGKILL-all/thaw
    /// cycle stands in (freezing first so no member can re-fork a
    /// sibling out from under the kill).
    fn kill_members(paths: &CgroupPaths) {
        match paths {
            CgroupPaths::V2 { unified } => {
                let _ = fs::write(unified.join("cgroup.kill"), "1");
            }
            CgroupPaths::V1 { freezer, .. } => {
                let _ = fs::write(freezer.join("freezer.state"), "FROZEN");
                if let Ok(tasks) = fs::read_to_string(freezer.join("cgroup.procs")) {
                    for line in tasks.lines() {
                        if let Ok(pid) = line.trim().parse::<i32>() {
                            let _ = nix::sys::signal::kill(
                                nix::unistd::Pid::from_raw(pid),
                                nix::sys::signal::Signal::SIGKILL,
                            );
                        }
                    }
                }
                let _ = fs::write(freezer.join("freezer.state"), "THAWED");
            }
        }
    }

    /// rmdir is defensive: `cleanup` must be total, and a cgroup that
    /// still (briefly) contains a not-yet-reaped zombie member will
    /// reject `rmdir` with `EBUSY`. A few retries cover the normal case;
    /// anything left over is logged and swallowed rather than failing
    /// the teardown.
    fn remove_dirs(paths: &CgroupPaths) {
        let dirs: Vec<&Path> = match paths {
            CgroupPaths::V2 { unified } => vec![unified],
            CgroupPaths::V1 { memory, freezer } => vec![memory, freezer],
        };
        for dir in dirs {
            let mut attempts = 0;
            while attempts < 5 {
                match fs::remove_dir(dir) {
                    Ok(()) | Err(_) if attempts == 4 => break,
                    Ok(()) => break,
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        attempts += 1;
                    }
                }
            }
        }
    }
}

impl Module for CgroupModule {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn setup_early(&self, c: &mut Compartment) -> HookOutcome {
        let paths = self.paths_for(&c.name);
        if let Err(e) = Self::create_dirs(&paths) {
            return HookOutcome::Err(e);
        }
        if let Some(limit) = c.config.cgroup_memory_limit_bytes {
            if let Err(e) = Self::apply_memory_limit(&paths, limit) {
                return HookOutcome::Err(e);
            }
        }
        c.set_module_state(self.idx, Box::new(CgroupState { paths }));
        HookOutcome::Done
    }

    fn post_clone(&self, c: &mut Compartment) -> HookOutcome {
        let Some(pid) = c.child_pid else {
            return HookOutcome::Err(Error::internal("cgroup post_clone ran before child was forked"));
        };
        let Some(state) = c.module_state(self.idx).and_then(|s| s.downcast_ref::<CgroupState>()) else {
            return HookOutcome::Err(Error::internal("cgroup post_clone ran before setup_early"));
        };
        match Self::enroll_pid(&state.paths, pid) {
            Ok(()) => HookOutcome::Done,
            Err(e) => HookOutcome::Err(e),
        }
    }

    fn freeze(&self, c: &mut Compartment) -> HookOutcome {
        let Some(state) = c.module_state(self.idx).and_then(|s| s.downcast_ref::<CgroupState>()) else {
            return HookOutcome::Err(Error::internal("cgroup freeze ran before setup_early"));
        };
        match Self::write_freeze(&state.paths, true) {
            Ok(()) => HookOutcome::Done,
            Err(e) => HookOutcome::Err(e),
        }
    }

    fn thaw(&self, c: &mut Compartment) -> HookOutcome {
        let Some(state) = c.module_state(self.idx).and_then(|s| s.downcast_ref::<CgroupState>()) else {
            return HookOutcome::Err(Error::internal("cgroup thaw ran before setup_early"));
        };
        match Self::write_freeze(&state.paths, false) {
            Ok(()) => HookOutcome::Done,
            Err(e) => HookOutcome::Err(e),
        }
    }

    fn stop(&self, c: &mut Compartment) -> HookOutcome {
        if let Some(state) = c.module_state(self.idx).and_then(|s| s.downcast_ref::<CgroupState>()) {
            Self::kill_members(&state.paths);
        }
        HookOutcome::Done
    }

    fn cleanup(&self, c: &mut Compartment) {
        if let Some(state) = c.take_module_state(self.idx) {
            if let Ok(state) = state.downcast::<CgroupState>() {
                Self::remove_dirs(&state.paths);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;

    fn cfg() -> CompartmentConfig {
        CompartmentConfig {
            name: "c1".into(),
            guestos: "default".into(),
            uid_range_len: 65536,
            cgroup_memory_limit_bytes: Some(1 << 30),
            capabilities_allow: vec![],
            seccomp_profile: None,
        }
    }

    #[test]
    fn setup_early_creates_hierarchy_and_writes_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let module = CgroupModule::new(0, dir.path().to_path_buf());
        let mut c = Compartment::new("c1", cfg(), 1);
        let outcome = module.setup_early(&mut c);
        assert!(matches!(outcome, HookOutcome::Done));

        let limit_path = if cfg!(feature = "cgroup_v1") {
            dir.path().join("memory/cmld/c1/memory.limit_in_bytes")
        } else {
            dir.path().join("cmld/c1/memory.max")
        };
        let contents = fs::read_to_string(limit_path).unwrap();
        assert_eq!(contents, (1u64 << 30).to_string());
    }

    #[test]
    fn post_clone_before_setup_early_is_internal_error() {
        let module = CgroupModule::new(0, PathBuf::from("/nonexistent"));
        let mut c = Compartment::new("c1", cfg(), 1);
        c.child_pid = Some(1234);
        let outcome = module.post_clone(&mut c);
        assert!(matches!(outcome, HookOutcome::Err(_)));
    }

    #[test]
    fn freeze_then_thaw_round_trips_the_control_file() {
        let dir = tempfile::tempdir().unwrap();
        let module = CgroupModule::new(0, dir.path().to_path_buf());
        let mut c = Compartment::new("c1", cfg(), 1);
        assert!(matches!(module.setup_early(&mut c), HookOutcome::Done));

        assert!(matches!(module.freeze(&mut c), HookOutcome::Done));
        assert!(matches!(module.thaw(&mut c), HookOutcome::Done));
    }

    #[test]
    fn cleanup_on_never_started_compartment_is_a_noop() {
        let module = CgroupModule::new(0, PathBuf::from("/nonexistent"));
        let mut c = Compartment::new("c1", cfg(), 1);
        module.cleanup(&mut c);
    }
}
