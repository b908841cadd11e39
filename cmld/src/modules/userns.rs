use std::sync::Mutex;

use crate::compartment::Compartment;
use crate::error::{Error, Result};
use crate::registry::{HookOutcome, Module};

/// Simple bump allocator over a fixed uid/gid range, with a free list so
/// ranges released by `cleanup` can be reused (§7 `ResourceBusy` "uid range
/// exhausted").
struct UidAllocator {
    next: u32,
    max: u32,
    free: Vec<(u32, u32)>,
}

impl UidAllocator {
    fn alloc(&mut self, len: u32) -> Result<u32> {
        if let Some(pos) = self.free.iter().position(|&(_, l)| l == len) {
            let (base, _) = self.free.remove(pos);
            return Ok(base);
        }
        if self.next.checked_add(len).map(|end| end > self.max).unwrap_or(true) {
            return Err(Error::resource_busy("uid range exhausted"));
        }
        let base = self.next;
        self.next += len;
        Ok(base)
    }

    fn free_range(&mut self, base: u32, len: u32) {
        self.free.push((base, len));
    }
}

/// Allocates a contiguous uid/gid range for each compartment and writes
/// the kernel's user-namespace mapping files once the child exists (§4.3
/// "ordering: before volumes"). The range itself is claimed in
/// `setup_early`, well before `volumes` assembles the rootfs; the actual
/// `/proc/<pid>/{uid,gid}_map` writes happen in `post_clone`, the first
/// phase where `child_pid` is populated.
pub struct UserNsModule {
    idx: usize,
    allocator: Mutex<UidAllocator>,
}

impl UserNsModule {
    pub fn new(idx: usize, base: u32, max: u32) -> Self {
        Self { idx, allocator: Mutex::new(UidAllocator { next: base, max, free: Vec::new() }) }
    }

    fn write_map(pid: i32, file: &str, host_base: u32, len: u32) -> Result<()> {
        let path = format!("/proc/{pid}/{file}");
        std::fs::write(&path, format!("0 {host_base} {len}\n"))
            .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing {path}: {e}")))
    }
}

impl Module for UserNsModule {
    fn name(&self) -> &'static str {
        "userns"
    }

    fn setup_early(&self, c: &mut Compartment) -> HookOutcome {
        let len = c.config.uid_range_len;
        let base = match self.allocator.lock().unwrap().alloc(len) {
            Ok(b) => b,
            Err(e) => return HookOutcome::Err(e),
        };
        c.uid_map = Some((base, 0, len));
        HookOutcome::Done
    }

    fn post_clone(&self, c: &mut Compartment) -> HookOutcome {
        let Some(pid) = c.child_pid else {
            return HookOutcome::Err(Error::internal("userns post_clone ran before child was forked"));
        };
        let Some((host_base, _, len)) = c.uid_map else {
            return HookOutcome::Err(Error::internal("userns post_clone ran before range was allocated"));
        };
        // setgroups must be denied before gid_map can be written by an
        // unprivileged mapping (man user_namespaces(7)).
        if let Err(e) = std::fs::write(format!("/proc/{pid}/setgroups"), "deny") {
            return HookOutcome::Err(Error::kernel(nix::errno::Errno::EIO, format!("denying setgroups: {e}")));
        }
        if let Err(e) = Self::write_map(pid, "uid_map", host_base, len) {
            return HookOutcome::Err(e);
        }
        if let Err(e) = Self::write_map(pid, "gid_map", host_base, len) {
            return HookOutcome::Err(e);
        }
        HookOutcome::Done
    }

    fn cleanup(&self, c: &mut Compartment) {
        if let Some((base, _, len)) = c.uid_map.take() {
            self.allocator.lock().unwrap().free_range(base, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;

    fn cfg(uid_range_len: u32) -> CompartmentConfig {
        CompartmentConfig {
            name: "c1".into(),
            guestos: "default".into(),
            uid_range_len,
            cgroup_memory_limit_bytes: None,
            capabilities_allow: vec![],
            seccomp_profile: None,
        }
    }

    #[test]
    fn allocates_non_overlapping_ranges_and_reclaims_on_cleanup() {
        let module = UserNsModule::new(0, 100_000, 200_000);
        let mut c1 = Compartment::new("c1", cfg(65536), 1);
        let mut c2 = Compartment::new("c2", cfg(65536), 1);

        assert!(matches!(module.setup_early(&mut c1), HookOutcome::Done));
        assert!(matches!(module.setup_early(&mut c2), HookOutcome::Done));
        assert_eq!(c1.uid_map.unwrap().0, 100_000);
        assert_eq!(c2.uid_map.unwrap().0, 165_536);

        module.cleanup(&mut c1);
        assert!(c1.uid_map.is_none());

        let mut c3 = Compartment::new("c3", cfg(65536), 1);
        assert!(matches!(module.setup_early(&mut c3), HookOutcome::Done));
        // reused the freed range rather than growing past max.
        assert_eq!(c3.uid_map.unwrap().0, 100_000);
    }

    #[test]
    fn exhausted_range_is_resource_busy() {
        let module = UserNsModule::new(0, 0, 65536);
        let mut c1 = Compartment::new("c1", cfg(65536), 1);
        assert!(matches!(module.setup_early(&mut c1), HookOutcome::Done));

        let mut c2 = Compartment::new("c2", cfg(1), 1);
        let outcome = module.setup_early(&mut c2);
        match outcome {
            HookOutcome::Err(e) => assert!(matches!(e.kind, crate::error::ErrorKind::ResourceBusy(_))),
            _ => panic!("expected resource busy"),
        }
    }
}
