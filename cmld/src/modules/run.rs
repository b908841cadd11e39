use crate::compartment::Compartment;
use crate::error::{Error, Result};
use crate::modules::service;
use crate::registry::{HookOutcome, Module};

/// Performs the actual `clone()`/fork and the child-side bootstrap up to
/// `execve` (§4.2's asterisked "*fork child*" / "*child proceeds to init
/// binary*" steps -- these aren't uniform per-module hooks like the rest
/// of the phase sequence, since only one thing in the whole registry
/// actually forks). Everything else in this module graph assumes
/// `c.child_pid` is populated once `clone_prep` returns in the parent.
pub trait ForkBackend: Send + Sync {
    /// Forks (or, in a test backend, simulates forking) and runs
    /// `child_main` in the new process. Returns the child's pid to the
    /// parent. `child_main` must not return on success -- it blocks on
    /// the release pipe, then executes into the guest init binary.
    ///
    /// Scoped to the call rather than `'static`: the real implementation
    /// runs `child_main` synchronously, before `fork` itself returns, so
    /// it can safely borrow `c: &mut Compartment` and this module's own
    /// fields instead of needing owned copies of everything it touches.
    fn fork<'a>(&self, child_main: Box<dyn FnOnce() + 'a>) -> Result<i32>;
}

/// The real backend: raw `fork(2)` followed, in the child branch, by a
/// synchronous, tokio-free bootstrap. Forking a multi-threaded async
/// runtime is unsafe in general (only the calling thread survives into
/// the child; locks held by other threads stay locked forever), so the
/// child branch here touches nothing async -- it runs `child_main`
/// (itself built only from `nix`/`libc` calls) and then either execs or
/// calls `_exit` directly, never returning into Rust's normal unwind path
/// or back into the tokio reactor.
pub struct RealFork;

impl ForkBackend for RealFork {
    fn fork<'a>(&self, child_main: Box<dyn FnOnce() + 'a>) -> Result<i32> {
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child }) => Ok(child.as_raw()),
            Ok(nix::unistd::ForkResult::Child) => {
                child_main();
                // child_main should have exec'd or exited; if it returns,
                // something upstream failed silently -- die rather than
                // risk running parent-process cleanup code twice.
                unsafe { nix::libc::_exit(127) };
            }
            Err(e) => Err(Error::kernel(e, "fork")),
        }
    }
}

pub struct RunModule {
    idx: usize,
    service_idx: usize,
    init_binary: std::path::PathBuf,
    backend: Box<dyn ForkBackend>,
    /// `capabilities`/`seccomp` (and anything else §4.3 says "runs in the
    /// child, just before exec"): deliberately held here rather than in
    /// the main `ModuleRegistry`, since that registry's forward loop runs
    /// entirely in the parent process. Registering a module there that
    /// overrides `start_pre_exec_child` would drop the *daemon's* own
    /// capabilities instead of the compartment's. Invoked directly, in
    /// order, from the forked child below.
    child_hardening: Vec<std::sync::Arc<dyn Module>>,
}

impl RunModule {
    pub fn new(
        idx: usize,
        service_idx: usize,
        init_binary: std::path::PathBuf,
        backend: Box<dyn ForkBackend>,
        child_hardening: Vec<std::sync::Arc<dyn Module>>,
    ) -> Self {
        Self { idx, service_idx, init_binary, backend, child_hardening }
    }

    pub fn with_real_fork(
        idx: usize,
        service_idx: usize,
        init_binary: std::path::PathBuf,
        child_hardening: Vec<std::sync::Arc<dyn Module>>,
    ) -> Self {
        Self::new(idx, service_idx, init_binary, Box::new(RealFork), child_hardening)
    }
}

impl Module for RunModule {
    fn name(&self) -> &'static str {
        "run"
    }

    /// §3 module descriptor ordering: `clone_prep` is the last parent-side
    /// phase before the fork, so every module that needed host-namespace
    /// groundwork in place beforehand (uid range allocated, rootfs
    /// mounted, cgroup created) has already run theirs.
    fn clone_prep(&self, c: &mut Compartment) -> HookOutcome {
        let Some((release_read, _)) = c.release_pipe else {
            return HookOutcome::Err(Error::internal("run.clone_prep ran before service.clone_prep"));
        };
        let Some((_, ready_write)) = c.ready_pipe else {
            return HookOutcome::Err(Error::internal("run.clone_prep ran before service.clone_prep"));
        };
        let init_binary = &self.init_binary;
        let rootfs = c.rootfs_mount_point.clone();
        let hardening = &self.child_hardening;
        // A raw pointer, not a reborrow: `child_main` only ever actually
        // runs inside a genuinely forked child process (a separate
        // address space with its own copy of everything `c` points to),
        // never concurrently with the parent's own use of `c` below. The
        // borrow checker has no way to see that distinction, since from
        // its view `fork()` is just an ordinary function call.
        let c_ptr: *mut Compartment = c;

        let child_main: Box<dyn FnOnce() + '_> = Box::new(move || {
            let c: &mut Compartment = unsafe { &mut *c_ptr };
            service::wait_for_release(release_read);
            if let Some(root) = &rootfs {
                let _ = nix::unistd::chroot(root);
                let _ = nix::unistd::chdir("/");
            }
            // §4.3 "capabilities"/"seccomp": dropped/applied here, inside
            // the new namespaces and just before exec. A failure here
            // can't be reported back to the parent -- the fork already
            // happened -- so the child exits non-zero instead; the
            // parent's `start_complete` sees EOF on the ready pipe and
            // surfaces that as a start failure (§4.2).
            for module in hardening {
                if let HookOutcome::Err(_) = module.run(crate::registry::Phase::StartPreExecChild, c) {
                    unsafe { nix::libc::_exit(126) };
                }
            }
            let _ = service::signal_ready(ready_write);
            let path = match std::ffi::CString::new(init_binary.as_os_str().as_encoded_bytes()) {
                Ok(p) => p,
                Err(_) => unsafe { nix::libc::_exit(126) },
            };
            let argv = [path.clone()];
            let _ = nix::unistd::execv(&path, &argv);
            // execv only returns on failure.
        });

        match self.backend.fork(child_main) {
            Ok(pid) => {
                let c: &mut Compartment = unsafe { &mut *c_ptr };
                c.child_pid = Some(pid);
                HookOutcome::Done
            }
            Err(e) => HookOutcome::Err(e),
        }
    }

    fn cleanup(&self, c: &mut Compartment) {
        c.child_pid = None;
        let _ = self.service_idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn cfg() -> CompartmentConfig {
        CompartmentConfig {
            name: "c1".into(),
            guestos: "default".into(),
            uid_range_len: 65536,
            cgroup_memory_limit_bytes: None,
            capabilities_allow: vec![],
            seccomp_profile: None,
        }
    }

    struct FakeFork {
        next_pid: Arc<AtomicI32>,
        fail: bool,
    }
    impl ForkBackend for FakeFork {
        fn fork<'a>(&self, _child_main: Box<dyn FnOnce() + 'a>) -> Result<i32> {
            if self.fail {
                return Err(Error::internal("simulated fork failure"));
            }
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn clone_prep_requires_service_pipes_first() {
        let module = RunModule::new(
            0,
            1,
            "/sbin/init".into(),
            Box::new(FakeFork { next_pid: Arc::new(AtomicI32::new(100)), fail: false }),
            vec![],
        );
        let mut c = Compartment::new("c1", cfg(), 2);
        let outcome = module.clone_prep(&mut c);
        assert!(matches!(outcome, HookOutcome::Err(_)));
    }

    #[test]
    fn clone_prep_records_child_pid_on_success() {
        let svc = crate::modules::service::ServiceModule::new(1);
        let mut c = Compartment::new("c1", cfg(), 2);
        svc.clone_prep(&mut c);

        let module = RunModule::new(
            0,
            1,
            "/sbin/init".into(),
            Box::new(FakeFork { next_pid: Arc::new(AtomicI32::new(4242)), fail: false }),
            vec![],
        );
        let outcome = module.clone_prep(&mut c);
        assert!(matches!(outcome, HookOutcome::Done));
        assert_eq!(c.child_pid, Some(4242));
    }

    #[test]
    fn fork_failure_surfaces_as_kernel_error_not_a_panic() {
        let svc = crate::modules::service::ServiceModule::new(1);
        let mut c = Compartment::new("c1", cfg(), 2);
        svc.clone_prep(&mut c);

        let module = RunModule::new(
            0,
            1,
            "/sbin/init".into(),
            Box::new(FakeFork { next_pid: Arc::new(AtomicI32::new(0)), fail: true }),
            vec![],
        );
        let outcome = module.clone_prep(&mut c);
        assert!(matches!(outcome, HookOutcome::Err(_)));
        assert!(c.child_pid.is_none());
    }
}
