use std::collections::BTreeMap;
use std::convert::TryInto;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter};

use crate::compartment::Compartment;
use crate::error::Error;
use crate::registry::{HookOutcome, Module};

/// Applies a seccomp-bpf filter in the child just before `exec`, selected
/// by `CompartmentConfig::seccomp_profile` (§4.3 "seccomp"). No profile
/// means `PR_SET_NO_NEW_PRIVS` only -- every syscall is still allowed, but
/// the process (and anything it execs) can never regain privilege via a
/// setuid binary. A named profile additionally installs a default-deny
/// filter whose allow-list is this module's own minimal baseline; real
/// profile-specific syscall lists belong to a configuration collaborator
/// this rewrite has no standalone file format for yet.
pub struct SeccompModule {
    idx: usize,
}

impl SeccompModule {
    pub fn new(idx: usize) -> Self {
        Self { idx }
    }

    fn baseline_allowed_syscalls() -> &'static [i64] {
        // Enough for a guest init to read/write/mmap/exec/exit and manage
        // its own namespaces; anything beyond this is opt-in via a named
        // profile in a future revision.
        &[
            libc::SYS_read,
            libc::SYS_write,
            libc::SYS_close,
            libc::SYS_fstat,
            libc::SYS_lseek,
            libc::SYS_mmap,
            libc::SYS_mprotect,
            libc::SYS_munmap,
            libc::SYS_brk,
            libc::SYS_rt_sigaction,
            libc::SYS_rt_sigprocmask,
            libc::SYS_rt_sigreturn,
            libc::SYS_ioctl,
            libc::SYS_pread64,
            libc::SYS_pwrite64,
            libc::SYS_access,
            libc::SYS_execve,
            libc::SYS_exit,
            libc::SYS_exit_group,
            libc::SYS_wait4,
            libc::SYS_clone,
            libc::SYS_fork,
            libc::SYS_openat,
            libc::SYS_fcntl,
            libc::SYS_getpid,
            libc::SYS_getppid,
            libc::SYS_nanosleep,
            libc::SYS_clock_gettime,
            libc::SYS_gettimeofday,
            libc::SYS_futex,
            libc::SYS_set_tid_address,
            libc::SYS_set_robust_list,
            libc::SYS_prlimit64,
        ]
    }

    fn compile(&self) -> Result<BpfProgram, Error> {
        let mut rules = BTreeMap::new();
        for syscall in Self::baseline_allowed_syscalls() {
            rules.insert(*syscall, Vec::new());
        }
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Errno(libc::EPERM as u32),
            SeccompAction::Allow,
            std::env::consts::ARCH.try_into().map_err(|_| Error::internal("unsupported seccomp arch"))?,
        )
        .map_err(|e| Error::internal(format!("building seccomp filter: {e}")))?;
        filter.try_into().map_err(|e| Error::internal(format!("compiling seccomp filter: {e}")))
    }
}

impl Module for SeccompModule {
    fn name(&self) -> &'static str {
        "seccomp"
    }

    fn start_pre_exec_child(&self, c: &mut Compartment) -> HookOutcome {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return HookOutcome::Err(Error::kernel(nix::errno::Errno::last(), "setting no_new_privs"));
        }

        if c.config.seccomp_profile.is_none() {
            return HookOutcome::Done;
        }

        let program = match self.compile() {
            Ok(p) => p,
            Err(e) => return HookOutcome::Err(e),
        };
        if let Err(e) = seccompiler::apply_filter(&program) {
            return HookOutcome::Err(Error::internal(format!("applying seccomp filter: {e}")));
        }
        HookOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_allowlist_has_no_duplicate_entries() {
        let mut seen = std::collections::HashSet::new();
        for sc in SeccompModule::baseline_allowed_syscalls() {
            assert!(seen.insert(*sc), "duplicate syscall number {sc} in baseline");
        }
    }

    #[test]
    fn filter_compiles_on_the_host_architecture() {
        let module = SeccompModule::new(0);
        assert!(module.compile().is_ok());
    }
}
