use crate::compartment::Compartment;
use crate::error::Error;
use crate::registry::{HookOutcome, Module};

/// Capability name -> bit number, per `capability(7)`. No crate in this
/// repo's dependency pack wraps `prctl(PR_CAPBSET_DROP, ...)` (unlike
/// `nix::sys::prctl::set_name`/`set_pdeathsig`, which do exist), so this
/// reaches for the raw syscall the same way `idshift.rs` does for
/// `mount_setattr(2)`.
const KNOWN_CAPS: &[(&str, i32)] = &[
    ("CAP_CHOWN", 0),
    ("CAP_DAC_OVERRIDE", 1),
    ("CAP_DAC_READ_SEARCH", 2),
    ("CAP_FOWNER", 3),
    ("CAP_FSETID", 4),
    ("CAP_KILL", 5),
    ("CAP_SETGID", 6),
    ("CAP_SETUID", 7),
    ("CAP_SETPCAP", 8),
    ("CAP_LINUX_IMMUTABLE", 9),
    ("CAP_NET_BIND_SERVICE", 10),
    ("CAP_NET_BROADCAST", 11),
    ("CAP_NET_ADMIN", 12),
    ("CAP_NET_RAW", 13),
    ("CAP_IPC_LOCK", 14),
    ("CAP_IPC_OWNER", 15),
    ("CAP_SYS_MODULE", 16),
    ("CAP_SYS_RAWIO", 17),
    ("CAP_SYS_CHROOT", 18),
    ("CAP_SYS_PTRACE", 19),
    ("CAP_SYS_PACCT", 20),
    ("CAP_SYS_ADMIN", 21),
    ("CAP_SYS_BOOT", 22),
    ("CAP_SYS_NICE", 23),
    ("CAP_SYS_RESOURCE", 24),
    ("CAP_SYS_TIME", 25),
    ("CAP_SYS_TTY_CONFIG", 26),
    ("CAP_MKNOD", 27),
    ("CAP_LEASE", 28),
    ("CAP_AUDIT_WRITE", 29),
    ("CAP_AUDIT_CONTROL", 30),
    ("CAP_SETFCAP", 31),
    ("CAP_MAC_OVERRIDE", 32),
    ("CAP_MAC_ADMIN", 33),
    ("CAP_SYSLOG", 34),
    ("CAP_WAKE_ALARM", 35),
    ("CAP_BLOCK_SUSPEND", 36),
    ("CAP_AUDIT_READ", 37),
    ("CAP_PERFMON", 38),
    ("CAP_BPF", 39),
    ("CAP_CHECKPOINT_RESTORE", 40),
];

fn cap_number(name: &str) -> Option<i32> {
    KNOWN_CAPS.iter().find(|(n, _)| *n == name).map(|(_, n)| *n)
}

/// Drops every bounding-set capability not named in
/// `CompartmentConfig::capabilities_allow` (§4.3 "capabilities"). Runs in
/// the child, after `clone_post_in_child`'s `unshare` and before the
/// `exec` into the guest init binary -- dropping from the bounding set is
/// only meaningful before the final `execve`, since `execve` recomputes
/// the permitted/effective sets from the (now-shrunk) bounding set and
/// the file capabilities on the executed binary.
pub struct CapabilitiesModule {
    idx: usize,
}

impl CapabilitiesModule {
    pub fn new(idx: usize) -> Self {
        Self { idx }
    }
}

impl Module for CapabilitiesModule {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn start_pre_exec_child(&self, c: &mut Compartment) -> HookOutcome {
        let allow = &c.config.capabilities_allow;
        for (name, num) in KNOWN_CAPS {
            if allow.iter().any(|a| a == name) {
                continue;
            }
            let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, *num, 0, 0, 0) };
            if rc != 0 {
                let errno = nix::errno::Errno::last();
                // EINVAL on a kernel that doesn't know this bit yet is
                // expected on older kernels for the newest capabilities
                // (CAP_CHECKPOINT_RESTORE and newer); anything else is
                // a real failure to shrink the bounding set.
                if errno != nix::errno::Errno::EINVAL {
                    return HookOutcome::Err(Error::kernel(errno, format!("dropping {name} from bounding set")));
                }
            }
        }
        HookOutcome::Done
    }

    fn cleanup(&self, c: &mut Compartment) {
        let _ = c.take_module_state(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_name_in_allow_list_is_ignored_not_fatal() {
        // a typo'd or forward-looking capability name in the allow list
        // shouldn't break the drop loop; it simply never matches anything
        // in KNOWN_CAPS, so nothing is spared that wasn't already going
        // to be dropped anyway.
        let allow = vec!["CAP_NOT_A_REAL_CAP".to_string()];
        assert!(cap_number(&allow[0]).is_none());
    }

    #[test]
    fn every_known_cap_has_a_unique_number() {
        let mut seen = std::collections::HashSet::new();
        for (_, num) in KNOWN_CAPS {
            assert!(seen.insert(*num), "duplicate capability number {num}");
        }
    }

    #[test]
    fn cap_lookup_resolves_known_names() {
        assert_eq!(cap_number("CAP_SYS_ADMIN"), Some(21));
        assert_eq!(cap_number("CAP_CHOWN"), Some(0));
    }
}
