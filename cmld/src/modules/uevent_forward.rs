use std::fs::File;
use std::os::unix::io::AsRawFd;

use nix::sched::{setns, CloneFlags};

use crate::error::{Error, Result};

/// Re-announces a physical network interface inside the compartment it
/// was just moved into (§4.4 rule 3d, §4.3 "uevent-forward"). Network
/// uevents follow the namespace a device lives in on current kernels, but
/// the device's `add` event already fired on the host before the move --
/// nothing inside the compartment's namespace ever saw it. Writing `add`
/// to the interface's own `uevent` sysfs attribute asks the kernel to
/// resend it, and doing that write from inside the target namespace (via
/// a temporary `setns`) is what makes the resend visible there instead of
/// on the host.
///
/// Single-threaded-only: `setns(CLONE_NEWNET)` changes the *calling
/// thread's* namespace. Called from the event loop's one thread, which
/// never touches the network stack for any other reason while this runs.
pub fn forward_into_netns(target_pid: i32, ifname: &str) -> Result<()> {
    let host_ns = File::open("/proc/self/ns/net")
        .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening host netns: {e}")))?;
    let target_ns_path = format!("/proc/{target_pid}/ns/net");
    let target_ns = File::open(&target_ns_path)
        .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening {target_ns_path}: {e}")))?;

    setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::kernel(e, "entering compartment net namespace"))?;

    let result = retrigger(ifname);

    // Always restore, even if the retrigger failed -- leaving the event
    // loop's thread stuck in a compartment's namespace would silently
    // break every other compartment's network hooks from then on.
    let restore = setns(host_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::kernel(e, "restoring host net namespace"));

    result.and(restore)
}

/// Writes the kernel's standard uevent replay trigger for a network
/// device. Must be called with the calling thread already inside the
/// namespace the interface lives in.
fn retrigger(ifname: &str) -> Result<()> {
    let path = format!("/sys/class/net/{ifname}/uevent");
    std::fs::write(&path, b"add")
        .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("writing {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_into_a_nonexistent_pid_is_a_kernel_error_not_a_panic() {
        let result = forward_into_netns(i32::MAX, "eth0");
        assert!(result.is_err());
    }
}
