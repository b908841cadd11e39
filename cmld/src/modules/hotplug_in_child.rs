use nix::mount::{mount, MsFlags};

use crate::compartment::Compartment;
use crate::error::Error;
use crate::registry::{HookOutcome, Module};

/// Gives the compartment its own `/sys` so that forwarded uevents
/// (§4.3 "uevent-forward") are actually observable from inside it --
/// `uevent_forward`'s sysfs write only reaches a namespace that has a
/// sysfs mount to begin with, and an overlay rootfs built from a bare
/// guest image doesn't carry one. Runs in the child, right after
/// `idshift`'s ownership remap and before `capabilities`/`seccomp`
/// narrow what the child can still do (mounting needs `CAP_SYS_ADMIN`,
/// which hasn't been dropped yet at this point in the child hardening
/// order).
pub struct HotplugInChildModule {
    idx: usize,
}

impl HotplugInChildModule {
    pub fn new(idx: usize) -> Self {
        Self { idx }
    }
}

impl Module for HotplugInChildModule {
    fn name(&self) -> &'static str {
        "hotplug_in_child"
    }

    fn start_pre_exec_child(&self, _c: &mut Compartment) -> HookOutcome {
        match mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None::<&str>) {
            Ok(()) => HookOutcome::Done,
            // already mounted (e.g. a guest image that ships its own) is
            // not a failure; anything else is.
            Err(nix::errno::Errno::EBUSY) => HookOutcome::Done,
            Err(e) => HookOutcome::Err(Error::kernel(e, "mounting /sys in compartment")),
        }
    }

    fn cleanup(&self, c: &mut Compartment) {
        let _ = c.take_module_state(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_is_hotplug_in_child() {
        let module = HotplugInChildModule::new(0);
        assert_eq!(module.name(), "hotplug_in_child");
    }
}
