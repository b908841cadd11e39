use std::os::unix::io::RawFd;

use nix::unistd::{close, pipe, write};

use crate::compartment::Compartment;
use crate::error::{Error, Result};
use crate::registry::{HookOutcome, Module};

/// Opens the two pipes that realize §4.2's parent/child handoff and
/// releases/signals on them at the right phases. Registered early (before
/// `run`, which does the actual fork) so both pairs exist and are
/// inherited by the child at fork time.
pub struct ServiceModule {
    idx: usize,
}

struct ServiceState {
    // kept only so `cleanup` can close whichever ends the parent still
    // holds; the child's copies are closed by the child process exiting.
    release_write: RawFd,
    ready_read: RawFd,
}

impl ServiceModule {
    pub fn new(idx: usize) -> Self {
        Self { idx }
    }
}

impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn clone_prep(&self, c: &mut Compartment) -> HookOutcome {
        let (release_read, release_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => return HookOutcome::Err(Error::kernel(e, "creating release pipe")),
        };
        let (ready_read, ready_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                let _ = close(release_read);
                let _ = close(release_write);
                return HookOutcome::Err(Error::kernel(e, "creating ready pipe"));
            }
        };
        c.release_pipe = Some((release_read, release_write));
        c.ready_pipe = Some((ready_read, ready_write));
        c.set_module_state(self.idx, Box::new(ServiceState { release_write, ready_read }));
        HookOutcome::Done
    }

    /// Parent side, after every module's `start_pre_exec` has succeeded:
    /// closing our end of the release pipe is the signal that unblocks
    /// the child's read in `run`'s child bootstrap (§4.2 "the parent
    /// closes the pipe to release the child").
    fn start_post_exec(&self, c: &mut Compartment) -> HookOutcome {
        if let Some((_, write_fd)) = c.release_pipe.take() {
            let _ = close(write_fd);
        }
        HookOutcome::Done
    }

    /// Waits for the child's one-byte readiness signal (§4.2 "the child
    /// signals readiness after it completes its own hooks"). The engine
    /// parks the compartment on `ready_read` via `Pending` until the fd
    /// becomes readable, then re-enters this same phase to consume it.
    fn start_complete(&self, c: &mut Compartment) -> HookOutcome {
        let Some((read_fd, _)) = c.ready_pipe else {
            return HookOutcome::Err(Error::internal("start_complete ran before clone_prep"));
        };
        let mut buf = [0u8; 1];
        match nix::unistd::read(read_fd, &mut buf) {
            Ok(0) => HookOutcome::Err(Error::internal("child exited before signaling readiness")),
            Ok(_) => {
                let _ = close(read_fd);
                c.ready_pipe = None;
                HookOutcome::Done
            }
            Err(nix::errno::Errno::EAGAIN) => HookOutcome::Pending { continuation_fd: read_fd },
            Err(e) => HookOutcome::Err(Error::kernel(e, "reading child readiness pipe")),
        }
    }

    fn cleanup(&self, c: &mut Compartment) {
        if let Some(state) = c.take_module_state(self.idx) {
            if let Ok(state) = state.downcast::<ServiceState>() {
                let _ = close(state.release_write);
                let _ = close(state.ready_read);
            }
        }
        if let Some((_, write_fd)) = c.release_pipe.take() {
            let _ = close(write_fd);
        }
        if let Some((read_fd, _)) = c.ready_pipe.take() {
            let _ = close(read_fd);
        }
    }
}

/// Writes the one-byte readiness signal from inside the child and closes
/// both of its pipe ends. Called by `run`'s child bootstrap, not by the
/// engine (the child never re-enters the engine's phase loop).
pub fn signal_ready(ready_write: RawFd) -> Result<()> {
    write(unsafe { std::os::fd::BorrowedFd::borrow_raw(ready_write) }, &[1u8])
        .map(|_| ())
        .map_err(|e| Error::kernel(e, "signaling child readiness"))?;
    let _ = close(ready_write);
    Ok(())
}

/// Blocks until the parent closes the release pipe, from inside the
/// child. A short read of `0` is the expected release signal (EOF); any
/// actual byte would be a protocol violation, but we still proceed --
/// there's nothing left to negotiate by that point.
pub fn wait_for_release(release_read: RawFd) {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(release_read, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    let _ = close(release_read);
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
            cgroup_memory_limit_bytes: None,
            capabilities_allow: vec![],
            seccomp_profile: None,
        }
    }

    #[test]
    fn clone_prep_opens_both_pipe_pairs() {
        let module = ServiceModule::new(0);
        let mut c = Compartment::new("c1", cfg(), 1);
        assert!(matches!(module.clone_prep(&mut c), HookOutcome::Done));
        assert!(c.release_pipe.is_some());
        assert!(c.ready_pipe.is_some());
        module.cleanup(&mut c);
    }

    #[test]
    fn start_complete_waits_until_child_signals_then_succeeds() {
        let module = ServiceModule::new(0);
        let mut c = Compartment::new("c1", cfg(), 1);
        module.clone_prep(&mut c);
        let (_, ready_write) = c.ready_pipe.unwrap();

        // not signaled yet: nonblocking read would return EAGAIN in a
        // real fd; here the pipe hasn't been set nonblocking so this test
        // only exercises the success path after signaling.
        signal_ready(ready_write).unwrap();
        assert!(matches!(module.start_complete(&mut c), HookOutcome::Done));
    }

    #[test]
    fn start_post_exec_closes_release_write_end() {
        let module = ServiceModule::new(0);
        let mut c = Compartment::new("c1", cfg(), 1);
        module.clone_prep(&mut c);
        assert!(matches!(module.start_post_exec(&mut c), HookOutcome::Done));
        assert!(c.release_pipe.is_none());
        module.cleanup(&mut c);
    }
}
