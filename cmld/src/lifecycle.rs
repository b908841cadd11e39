use tracing::{error, info, warn};

use crate::compartment::{Compartment, CompartmentState};
use crate::error::{Error, Result};
use crate::registry::{check_hook_result, ModuleRegistry, Phase};

/// Drives one compartment through phased start/stop/reboot, invoking
/// module hooks in registry order and unwinding in reverse on failure
/// (§4.2). Stateless across compartments: all per-compartment progress
/// lives on the `Compartment` record itself, so the engine can interleave
/// work across many compartments on one event loop without any lock.
pub struct LifecycleEngine<'a> {
    pub modules: &'a ModuleRegistry,
}

/// Outcome of a start attempt, distinguishing "parked waiting on a
/// continuation fd" from completion so the event loop knows whether to
/// register a watch or move on. `phase_idx` is the position of `phase`
/// within `Phase::START_SEQUENCE`, passed back to `LifecycleEngine::resume`
/// once the continuation fd becomes readable so the engine can continue
/// the sequence from exactly where it suspended instead of restarting it.
pub enum StartOutcome {
    Running,
    Pending { phase: Phase, phase_idx: usize, module_idx: usize, continuation_fd: i32 },
    Failed(Error),
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(modules: &'a ModuleRegistry) -> Self {
        Self { modules }
    }

    /// Runs one phase across every registered module in order. Returns the
    /// index of the first module that didn't return `Done` (for use by the
    /// caller to compute the rollback set), or `None` if every module
    /// completed.
    fn run_phase_forward(&self, phase: Phase, c: &mut Compartment) -> Result<Option<(usize, i32)>> {
        for (idx, module) in self.modules.iter().enumerate() {
            let outcome = module.run(phase, c);
            match check_hook_result(outcome)? {
                Ok(()) => continue,
                Err(continuation_fd) => return Ok(Some((idx, continuation_fd))),
            }
        }
        Ok(None)
    }

    /// Runs `cleanup` on every module up to (and including) `up_to_idx` in
    /// the *current* phase, in reverse registration order, then on every
    /// module for every phase that fully completed before this one. Total:
    /// cleanup cannot fail, so this never returns an error (§4.2).
    fn rollback(&self, c: &mut Compartment) {
        // Cleanup hooks are idempotent no-ops for modules that never ran a
        // forward hook on this compartment (their state slot is `None`);
        // invoking cleanup unconditionally in reverse order is therefore
        // safe and matches "cleanup hooks must themselves be total."
        for module in self.modules.iter_rev() {
            module.cleanup(c);
        }
    }

    /// Drives a start attempt from `Stopped` through the full forward
    /// phase sequence. On any module failure, rolls back everything that
    /// had succeeded so far (in this attempt) in reverse registration
    /// order, and transitions the compartment back to `Stopped`.
    pub fn start(&self, c: &mut Compartment) -> StartOutcome {
        if let Err(e) = c.transition(CompartmentState::Starting) {
            return StartOutcome::Failed(e);
        }
        self.run_forward_from(0, c)
    }

    /// Continues a suspended start from `phase_idx` (as reported in the
    /// `Pending` outcome that suspended it), once the continuation fd has
    /// become readable. Does not re-run phases that already completed.
    pub fn resume(&self, c: &mut Compartment, phase_idx: usize) -> StartOutcome {
        self.run_forward_from(phase_idx, c)
    }

    fn run_forward_from(&self, start_idx: usize, c: &mut Compartment) -> StartOutcome {
        for (offset, &phase) in Phase::START_SEQUENCE[start_idx..].iter().enumerate() {
            match self.run_phase_forward(phase, c) {
                Ok(None) => continue,
                Ok(Some((idx, continuation_fd))) => {
                    // A module asked to suspend (e.g. smartcard awaiting
                    // a credential round-trip). Not a failure: the caller
                    // re-enters this phase later via `resume`.
                    return StartOutcome::Pending {
                        phase,
                        phase_idx: start_idx + offset,
                        module_idx: idx,
                        continuation_fd,
                    };
                }
                Err(e) => {
                    error!(uuid = %c.uuid, phase = ?phase, error = %e, "lifecycle phase failed, rolling back");
                    self.rollback(c);
                    let reaped = self.reap_child(c);
                    let target = if reaped { CompartmentState::Stopped } else { CompartmentState::Zombie };
                    // force-set: the compartment may be in Starting or
                    // Booting depending on how far it got; both transition
                    // to ShuttingDown then to the final target.
                    let _ = c.transition(CompartmentState::ShuttingDown);
                    let _ = c.transition(target);
                    return StartOutcome::Failed(e);
                }
            }
        }

        if let Err(e) = c.transition(CompartmentState::Booting) {
            return StartOutcome::Failed(e);
        }
        StartOutcome::Running
    }

    /// Attempt to reap the child process. Returns `true` if reaped (or
    /// there was never a child), `false` if the child is unreapable
    /// (surfaces as `ZOMBIE` per §3).
    fn reap_child(&self, c: &mut Compartment) -> bool {
        let Some(pid) = c.child_pid else { return true };
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                // best-effort SIGKILL then a second reap attempt.
                let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
                matches!(waitpid(Pid::from_raw(pid), None), Ok(_))
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Finishes the `start_complete` phase once the child has signaled
    /// readiness (its pipe write observed by the event loop). Transitions
    /// `Booting -> Running`.
    pub fn complete_start(&self, c: &mut Compartment) -> Result<()> {
        if let Some((idx, fd)) = self.run_phase_forward(Phase::StartComplete, c)? {
            return Err(Error::internal(format!(
                "module {} unexpectedly suspended start_complete on fd {}",
                self.modules.name_at(idx),
                fd
            )));
        }
        c.transition(CompartmentState::Running)
    }

    /// Stop: run every module's `stop` hook (best-effort, order
    /// preserved), then `cleanup` in reverse registration order, then
    /// settle in `Stopped` (or `Zombie` if the child could not be reaped).
    pub fn stop(&self, c: &mut Compartment) -> Result<()> {
        let from = c.state;
        if matches!(from, CompartmentState::Starting | CompartmentState::Booting | CompartmentState::Running) {
            c.transition(CompartmentState::ShuttingDown)?;
        } else if from != CompartmentState::ShuttingDown {
            return Err(Error::precondition(format!("cannot stop compartment in state {from:?}")));
        }

        for module in self.modules.iter() {
            if let crate::registry::HookOutcome::Err(e) = module.run(Phase::Stop, c) {
                warn!(uuid = %c.uuid, error = %e, "module stop hook failed, continuing teardown");
            }
        }
        self.rollback(c);

        let reaped = self.reap_child(c);
        c.child_pid = None;
        let target = if reaped { CompartmentState::Stopped } else { CompartmentState::Zombie };
        c.transition(target)
    }

    /// Freeze: `Running -> Freezing -> Frozen`, running every module's
    /// `freeze` hook in registration order (§4.5). Only the cgroup module
    /// does real work; a failure here leaves the compartment `Running`
    /// rather than half-frozen, since the freezer controller write is the
    /// only state change and it either lands or it doesn't.
    pub fn freeze(&self, c: &mut Compartment) -> Result<()> {
        c.transition(CompartmentState::Freezing)?;
        for module in self.modules.iter() {
            if let crate::registry::HookOutcome::Err(e) = module.run(Phase::Freeze, c) {
                let _ = c.transition(CompartmentState::Running);
                return Err(e);
            }
        }
        c.transition(CompartmentState::Frozen)
    }

    /// Unfreeze: `Frozen -> Running`, running every module's `thaw` hook in
    /// reverse registration order (mirroring `stop`/`cleanup`'s convention
    /// of unwinding in the opposite order work was applied).
    pub fn unfreeze(&self, c: &mut Compartment) -> Result<()> {
        for module in self.modules.iter_rev() {
            if let crate::registry::HookOutcome::Err(e) = module.run(Phase::Thaw, c) {
                warn!(uuid = %c.uuid, error = %e, "module thaw hook failed, continuing");
            }
        }
        c.transition(CompartmentState::Running)
    }

    /// Reboot: stop, then start again reusing the same configuration.
    pub fn reboot(&self, c: &mut Compartment) -> StartOutcome {
        if c.state == CompartmentState::Running {
            if let Err(e) = c.transition(CompartmentState::Rebooting) {
                return StartOutcome::Failed(e);
            }
        }
        if let Err(e) = self.stop(c) {
            return StartOutcome::Failed(e);
        }
        info!(uuid = %c.uuid, "rebooting compartment");
        self.start(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;
    use crate::registry::{HookOutcome, Module};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingModule {
        name: &'static str,
        fail_on: Option<Phase>,
        forward_count: Arc<AtomicUsize>,
        cleanup_count: Arc<AtomicUsize>,
    }

    impl Module for CountingModule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn precheck(&self, _c: &mut Compartment) -> HookOutcome {
            self.maybe_fail(Phase::Precheck)
        }
        fn setup_early(&self, _c: &mut Compartment) -> HookOutcome {
            self.maybe_fail(Phase::SetupEarly)
        }
        fn clone_prep(&self, _c: &mut Compartment) -> HookOutcome {
            self.maybe_fail(Phase::ClonePrep)
        }
        fn start_pre_exec(&self, _c: &mut Compartment) -> HookOutcome {
            self.maybe_fail(Phase::StartPreExec)
        }

        fn cleanup(&self, _c: &mut Compartment) {
            self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingModule {
        fn maybe_fail(&self, phase: Phase) -> HookOutcome {
            self.forward_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(phase) {
                HookOutcome::Err(Error::internal("injected failure"))
            } else {
                HookOutcome::Done
            }
        }
    }

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
    fn failed_start_rolls_back_every_module_exactly_once_and_ends_stopped() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct OrderTrackingModule {
            name: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
            fail: bool,
        }
        impl Module for OrderTrackingModule {
            fn name(&self) -> &'static str {
                self.name
            }
            fn setup_early(&self, _c: &mut Compartment) -> HookOutcome {
                if self.fail {
                    HookOutcome::Err(Error::internal("boom"))
                } else {
                    HookOutcome::Done
                }
            }
            fn cleanup(&self, _c: &mut Compartment) {
                self.order.lock().unwrap().push(self.name);
            }
        }

        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(OrderTrackingModule { name: "uidmap", order: order.clone(), fail: false }));
        registry.register(Box::new(OrderTrackingModule { name: "volumes", order: order.clone(), fail: true }));
        registry.register(Box::new(OrderTrackingModule { name: "network", order: order.clone(), fail: false }));

        let mut c = Compartment::new("c1", cfg(), registry.len());
        let engine = LifecycleEngine::new(&registry);
        match engine.start(&mut c) {
            StartOutcome::Failed(_) => {}
            _ => panic!("expected failure"),
        }

        assert_eq!(c.state, CompartmentState::Stopped);
        // every module's cleanup ran exactly once, in reverse registration
        // order, regardless of whether its forward hook ran or failed.
        assert_eq!(*order.lock().unwrap(), vec!["network", "volumes", "uidmap"]);
    }

    #[test]
    fn successful_cycle_forward_and_cleanup_counts_match() {
        let forward = Arc::new(AtomicUsize::new(0));
        let cleanup = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(CountingModule {
            name: "m1",
            fail_on: None,
            forward_count: forward.clone(),
            cleanup_count: cleanup.clone(),
        }));

        let mut c = Compartment::new("c1", cfg(), registry.len());
        let engine = LifecycleEngine::new(&registry);
        match engine.start(&mut c) {
            StartOutcome::Running => {}
            _ => panic!("expected running"),
        }
        assert_eq!(c.state, CompartmentState::Booting);
        engine.complete_start(&mut c).unwrap();
        assert_eq!(c.state, CompartmentState::Running);

        engine.stop(&mut c).unwrap();
        assert_eq!(c.state, CompartmentState::Stopped);

        // forward hooks ran at precheck, setup_early, clone_prep,
        // start_pre_exec = 4 invocations; cleanup ran once on stop.
        assert_eq!(forward.load(Ordering::SeqCst), 4);
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reboot_reuses_configuration() {
        let forward = Arc::new(AtomicUsize::new(0));
        let cleanup = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(CountingModule {
            name: "m1",
            fail_on: None,
            forward_count: forward.clone(),
            cleanup_count: cleanup.clone(),
        }));
        let mut c = Compartment::new("c1", cfg(), registry.len());
        let engine = LifecycleEngine::new(&registry);
        engine.start(&mut c);
        engine.complete_start(&mut c).unwrap();
        assert_eq!(c.state, CompartmentState::Running);

        match engine.reboot(&mut c) {
            StartOutcome::Running => {}
            _ => panic!("expected running after reboot"),
        }
        assert_eq!(c.state, CompartmentState::Booting);
        assert_eq!(c.config.name, "c1");
    }
}
