use crate::compartment::Compartment;
use crate::error::Result;

/// A named lifecycle phase. Start runs these in order (with the fork
/// happening between `CloneePrep` and `ClonePostInChild`); stop runs
/// `Stop` then `Cleanup` in reverse registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Precheck,
    StopClean,
    SetupEarly,
    ClonePrep,
    ClonePostInChild,
    PostClone,
    StartPreExec,
    StartPreExecChild,
    StartPostExec,
    StartChildEarly,
    StartComplete,
    Stop,
    Freeze,
    Thaw,
    Cleanup,
}

impl Phase {
    /// Phases run during a forward start attempt, in order. Used by the
    /// engine to know which phases participate in rollback accounting.
    pub const START_SEQUENCE: &'static [Phase] = &[
        Phase::Precheck,
        Phase::StopClean,
        Phase::SetupEarly,
        Phase::ClonePrep,
        Phase::ClonePostInChild,
        Phase::PostClone,
        Phase::StartPreExec,
        Phase::StartPreExecChild,
        Phase::StartPostExec,
        Phase::StartChildEarly,
    ];
}

/// Outcome of a single hook invocation. `Pending` parks the compartment on
/// a continuation fd (e.g. the smartcard module awaiting an async reply)
/// until it becomes readable, at which point the engine resumes the same
/// phase from the same module (§9 "asynchronous hook completion").
pub enum HookOutcome {
    Done,
    Pending { continuation_fd: i32 },
    Err(crate::error::Error),
}

/// Uniform hook interface every C-module implements. Hooks not relevant to
/// a given module return `Done` unconditionally (a no-op participant).
/// `cleanup` must be total: it cannot refuse, matching §4.2's "cleanup
/// hooks must themselves be total."
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn precheck(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn stop_clean(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn setup_early(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn clone_prep(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn clone_post_in_child(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn post_clone(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn start_pre_exec(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn start_pre_exec_child(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn start_post_exec(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn start_child_early(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn start_complete(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }
    fn stop(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }

    /// Suspend a running compartment (§4.5 `freeze`). Only the cgroup
    /// module does real work here; every other module is a no-op
    /// participant, matching the rest of this trait's defaults.
    fn freeze(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }

    /// Resume a frozen compartment (§4.5 `unfreeze`).
    fn thaw(&self, _c: &mut Compartment) -> HookOutcome {
        HookOutcome::Done
    }

    /// Reverse-order teardown for whatever this module acquired in any
    /// forward phase. Total: must not fail.
    fn cleanup(&self, _c: &mut Compartment) {}

    fn run(&self, phase: Phase, c: &mut Compartment) -> HookOutcome {
        match phase {
            Phase::Precheck => self.precheck(c),
            Phase::StopClean => self.stop_clean(c),
            Phase::SetupEarly => self.setup_early(c),
            Phase::ClonePrep => self.clone_prep(c),
            Phase::ClonePostInChild => self.clone_post_in_child(c),
            Phase::PostClone => self.post_clone(c),
            Phase::StartPreExec => self.start_pre_exec(c),
            Phase::StartPreExecChild => self.start_pre_exec_child(c),
            Phase::StartPostExec => self.start_post_exec(c),
            Phase::StartChildEarly => self.start_child_early(c),
            Phase::StartComplete => self.start_complete(c),
            Phase::Stop => self.stop(c),
            Phase::Freeze => self.freeze(c),
            Phase::Thaw => self.thaw(c),
            Phase::Cleanup => {
                self.cleanup(c);
                HookOutcome::Done
            }
        }
    }
}

/// Name plus ordered registration. Order encodes subsystem dependencies
/// (uid mapping before volumes, volumes before network, cgroups before
/// capabilities, per §3 "Module descriptor").
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self { modules: Vec::new() }
    }

    /// Registers a module, returning its index (used as the per-module
    /// state slot index on every compartment).
    pub fn register(&mut self, module: Box<dyn Module>) -> usize {
        self.modules.push(module);
        self.modules.len() - 1
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref())
    }

    pub fn iter_rev(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().rev().map(|m| m.as_ref())
    }

    pub fn name_at(&self, idx: usize) -> &'static str {
        self.modules[idx].name()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn check_hook_result(r: HookOutcome) -> Result<std::result::Result<(), i32>> {
    match r {
        HookOutcome::Done => Ok(Ok(())),
        HookOutcome::Pending { continuation_fd } => Ok(Err(continuation_fd)),
        HookOutcome::Err(e) => Err(e),
    }
}
