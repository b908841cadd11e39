use std::any::Any;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompartmentState {
    Stopped,
    Starting,
    Booting,
    Running,
    Freezing,
    Frozen,
    ShuttingDown,
    Zombie,
    Rebooting,
    Setup,
}

impl CompartmentState {
    /// The state machine of §3. `true` iff `(from, to)` is a defined
    /// transition. Every other pair is an explicit no-op: callers must
    /// reply with an error rather than silently mutating state (testable
    /// property 6, "state-machine totality").
    pub fn can_transition(self, to: CompartmentState) -> bool {
        use CompartmentState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Booting)
                | (Booting, Running)
                | (Running, Freezing)
                | (Freezing, Frozen)
                | (Frozen, Running)
                | (Starting, ShuttingDown)
                | (Booting, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
                | (ShuttingDown, Zombie)
                | (Running, Rebooting)
                | (Rebooting, Starting)
                | (Setup, Stopped)
        )
    }

    /// States in which a hotplug move onto this compartment's net namespace
    /// is permitted (§4.4 precondition 4).
    pub fn accepts_hotplug(self) -> bool {
        matches!(self, CompartmentState::Starting | CompartmentState::Booting | CompartmentState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbKind {
    Generic,
    Token,
}

/// (vendor id, product id, serial string, kind, assign-flag) owned by
/// exactly one compartment, enriched with (major, minor) once the matching
/// device appears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbMapping {
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub kind: UsbKind,
    pub assign: bool,
    pub owner: Uuid,
    pub devnum: Option<(u32, u32)>,
}

impl UsbMapping {
    pub fn matches_ids(&self, vendor: u16, product: u16, serial: &str) -> bool {
        self.vendor == vendor && self.product == product && self.serial == serial
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysNetConfig {
    pub name: String,
    pub mac_filter_bridge: bool,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// A 6-byte MAC address bound to a compartment, together with its physical
/// network configuration. A MAC appears in at most one mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetMapping {
    pub mac: [u8; 6],
    pub owner: Uuid,
    pub config: PhysNetConfig,
    /// True for mappings synthesized by the hotplug coordinator when no
    /// configured mapping matched an arriving interface (§4.4 rule 3e).
    pub ephemeral: bool,
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(out)
}

/// Immutable-after-start configuration snapshot. Decoded from the on-disk
/// configuration blob by an external collaborator in production; this
/// struct is the typed record it hands back (see `config::decode_blob`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentConfig {
    pub name: String,
    pub guestos: String,
    pub uid_range_len: u32,
    pub cgroup_memory_limit_bytes: Option<u64>,
    pub capabilities_allow: Vec<String>,
    pub seccomp_profile: Option<String>,
}

pub type ObserverFn = Box<dyn Fn(&Compartment, CompartmentState, CompartmentState) + Send>;

/// A long-lived compartment record: identity, state, configuration
/// snapshot, child PID once forked, uid-mapping descriptor, assigned
/// devices, per-module opaque state, and observers. Mutated only by the
/// lifecycle engine and the hotplug coordinator.
pub struct Compartment {
    pub uuid: Uuid,
    pub name: String,
    pub state: CompartmentState,
    pub config: CompartmentConfig,
    pub child_pid: Option<i32>,
    pub uid_map: Option<(u32, u32, u32)>,
    pub net_interfaces: Vec<String>,
    pub usb_mappings: Vec<(u16, u16, String)>,
    /// Set by `volumes` once the rootfs overlay is mounted; read by
    /// `idshift` to know what tree to remap. A shared field rather than a
    /// cross-module state lookup, like `child_pid` and `uid_map`.
    pub rootfs_mount_point: Option<std::path::PathBuf>,
    /// The parent/child handoff pipes of §4.2: `service` opens both pairs
    /// in `clone_prep`, before the fork, so they're inherited by the
    /// child; `run` blocks the child on `release_read` and execs once it
    /// reads EOF (the parent closed `release_write`), then the child
    /// writes one byte to `ready_write` once its own hooks are done.
    /// Shared fields rather than a module-state lookup because both
    /// `service` and `run` need them, like `child_pid`/`uid_map`.
    pub release_pipe: Option<(std::os::unix::io::RawFd, std::os::unix::io::RawFd)>,
    pub ready_pipe: Option<(std::os::unix::io::RawFd, std::os::unix::io::RawFd)>,
    /// One slot per registered module, indexed by registration order.
    module_state: Vec<Option<Box<dyn Any + Send>>>,
    observers: Vec<ObserverFn>,
}

impl Compartment {
    pub fn new(name: impl Into<String>, config: CompartmentConfig, module_count: usize) -> Self {
        let mut module_state = Vec::with_capacity(module_count);
        module_state.resize_with(module_count, || None);
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            state: CompartmentState::Stopped,
            config,
            child_pid: None,
            uid_map: None,
            net_interfaces: Vec::new(),
            usb_mappings: Vec::new(),
            rootfs_mount_point: None,
            release_pipe: None,
            ready_pipe: None,
            module_state,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, f: ObserverFn) {
        self.observers.push(f);
    }

    /// Perform `(state -> to)` if defined, notifying observers
    /// synchronously with the post-transition state. Observers must not
    /// themselves trigger a transition on this compartment (§3, §5); this
    /// is enforced here by snapshotting the observer list before
    /// invocation so a reentrant call can't mutate it mid-notify, but a
    /// reentrant *transition* is still a caller bug the engine must avoid.
    pub fn transition(&mut self, to: CompartmentState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::precondition(format!(
                "no transition {:?} -> {:?} for compartment {}",
                self.state, to, self.uuid
            )));
        }
        let from = self.state;
        self.state = to;
        for obs in &self.observers {
            obs(self, from, to);
        }
        Ok(())
    }

    pub fn module_state(&self, idx: usize) -> Option<&(dyn Any + Send)> {
        self.module_state.get(idx).and_then(|s| s.as_deref())
    }

    pub fn module_state_mut(&mut self, idx: usize) -> &mut Option<Box<dyn Any + Send>> {
        &mut self.module_state[idx]
    }

    pub fn set_module_state(&mut self, idx: usize, state: Box<dyn Any + Send>) {
        self.module_state[idx] = Some(state);
    }

    pub fn take_module_state(&mut self, idx: usize) -> Option<Box<dyn Any + Send>> {
        self.module_state[idx].take()
    }
}

/// Arena of all known compartments, keyed by UUID (§9: cyclic references
/// between a compartment and its hotplug mappings are modeled via stable
/// UUID lookup, never a direct pointer).
#[derive(Default)]
pub struct CompartmentArena {
    pub by_uuid: HashMap<Uuid, Compartment>,
}

impl CompartmentArena {
    pub fn insert(&mut self, c: Compartment) -> Uuid {
        let id = c.uuid;
        self.by_uuid.insert(id, c);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<&Compartment> {
        self.by_uuid.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Compartment> {
        self.by_uuid.get_mut(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Compartment> {
        self.by_uuid.values().find(|c| c.name == name)
    }

    /// Remove a compartment record. Only valid once stopped (§3).
    pub fn remove(&mut self, id: &Uuid) -> Result<Compartment> {
        let c = self
            .by_uuid
            .get(id)
            .ok_or_else(|| Error::precondition(format!("no such compartment {id}")))?;
        if c.state != CompartmentState::Stopped {
            return Err(Error::precondition(format!(
                "cannot remove compartment {id} in state {:?}",
                c.state
            )));
        }
        Ok(self.by_uuid.remove(id).expect("checked above"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn totality_every_pair_is_defined_or_rejected() {
        use CompartmentState::*;
        let all = [
            Stopped, Starting, Booting, Running, Freezing, Frozen, ShuttingDown, Zombie,
            Rebooting, Setup,
        ];
        // every pair either transitions or is rejected -- there is no third
        // outcome, so this just documents the reachable pairs rather than
        // panicking; the property under test is that `can_transition`
        // never panics and always returns a bool (trivially true in Rust,
        // but this walks every pair to guard against a future match arm
        // that forgets a variant and silently falls through to `false`
        // for a pair that should be allowed).
        let mut any_true = false;
        for a in all {
            for b in all {
                if a.can_transition(b) {
                    any_true = true;
                }
            }
        }
        assert!(any_true);
    }

    #[test]
    fn start_stop_cycle() {
        let mut c = Compartment::new("c1", cfg(), 0);
        assert_eq!(c.state, CompartmentState::Stopped);
        c.transition(CompartmentState::Starting).unwrap();
        c.transition(CompartmentState::Booting).unwrap();
        c.transition(CompartmentState::Running).unwrap();
        c.transition(CompartmentState::ShuttingDown).unwrap();
        c.transition(CompartmentState::Stopped).unwrap();
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut c = Compartment::new("c1", cfg(), 0);
        let err = c.transition(CompartmentState::Running).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::PreconditionFailed(_)));
        assert_eq!(c.state, CompartmentState::Stopped);
    }

    #[test]
    fn freeze_thaw_roundtrip() {
        let mut c = Compartment::new("c1", cfg(), 0);
        c.transition(CompartmentState::Starting).unwrap();
        c.transition(CompartmentState::Booting).unwrap();
        c.transition(CompartmentState::Running).unwrap();
        c.transition(CompartmentState::Freezing).unwrap();
        c.transition(CompartmentState::Frozen).unwrap();
        c.transition(CompartmentState::Running).unwrap();
    }

    #[test]
    fn observers_see_post_transition_state_in_order() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        let mut c = Compartment::new("c1", cfg(), 0);
        c.add_observer(Box::new(move |_c, _from, to| {
            seen_a.lock().unwrap().push(("A", to));
        }));
        c.add_observer(Box::new(move |_c, _from, to| {
            seen_b.lock().unwrap().push(("B", to));
        }));
        c.transition(CompartmentState::Starting).unwrap();
        let log = seen.lock().unwrap();
        assert_eq!(log.as_slice(), &[("A", CompartmentState::Starting), ("B", CompartmentState::Starting)]);
    }

    #[test]
    fn mac_formatting_roundtrip() {
        let mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
        let s = format_mac(&mac);
        assert_eq!(s, "02:00:00:00:00:01");
        assert_eq!(parse_mac(&s).unwrap(), mac);
    }

    #[test]
    fn usb_mapping_match() {
        let m = UsbMapping {
            vendor: 0x1050,
            product: 0x0407,
            serial: "0001".into(),
            kind: UsbKind::Token,
            assign: true,
            owner: Uuid::new_v4(),
            devnum: None,
        };
        assert!(m.matches_ids(0x1050, 0x0407, "0001"));
        assert!(!m.matches_ids(0x1050, 0x0407, "0002"));
    }
}
