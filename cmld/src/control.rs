use uuid::Uuid;

use crate::compartment::CompartmentArena;
use crate::error::Error;
use crate::hotplug::HotplugCoordinator;
use crate::lifecycle::{LifecycleEngine, StartOutcome};
use crate::protocol::{CompartmentSummary, Reply, Request};

/// Turns one decoded `Request` into the core calls it names and a `Reply`
/// (§4.5). Holds no state of its own: every call borrows the arena,
/// lifecycle engine, and hotplug coordinator that own it, so this is a
/// thin dispatch table rather than a second copy of daemon state.
pub struct ControlFacade<'a> {
    pub arena: &'a mut CompartmentArena,
    pub engine: &'a LifecycleEngine<'a>,
    pub hotplug: &'a mut HotplugCoordinator,
}

impl<'a> ControlFacade<'a> {
    pub fn handle(&mut self, request: Request) -> Reply {
        match request {
            Request::List => self.list(),
            Request::Start { uuid } => self.start(uuid),
            Request::Stop { uuid } => self.stop(uuid),
            Request::Freeze { uuid } => self.freeze(uuid),
            Request::Unfreeze { uuid } => self.unfreeze(uuid),
            Request::Reboot { uuid } => self.reboot(uuid),
            Request::RegisterUsb { uuid, mapping } => self.register_usb(uuid, mapping),
            Request::UnregisterUsb { uuid, vendor, product, serial } => {
                self.unregister_usb(uuid, vendor, product, &serial)
            }
            Request::RegisterNet { uuid: _, mapping } => self.register_net(mapping),
            Request::UnregisterNet { uuid: _, mac } => self.unregister_net(mac),
            Request::AttachToken { uuid } => self.attach_token(uuid),
        }
    }

    fn list(&self) -> Reply {
        let compartments = self
            .arena
            .by_uuid
            .values()
            .map(|c| CompartmentSummary { uuid: c.uuid, name: c.name.clone(), state: c.state })
            .collect();
        Reply::List { compartments }
    }

    fn start(&mut self, uuid: Uuid) -> Reply {
        let Some(c) = self.arena.get_mut(&uuid) else { return not_found(uuid) };
        match self.engine.start(c) {
            StartOutcome::Running | StartOutcome::Pending { .. } => Reply::Pending,
            StartOutcome::Failed(e) => Reply::from(&e),
        }
    }

    fn stop(&mut self, uuid: Uuid) -> Reply {
        let Some(c) = self.arena.get_mut(&uuid) else { return not_found(uuid) };
        match self.engine.stop(c) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::from(&e),
        }
    }

    fn freeze(&mut self, uuid: Uuid) -> Reply {
        let Some(c) = self.arena.get_mut(&uuid) else { return not_found(uuid) };
        match self.engine.freeze(c) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::from(&e),
        }
    }

    fn unfreeze(&mut self, uuid: Uuid) -> Reply {
        let Some(c) = self.arena.get_mut(&uuid) else { return not_found(uuid) };
        match self.engine.unfreeze(c) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::from(&e),
        }
    }

    fn reboot(&mut self, uuid: Uuid) -> Reply {
        let Some(c) = self.arena.get_mut(&uuid) else { return not_found(uuid) };
        match self.engine.reboot(c) {
            StartOutcome::Running | StartOutcome::Pending { .. } => Reply::Pending,
            StartOutcome::Failed(e) => Reply::from(&e),
        }
    }

    fn register_usb(&mut self, uuid: Uuid, mapping: crate::compartment::UsbMapping) -> Reply {
        if self.arena.get(&uuid).is_none() {
            return not_found(uuid);
        }
        if let Err(msg) = self.hotplug.check_usb_invariant(&mapping) {
            return Reply::from(&Error::precondition(msg));
        }
        self.hotplug.register_usb(mapping);
        Reply::Ok
    }

    fn unregister_usb(&mut self, uuid: Uuid, vendor: u16, product: u16, serial: &str) -> Reply {
        self.hotplug.unregister_usb(uuid, vendor, product, serial);
        Reply::Ok
    }

    fn register_net(&mut self, mapping: crate::compartment::NetMapping) -> Reply {
        match self.hotplug.register_net(mapping) {
            Ok(()) => Reply::Ok,
            Err(msg) => Reply::from(&Error::precondition(msg)),
        }
    }

    fn unregister_net(&mut self, mac: [u8; 6]) -> Reply {
        self.hotplug.unregister_net(mac);
        Reply::Ok
    }

    /// §4.4 rule 1 out-of-band: a client asking the daemon to re-attempt a
    /// token wait immediately rather than waiting for the next debounce
    /// tick. The coordinator doesn't expose a direct "attach now" -- this
    /// just confirms the compartment exists; the actual attach still
    /// happens on the next `poll_token_wait` the event loop drives.
    fn attach_token(&mut self, uuid: Uuid) -> Reply {
        if self.arena.get(&uuid).is_none() {
            return not_found(uuid);
        }
        Reply::Ok
    }
}

fn not_found(uuid: Uuid) -> Reply {
    Reply::from(&Error::precondition(format!("no such compartment {uuid}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::{Compartment, CompartmentConfig};
    use crate::registry::ModuleRegistry;

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
    fn list_reports_every_compartment_in_the_arena() {
        let mut arena = CompartmentArena::default();
        let registry = ModuleRegistry::new();
        let engine = LifecycleEngine::new(&registry);
        let mut hotplug = HotplugCoordinator::new();
        arena.insert(Compartment::new("c1", cfg(), 0));
        arena.insert(Compartment::new("c2", cfg(), 0));

        let mut facade = ControlFacade { arena: &mut arena, engine: &engine, hotplug: &mut hotplug };
        match facade.handle(Request::List) {
            Reply::List { compartments } => assert_eq!(compartments.len(), 2),
            _ => panic!("expected a list reply"),
        }
    }

    #[test]
    fn start_on_unknown_uuid_is_a_precondition_error() {
        let mut arena = CompartmentArena::default();
        let registry = ModuleRegistry::new();
        let engine = LifecycleEngine::new(&registry);
        let mut hotplug = HotplugCoordinator::new();
        let mut facade = ControlFacade { arena: &mut arena, engine: &engine, hotplug: &mut hotplug };

        match facade.handle(Request::Start { uuid: Uuid::new_v4() }) {
            Reply::Err { kind, .. } => assert_eq!(kind, "precondition_failed"),
            _ => panic!("expected an error reply"),
        }
    }

    #[test]
    fn start_stop_cycle_through_the_facade() {
        let mut arena = CompartmentArena::default();
        let registry = ModuleRegistry::new();
        let engine = LifecycleEngine::new(&registry);
        let mut hotplug = HotplugCoordinator::new();
        let uuid = arena.insert(Compartment::new("c1", cfg(), registry.len()));

        let mut facade = ControlFacade { arena: &mut arena, engine: &engine, hotplug: &mut hotplug };
        assert!(matches!(facade.handle(Request::Start { uuid }), Reply::Pending));
        assert!(matches!(facade.handle(Request::Stop { uuid }), Reply::Ok));
    }

    #[test]
    fn register_usb_rejects_a_conflicting_token_owner() {
        let mut arena = CompartmentArena::default();
        let registry = ModuleRegistry::new();
        let engine = LifecycleEngine::new(&registry);
        let mut hotplug = HotplugCoordinator::new();
        let owner1 = arena.insert(Compartment::new("c1", cfg(), 0));
        let owner2 = arena.insert(Compartment::new("c2", cfg(), 0));

        let mapping = crate::compartment::UsbMapping {
            vendor: 0x1050,
            product: 0x0407,
            serial: "0001".into(),
            kind: crate::compartment::UsbKind::Token,
            assign: true,
            owner: owner1,
            devnum: None,
        };
        let mut facade = ControlFacade { arena: &mut arena, engine: &engine, hotplug: &mut hotplug };
        assert!(matches!(facade.handle(Request::RegisterUsb { uuid: owner1, mapping: mapping.clone() }), Reply::Ok));

        let conflict = crate::compartment::UsbMapping { owner: owner2, ..mapping };
        match facade.handle(Request::RegisterUsb { uuid: owner2, mapping: conflict }) {
            Reply::Err { kind, .. } => assert_eq!(kind, "precondition_failed"),
            _ => panic!("expected an error reply"),
        }
    }
}
