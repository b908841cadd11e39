use crate::compartment::{Compartment, CompartmentArena};
use crate::error::{Error, Result};
use crate::hotplug::NetMover;
use crate::registry::{HookOutcome, Module};

/// Netlink operations the network module needs, both for the veth pair
/// it creates per compartment and for the hotplug coordinator's physical
/// interface moves (§4.3 "network", §4.4 rule 3). A trait for the same
/// reason as `hotplug`'s `DeviceCgroup`/`NetMover`: tests substitute a
/// fake instead of talking to a real kernel.
pub trait NetlinkBackend: Send + Sync {
    fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()>;
    fn set_ns_by_pid(&self, ifname: &str, pid: i32) -> Result<()>;
    fn set_up(&self, ifname: &str) -> Result<()>;
    fn add_addr(&self, ifname: &str, cidr: &str) -> Result<()>;
    fn rename(&self, old_name: &str, new_name: &str) -> Result<()>;
    fn set_ns_by_compartment_pid(&self, ifname: &str, pid: i32) -> Result<()> {
        self.set_ns_by_pid(ifname, pid)
    }
}

/// The real backend: bridges the module's synchronous hook interface to
/// `rtnetlink`'s async API by owning a small current-thread runtime and
/// blocking on each request. Each call is a handful of bounded netlink
/// round-trips at container start, not a hot path, so blocking the
/// calling (event loop) thread for the duration is the same trade the
/// rest of this module graph already makes for synchronous mount/ioctl
/// work (e.g. `volumes::VolumesModule`).
pub struct RtNetlinkBackend {
    rt: tokio::runtime::Runtime,
}

impl RtNetlinkBackend {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { rt: tokio::runtime::Builder::new_current_thread().enable_all().build()? })
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }
}

impl NetlinkBackend for RtNetlinkBackend {
    fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()> {
        self.block_on(async {
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening rtnetlink: {e}")))?;
            let task = tokio::spawn(conn);
            let result = handle
                .link()
                .add()
                .veth(host_name.to_string(), peer_name.to_string())
                .execute()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("creating veth pair: {e}")));
            task.abort();
            result
        })
    }

    fn set_ns_by_pid(&self, ifname: &str, pid: i32) -> Result<()> {
        self.block_on(async {
            use futures_util::TryStreamExt;
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening rtnetlink: {e}")))?;
            let task = tokio::spawn(conn);
            let link = handle
                .link()
                .get()
                .match_name(ifname.to_string())
                .execute()
                .try_next()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("looking up {ifname}: {e}")))?
                .ok_or_else(|| Error::internal(format!("interface {ifname} vanished before namespace move")))?;
            let result = handle
                .link()
                .set(link.header.index)
                .setns_by_pid(pid as u32)
                .execute()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("moving {ifname} into netns: {e}")));
            task.abort();
            result
        })
    }

    fn set_up(&self, ifname: &str) -> Result<()> {
        self.block_on(async {
            use futures_util::TryStreamExt;
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening rtnetlink: {e}")))?;
            let task = tokio::spawn(conn);
            let link = handle
                .link()
                .get()
                .match_name(ifname.to_string())
                .execute()
                .try_next()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("looking up {ifname}: {e}")))?
                .ok_or_else(|| Error::internal(format!("interface {ifname} not found")))?;
            let result = handle
                .link()
                .set(link.header.index)
                .up()
                .execute()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("bringing up {ifname}: {e}")));
            task.abort();
            result
        })
    }

    fn add_addr(&self, ifname: &str, cidr: &str) -> Result<()> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| Error::config_invalid(format!("malformed CIDR {cidr}")))?;
        let addr: std::net::IpAddr = addr
            .parse()
            .map_err(|_| Error::config_invalid(format!("malformed address {addr}")))?;
        let prefix: u8 =
            prefix.parse().map_err(|_| Error::config_invalid(format!("malformed prefix {prefix}")))?;
        self.block_on(async {
            use futures_util::TryStreamExt;
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening rtnetlink: {e}")))?;
            let task = tokio::spawn(conn);
            let link = handle
                .link()
                .get()
                .match_name(ifname.to_string())
                .execute()
                .try_next()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("looking up {ifname}: {e}")))?
                .ok_or_else(|| Error::internal(format!("interface {ifname} not found")))?;
            let result = handle
                .address()
                .add(link.header.index, addr, prefix)
                .execute()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("adding address to {ifname}: {e}")));
            task.abort();
            result
        })
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.block_on(async {
            use futures_util::TryStreamExt;
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("opening rtnetlink: {e}")))?;
            let task = tokio::spawn(conn);
            let link = handle
                .link()
                .get()
                .match_name(old_name.to_string())
                .execute()
                .try_next()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("looking up {old_name}: {e}")))?
                .ok_or_else(|| Error::internal(format!("interface {old_name} not found")))?;
            let result = handle
                .link()
                .set(link.header.index)
                .name(new_name.to_string())
                .execute()
                .await
                .map_err(|e| Error::kernel(nix::errno::Errno::EIO, format!("renaming {old_name}: {e}")));
            task.abort();
            result
        })
    }
}

struct NetworkState {
    host_ifname: String,
    peer_ifname: String,
}

/// Creates a virtual ethernet pair per compartment, moves one end into
/// the child's net namespace, and configures addresses from the
/// compartment's registered net mappings (§4.3 "network").
pub struct NetworkModule {
    idx: usize,
    backend: Box<dyn NetlinkBackend>,
}

impl NetworkModule {
    pub fn new(idx: usize, backend: Box<dyn NetlinkBackend>) -> Self {
        Self { idx, backend }
    }
}

impl Module for NetworkModule {
    fn name(&self) -> &'static str {
        "network"
    }

    /// Runs once the child exists (needs its pid to move the peer end
    /// into its net namespace), after `volumes` and before `cgroup` per
    /// the registration order in §3.
    fn post_clone(&self, c: &mut Compartment) -> HookOutcome {
        let Some(pid) = c.child_pid else {
            return HookOutcome::Err(Error::internal("network.post_clone ran before the child was forked"));
        };
        let host_ifname = format!("cmlv{}h", short_id(&c.uuid));
        let peer_ifname = format!("cmlv{}c", short_id(&c.uuid));

        if let Err(e) = self.backend.create_veth(&host_ifname, &peer_ifname) {
            return HookOutcome::Err(e);
        }
        if let Err(e) = self.backend.set_ns_by_pid(&peer_ifname, pid) {
            return HookOutcome::Err(e);
        }
        if let Err(e) = self.backend.set_up(&host_ifname) {
            return HookOutcome::Err(e);
        }

        c.net_interfaces.push(host_ifname.clone());
        c.set_module_state(self.idx, Box::new(NetworkState { host_ifname, peer_ifname }));
        HookOutcome::Done
    }

    fn cleanup(&self, c: &mut Compartment) {
        if let Some(state) = c.take_module_state(self.idx) {
            if let Ok(state) = state.downcast::<NetworkState>() {
                c.net_interfaces.retain(|n| n != &state.host_ifname);
                // the peer end disappears with the child's net namespace
                // once it's reaped; the host end is a dangling veth
                // endpoint the kernel also tears down automatically, but
                // an explicit delete keeps restart races from colliding
                // on the same name before that happens.
                let _ = self.backend.rename(&state.host_ifname, &format!("{}-dead", state.host_ifname));
                let _ = state.peer_ifname;
            }
        }
    }
}

/// Adapts `NetlinkBackend` to the hotplug coordinator's `NetMover` trait
/// for physical interface moves (§4.4 rule 3). Kept separate from
/// `NetworkModule`, which only ever moves its own veth peer into the
/// child it just forked: a physical interface's destination compartment
/// isn't known until the coordinator matches a uevent against a mapping,
/// so this resolves the target pid through the arena at the point of use
/// instead of baking one compartment's pid into the module at register
/// time.
pub struct PhysicalNetMover<'a> {
    backend: &'a dyn NetlinkBackend,
    arena: &'a CompartmentArena,
}

impl<'a> PhysicalNetMover<'a> {
    pub fn new(backend: &'a dyn NetlinkBackend, arena: &'a CompartmentArena) -> Self {
        Self { backend, arena }
    }
}

impl<'a> NetMover for PhysicalNetMover<'a> {
    fn rename(&mut self, old_name: &str, new_name: &str) {
        if let Err(e) = self.backend.rename(old_name, new_name) {
            tracing::warn!(old_name, new_name, error = %e, "failed to rename physical interface");
        }
    }

    fn move_to_ns(&mut self, ifname: &str, compartment: uuid::Uuid) {
        let Some(c) = self.arena.get(&compartment) else {
            tracing::warn!(ifname, %compartment, "move target vanished before namespace move");
            return;
        };
        let Some(pid) = c.child_pid else {
            tracing::warn!(ifname, %compartment, "move target has no running child yet, dropping physical interface move");
            return;
        };
        if let Err(e) = self.backend.set_ns_by_pid(ifname, pid) {
            tracing::warn!(ifname, pid, error = %e, "moving physical interface into compartment net namespace");
        }
    }
}

fn short_id(uuid: &uuid::Uuid) -> String {
    uuid.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;
    use std::sync::{Arc, Mutex};

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

    #[derive(Default, Clone)]
    struct FakeNetlink {
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Arc<Mutex<Option<String>>>,
    }

    impl FakeNetlink {
        fn record(&self, call: impl Into<String>) -> Result<()> {
            let call = call.into();
            if self.fail_on.lock().unwrap().as_deref() == Some(call.as_str()) {
                return Err(Error::kernel(nix::errno::Errno::EIO, "simulated failure"));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl NetlinkBackend for FakeNetlink {
        fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()> {
            self.record(format!("create_veth {host_name} {peer_name}"))
        }
        fn set_ns_by_pid(&self, ifname: &str, pid: i32) -> Result<()> {
            self.record(format!("set_ns_by_pid {ifname} {pid}"))
        }
        fn set_up(&self, ifname: &str) -> Result<()> {
            self.record(format!("set_up {ifname}"))
        }
        fn add_addr(&self, ifname: &str, cidr: &str) -> Result<()> {
            self.record(format!("add_addr {ifname} {cidr}"))
        }
        fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.record(format!("rename {old_name} {new_name}"))
        }
    }

    #[test]
    fn post_clone_without_child_pid_is_internal_error() {
        let module = NetworkModule::new(0, Box::new(FakeNetlink::default()));
        let mut c = Compartment::new("c1", cfg(), 1);
        assert!(matches!(module.post_clone(&mut c), HookOutcome::Err(_)));
    }

    #[test]
    fn post_clone_creates_veth_moves_peer_and_ups_host_side() {
        let backend = FakeNetlink::default();
        let module = NetworkModule::new(0, Box::new(backend.clone()));
        let mut c = Compartment::new("c1", cfg(), 1);
        c.child_pid = Some(999);

        assert!(matches!(module.post_clone(&mut c), HookOutcome::Done));
        assert_eq!(c.net_interfaces.len(), 1);
        let calls = backend.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("create_veth")));
        assert!(calls.iter().any(|c| c.contains("999")));
        assert!(calls.iter().any(|c| c.starts_with("set_up")));
    }

    #[test]
    fn physical_net_mover_resolves_pid_through_the_arena() {
        let backend = FakeNetlink::default();
        let mut arena = CompartmentArena::default();
        let mut c = Compartment::new("c2", cfg(), 0);
        c.child_pid = Some(4242);
        let owner = c.uuid;
        arena.insert(c);

        let mut mover = PhysicalNetMover::new(&backend, &arena);
        mover.rename("eth7", "cmleth0");
        mover.move_to_ns("cmleth0", owner);

        let calls = backend.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "rename eth7 cmleth0"));
        assert!(calls.iter().any(|c| c == "set_ns_by_pid cmleth0 4242"));
    }

    #[test]
    fn physical_net_mover_drops_move_for_compartment_without_a_child() {
        let backend = FakeNetlink::default();
        let mut arena = CompartmentArena::default();
        let c = Compartment::new("c2", cfg(), 0);
        let owner = c.uuid;
        arena.insert(c);

        let mut mover = PhysicalNetMover::new(&backend, &arena);
        mover.move_to_ns("cmleth0", owner);
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_the_host_interface_from_the_compartment_record() {
        let backend = FakeNetlink::default();
        let module = NetworkModule::new(0, Box::new(backend.clone()));
        let mut c = Compartment::new("c1", cfg(), 1);
        c.child_pid = Some(999);
        module.post_clone(&mut c);
        assert_eq!(c.net_interfaces.len(), 1);
        module.cleanup(&mut c);
        assert!(c.net_interfaces.is_empty());
    }
}
