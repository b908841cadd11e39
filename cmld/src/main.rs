mod compartment;
mod config;
mod control;
mod credential;
mod error;
mod event_loop;
mod hotplug;
mod lifecycle;
mod modules;
mod persist;
mod protocol;
mod registry;
mod uevent;

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use compartment::CompartmentArena;
use config::DaemonConfig;
use control::ControlFacade;
use event_loop::{Event, EventLoop};
use hotplug::{HotplugCoordinator, HotplugTimer};
use lifecycle::LifecycleEngine;
use modules::{
    audit, cgroup::CgroupModule, capabilities::CapabilitiesModule,
    device_cgroup::{DeviceCgroupBackend, LoggingTokenSink},
    hotplug_in_child::HotplugInChildModule,
    idshift::IdShiftModule, network::{NetworkModule, PhysicalNetMover, RtNetlinkBackend}, run::RunModule,
    seccomp::SeccompModule, service::ServiceModule, smartcard::SmartcardModule, time::TimeModule,
    userns::UserNsModule, volumes::VolumesModule,
};
use protocol::{read_request, write_reply, Reply};
use registry::{Module, ModuleRegistry};

const DEFAULT_UID_RANGE_BASE: u32 = 100_000_000;
const DEFAULT_UID_RANGE_MAX: u32 = 4_000_000_000;

/// Builds the module graph in dependency order (§3 "Module descriptor"):
/// credentials before anything touches the rootfs, uid range before the
/// tree it shifts ownership on, volumes before idshift remaps them,
/// network and cgroup last among the parent-side setup, `service` right
/// before `run` since `run`'s `clone_prep` needs the handoff pipes
/// `service`'s own `clone_prep` opened. `capabilities`/`seccomp`/`time`/
/// `hotplug_in_child` are built here too, but handed to `RunModule` as
/// its `child_hardening` list instead of being registered -- registering
/// them would run their `start_pre_exec_child` hooks in the daemon's own
/// process, the bug `RunModule`'s doc comment warns against.
fn build_registry(config: &DaemonConfig, init_binary: PathBuf) -> anyhow::Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();

    let idx = registry.register(Box::new(SmartcardModule::new(0, config.credential_socket.clone())));
    let idx = registry.register(Box::new(UserNsModule::new(idx + 1, DEFAULT_UID_RANGE_BASE, DEFAULT_UID_RANGE_MAX)));
    let volumes_root = config.state_dir.clone();
    let idx = registry.register(Box::new(VolumesModule::new(idx + 1, volumes_root.join("images"), volumes_root.join("work"))));
    let idx = registry.register(Box::new(IdShiftModule::new(idx + 1)));
    let netlink = RtNetlinkBackend::new().map_err(|e| anyhow::anyhow!("opening rtnetlink backend: {e}"))?;
    let idx = registry.register(Box::new(NetworkModule::new(idx + 1, Box::new(netlink))));
    let idx = registry.register(Box::new(CgroupModule::new(idx + 1, config.cgroup_root.clone())));
    let service_idx = registry.register(Box::new(ServiceModule::new(idx + 1)));

    // `run`'s own slot comes next; the hardening modules aren't registered
    // at all (see doc comment above), so their slot numbers only need to
    // avoid colliding with `run`'s -- they never address into a
    // `Compartment`'s module-state vec through the engine.
    let run_idx = service_idx + 1;
    let hardening_base = run_idx + 1;
    let child_hardening: Vec<Arc<dyn Module>> = vec![
        Arc::new(HotplugInChildModule::new(hardening_base)),
        Arc::new(TimeModule::new(hardening_base + 1)),
        Arc::new(CapabilitiesModule::new(hardening_base + 2)),
        Arc::new(SeccompModule::new(hardening_base + 3)),
    ];
    registry.register(Box::new(RunModule::with_real_fork(run_idx, service_idx, init_binary, child_hardening)));

    Ok(registry)
}

/// Drains one `Event::FdReadable(uevent_fd)` into a decoded `Uevent` and
/// routes it through the hotplug coordinator (§4.4, §6). `device_cgroup`/
/// `net_mover`/`token_sink` are the real-kernel backends; tests exercise
/// `HotplugCoordinator` directly against fakes instead of going through
/// this function.
fn drain_uevent_socket(fd: RawFd) -> Vec<uevent::Uevent> {
    use nix::sys::socket::{recv, MsgFlags};
    let mut events = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(n) if n > 0 => events.push(uevent::Uevent::parse(&buf[..n])),
            _ => break,
        }
    }
    events
}

async fn handle_client(mut stream: UnixStream, arena: &mut CompartmentArena, engine: &LifecycleEngine<'_>, hotplug: &mut HotplugCoordinator) {
    let request = match read_request(&mut stream).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed control request, closing connection");
            return;
        }
    };

    let reply = {
        let mut facade = ControlFacade { arena, engine, hotplug };
        facade.handle(request)
    };

    if let Err(e) = write_reply(&mut stream, &reply).await {
        warn!(error = %e, "failed to write control reply");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/cmld.toml"));
    let config = match DaemonConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %config_path.display(), error = %e, "no usable daemon config, falling back to defaults");
            DaemonConfig::default()
        }
    };

    std::fs::create_dir_all(&config.socket_dir)?;
    std::fs::create_dir_all(&config.state_dir)?;

    let registry = build_registry(&config, PathBuf::from("/sbin/cml-init"))?;
    let engine = LifecycleEngine::new(&registry);
    let mut arena = CompartmentArena::default();
    let mut hotplug = HotplugCoordinator::new();

    let observer = audit::tracing_observer();
    let _ = &observer; // attached per-compartment as each one is created, not here

    let mut events = EventLoop::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    let uevent_fd = uevent::open_uevent_socket().map_err(|e| anyhow::anyhow!("opening uevent socket: {e}"))?;
    events.watch_fd_readable(uevent_fd, tx.clone())?;
    events.watch_sigchld(tx.clone())?;

    // A dedicated rtnetlink backend for the hotplug coordinator's physical
    // interface moves, separate from the one each `NetworkModule` call
    // site owns for its own veth pairs -- the coordinator's moves are
    // keyed by arbitrary, not-yet-known compartments, not one fixed at
    // module-registration time.
    let hotplug_netlink =
        RtNetlinkBackend::new().map_err(|e| anyhow::anyhow!("opening hotplug rtnetlink backend: {e}"))?;
    let mut token_sink = LoggingTokenSink;

    let control_socket_path = config.socket_dir.join("cml-control");
    let _ = std::fs::remove_file(&control_socket_path);
    let listener = UnixListener::bind(&control_socket_path)?;
    info!(path = %control_socket_path.display(), "listening for control connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => handle_client(stream, &mut arena, &engine, &mut hotplug).await,
                    Err(e) => error!(error = %e, "accepting control connection"),
                }
            }
            event = rx.recv() => {
                match event {
                    Some(Event::FdReadable(fd)) if fd == uevent_fd => {
                        for ev in drain_uevent_socket(fd) {
                            let subsystem = ev.subsystem.clone();
                            let action = ev.action;
                            match (subsystem.as_deref(), action) {
                                (Some("usb"), Some(uevent::UeventAction::Add)) => {
                                    let mut device_cgroup = DeviceCgroupBackend::new(&config.cgroup_root, &arena);
                                    hotplug.on_usb_add(&ev, &mut device_cgroup, &mut events, tx.clone());
                                }
                                (Some("usb"), Some(uevent::UeventAction::Remove)) => {
                                    let mut device_cgroup = DeviceCgroupBackend::new(&config.cgroup_root, &arena);
                                    hotplug.on_usb_remove(&ev, &mut device_cgroup, &mut token_sink);
                                }
                                (Some("net"), Some(uevent::UeventAction::Add)) => {
                                    hotplug.on_net_add(ev, &mut events, tx.clone());
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Event::TimerFired(handle)) => {
                        match hotplug.match_timer(handle) {
                            Some(HotplugTimer::TokenWait { devnum }) => {
                                hotplug.poll_token_wait(
                                    devnum,
                                    uevent::device_node_exists,
                                    &mut token_sink,
                                    &mut events,
                                );
                            }
                            Some(HotplugTimer::NetRename { ifname }) => {
                                let mut mover = PhysicalNetMover::new(&hotplug_netlink, &arena);
                                if let Some((owner, reinjected)) = hotplug.finish_net_add(
                                    &ifname,
                                    uevent::read_mac_address,
                                    uevent::is_wireless,
                                    &arena,
                                    &mut mover,
                                ) {
                                    // the renamed interface now lives inside
                                    // the target's netns; re-advertise it
                                    // there so in-compartment udev-alikes see
                                    // an add event under the new name.
                                    if let Some(new_name) = reinjected.interface.as_deref() {
                                        if let Some(pid) = arena.get(&owner).and_then(|c| c.child_pid) {
                                            if let Err(e) =
                                                modules::uevent_forward::forward_into_netns(pid, new_name)
                                            {
                                                warn!(error = %e, "forwarding net uevent into compartment netns");
                                            }
                                        }
                                    }
                                }
                            }
                            None => {}
                        }
                    }
                    Some(Event::ChildExited(pid, code)) => {
                        info!(pid, code, "reaped child");
                    }
                    Some(Event::FdReadable(_)) => {}
                    None => break,
                }
            }
        }
    }

    Ok(())
}
