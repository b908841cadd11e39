use std::os::unix::io::RawFd;

use nix::sys::socket::{
    bind, socket, AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
}

impl UeventAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "change" => Some(Self::Change),
            _ => None,
        }
    }
}

/// A decoded kernel uevent (§3). Immutable once constructed; `with_iface`
/// produces a renamed copy rather than mutating fields in place, matching
/// "rename helpers produce a copy with substituted fields."
#[derive(Debug, Clone, Default)]
pub struct Uevent {
    pub action: Option<UeventAction>,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    pub devpath: Option<String>,
    pub devname: Option<String>,
    pub interface: Option<String>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub usb_vendor: Option<u16>,
    pub usb_product: Option<u16>,
}

impl Uevent {
    /// Zero-copy key=value scan over the `\0`-separated netlink payload
    /// (§6, §9). The slice is never mutated; each `key=value` pair is
    /// matched by key without allocating beyond the handful of owned
    /// `String`s the typed record needs.
    pub fn parse(payload: &[u8]) -> Self {
        let mut ev = Uevent::default();
        for field in payload.split(|b| *b == 0) {
            if field.is_empty() {
                continue;
            }
            let Ok(s) = std::str::from_utf8(field) else { continue };
            let Some((key, value)) = s.split_once('=') else { continue };
            match key {
                "ACTION" => ev.action = UeventAction::parse(value),
                "SUBSYSTEM" => ev.subsystem = Some(value.to_string()),
                "DEVTYPE" => ev.devtype = Some(value.to_string()),
                "DEVPATH" => ev.devpath = Some(value.to_string()),
                "DEVNAME" => ev.devname = Some(value.to_string()),
                "INTERFACE" => ev.interface = Some(value.to_string()),
                "MAJOR" => ev.major = value.parse().ok(),
                "MINOR" => ev.minor = value.parse().ok(),
                "PRODUCT" => {
                    // usb PRODUCT is "vendor/product/bcddev" in hex without
                    // leading zeros, e.g. "1050/407/100".
                    let mut parts = value.split('/');
                    ev.usb_vendor = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());
                    ev.usb_product = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());
                }
                _ => {}
            }
        }
        ev
    }

    /// Produces a copy with `interface` and `devpath` substituted, used by
    /// the hotplug coordinator after renaming a physical interface
    /// (§4.4 rule 3c).
    pub fn with_iface(&self, new_name: &str, new_devpath: String) -> Self {
        let mut copy = self.clone();
        copy.interface = Some(new_name.to_string());
        copy.devpath = Some(new_devpath);
        copy
    }

    pub fn devnum(&self) -> Option<(u32, u32)> {
        match (self.major, self.minor) {
            (Some(ma), Some(mi)) => Some((ma, mi)),
            _ => None,
        }
    }
}

/// Opens a netlink socket of the kernel-object family and subscribes to
/// all subsystems (§6). Returns the raw fd for the event loop to watch.
pub fn open_uevent_socket() -> nix::Result<RawFd> {
    let sock = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        SockProtocol::NetlinkKObjectUEvent,
    )?;
    // group 1 == all kobject uevents
    let addr = NetlinkAddr::new(0, 1);
    bind(sock, &addr)?;
    Ok(sock)
}

/// Reads `serial` from sysfs at the event's devpath (§4.4 rule 1,
/// §6 "/sys/bus/usb/devices/*/serial").
pub fn read_usb_serial(devpath: &str) -> std::io::Result<String> {
    let path = format!("/sys{devpath}/serial");
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// True if `/sys/class/net/<ifname>/wireless` exists (§6).
pub fn is_wireless(ifname: &str) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{ifname}/wireless")).exists()
}

/// Reads a physical interface's MAC address from sysfs (§4.4 rule 3,
/// §6 "/sys/class/net/*/address").
pub fn read_mac_address(ifname: &str) -> Option<[u8; 6]> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{ifname}/address")).ok()?;
    crate::compartment::parse_mac(text.trim())
}

/// True once the kernel has published a device node for `(major, minor)`
/// under `/sys/dev/char` (§4.4 rule 1, "wait for the device node to
/// appear before invoking token-attach").
pub fn device_node_exists(major: u32, minor: u32) -> bool {
    std::path::Path::new(&format!("/sys/dev/char/{major}:{minor}")).exists()
}
