use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Daemon-wide settings loaded once at startup from a TOML file (§1
/// ambient stack: the daemon does not hardcode socket paths or tunables).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory under which per-compartment control sockets are created,
    /// one per compartment as `<socket_dir>/cml-<name>` (§6).
    pub socket_dir: PathBuf,
    /// Root directory of the per-compartment persisted state layout (§6).
    pub state_dir: PathBuf,
    /// Stream socket path of the credential collaborator (§6).
    pub credential_socket: PathBuf,
    /// Wall-clock timeout for a credential round-trip before it surfaces
    /// as `CredentialError::Timeout` (§5).
    pub credential_timeout_ms: u64,
    /// Token device-node debounce: fixed period and attempt budget (§4.4,
    /// recorded open-question decision: no jitter).
    pub token_debounce_period_ms: u64,
    pub token_debounce_attempts: u32,
    /// Net-add debounce period before a physical interface is renamed and
    /// moved (§4.4 rule 3).
    pub net_debounce_period_ms: u64,
    /// Name of the fallback compartment that unmapped physical interfaces
    /// are moved into (§4.4 rule 3e).
    pub default_compartment: String,
    /// Root of the host cgroup filesystem, v1 or v2 depending on the
    /// `cgroup_v1` build feature (§4.3). Shared between `CgroupModule`
    /// and the hotplug coordinator's device-cgroup backend so both agree
    /// on where a compartment's hierarchy lives.
    pub cgroup_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/socket"),
            state_dir: PathBuf::from("/var/lib/cmld/compartments"),
            credential_socket: PathBuf::from("/run/socket/cml-credential"),
            credential_timeout_ms: 5_000,
            token_debounce_period_ms: 100,
            token_debounce_attempts: 10,
            net_debounce_period_ms: 100,
            default_compartment: "c0".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

impl DaemonConfig {
    /// Loads the daemon config from a TOML file, falling back to defaults
    /// for any field the file omits. A missing file is not an error here;
    /// `load_required` is for call sites that want the opposite.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config_invalid(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| Error::config_invalid(format!("parsing {}: {e}", path.display())))
    }

    pub fn control_socket_path(&self, compartment_name: &str) -> PathBuf {
        self.socket_dir.join(format!("cml-{compartment_name}"))
    }
}

/// Decoded on-disk per-compartment configuration blob (§1 "a collaborator
/// decodes a binary configuration blob into typed records"). The real
/// collaborator owns the wire format; this is the concrete, swappable
/// decode seam it would occupy, encoded with `bincode` for a compact
/// typed on-disk blob.
pub fn decode_blob(bytes: &[u8]) -> Result<crate::compartment::CompartmentConfig> {
    let (config, _len): (crate::compartment::CompartmentConfig, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| Error::config_invalid(format!("malformed configuration blob: {e}")))?;
    Ok(config)
}

pub fn encode_blob(config: &crate::compartment::CompartmentConfig) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(config, bincode::config::standard())
        .map_err(|e| Error::internal(format!("failed to encode configuration blob: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.socket_dir, PathBuf::from("/run/socket"));
        assert_eq!(cfg.token_debounce_attempts, 10);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: DaemonConfig = toml::from_str("default_compartment = \"cgw\"\n").unwrap();
        assert_eq!(cfg.default_compartment, "cgw");
        assert_eq!(cfg.token_debounce_period_ms, 100);
    }

    #[test]
    fn blob_roundtrips() {
        let config = crate::compartment::CompartmentConfig {
            name: "c1".into(),
            guestos: "default".into(),
            uid_range_len: 65536,
            cgroup_memory_limit_bytes: Some(512 * 1024 * 1024),
            capabilities_allow: vec!["CAP_NET_ADMIN".into()],
            seccomp_profile: Some("default".into()),
        };
        let blob = encode_blob(&config).unwrap();
        let back = decode_blob(&blob).unwrap();
        assert_eq!(back.name, "c1");
        assert_eq!(back.capabilities_allow, vec!["CAP_NET_ADMIN".to_string()]);
    }

    #[test]
    fn malformed_blob_rejected() {
        let err = decode_blob(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::ConfigInvalid(_)));
    }
}
