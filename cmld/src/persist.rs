use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Last-known desired state for restart-after-reboot (§6, §1
/// non-goal "persistent scheduling across reboots beyond restoring
/// previously-running container state"). This is the concrete shape the
/// spec's prose left implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Stopped,
    Running,
}

/// Per-compartment on-disk directory layout (§6 "persisted state
/// layout"): configuration blob, wrapped key, pidfile while running, an
/// image directory for rootfs artifacts, and the desired-state file.
/// A small struct-plus-path-builder, rather than scattering path-joining
/// logic at call sites.
pub struct Persisted {
    root: PathBuf,
}

impl Persisted {
    pub fn new(state_dir: &Path, compartment_name: &str) -> Self {
        Self { root: state_dir.join(compartment_name) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_blob_path(&self) -> PathBuf {
        self.root.join("config.blob")
    }

    pub fn wrapped_key_path(&self) -> PathBuf {
        self.root.join("key.wrapped")
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.root.join("pid")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image")
    }

    pub fn desired_state_path(&self) -> PathBuf {
        self.root.join("desired_state")
    }

    /// Creates the directory layout if it doesn't exist yet.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .and_then(|_| std::fs::create_dir_all(self.image_dir()))
            .map_err(|e| Error::internal(format!("creating persisted layout for {}: {e}", self.root.display())))
    }

    pub fn load_config_blob(&self) -> Result<crate::compartment::CompartmentConfig> {
        let bytes = std::fs::read(self.config_blob_path())
            .map_err(|e| Error::config_invalid(format!("reading config blob: {e}")))?;
        crate::config::decode_blob(&bytes)
    }

    pub fn save_config_blob(&self, config: &crate::compartment::CompartmentConfig) -> Result<()> {
        let bytes = crate::config::encode_blob(config)?;
        std::fs::write(self.config_blob_path(), bytes)
            .map_err(|e| Error::internal(format!("writing config blob: {e}")))
    }

    pub fn load_desired_state(&self) -> Result<DesiredState> {
        let text = std::fs::read_to_string(self.desired_state_path())
            .map_err(|e| Error::internal(format!("reading desired state: {e}")))?;
        serde_json::from_str(text.trim())
            .map_err(|e| Error::internal(format!("malformed desired state file: {e}")))
    }

    pub fn save_desired_state(&self, state: DesiredState) -> Result<()> {
        let text = serde_json::to_string(&state)
            .map_err(|e| Error::internal(format!("encoding desired state: {e}")))?;
        std::fs::write(self.desired_state_path(), text)
            .map_err(|e| Error::internal(format!("writing desired state: {e}")))
    }

    pub fn write_pidfile(&self, pid: i32) -> Result<()> {
        std::fs::write(self.pidfile_path(), pid.to_string())
            .map_err(|e| Error::internal(format!("writing pidfile: {e}")))
    }

    pub fn remove_pidfile(&self) -> Result<()> {
        match std::fs::remove_file(self.pidfile_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal(format!("removing pidfile: {e}"))),
        }
    }
}
