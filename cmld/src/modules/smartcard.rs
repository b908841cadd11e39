use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use crate::compartment::Compartment;
use crate::credential::{CredentialReply, CredentialRequest};
use crate::error::{Error, Result};
use crate::registry::{HookOutcome, Module};

/// State parked on the compartment's module-state slot while a unlock
/// round-trip to the credential collaborator is outstanding (§9
/// "asynchronous hook completion"). The socket itself doubles as the
/// continuation fd the engine parks on.
struct PendingUnlock {
    stream: UnixStream,
    sent: bool,
    len_buf: [u8; 4],
    len_read: usize,
    payload_len: Option<usize>,
    payload: Vec<u8>,
    payload_read: usize,
}

/// Unlocks per-container key material via the credential collaborator
/// before volumes are mounted (§4.3). Registered first in the module
/// order: every later module's `setup_early`/`clone_prep` etc. can assume
/// the container's key material is available by the time they run, since
/// `smartcard` only ever suspends `start_pre_exec`, the earliest phase
/// where the credential round-trip has to have happened (volumes need the
/// unwrapped key before they open dm-crypt).
pub struct SmartcardModule {
    idx: usize,
    credential_socket: PathBuf,
}

impl SmartcardModule {
    pub fn new(idx: usize, credential_socket: PathBuf) -> Self {
        Self { idx, credential_socket }
    }

    fn unlock_frame(compartment_uuid: uuid::Uuid) -> Result<Vec<u8>> {
        let req = CredentialRequest::TokenUnlock { compartment: compartment_uuid, passphrase: Vec::new() };
        let payload = serde_json::to_vec(&req)
            .map_err(|e| Error::internal(format!("encoding unlock request: {e}")))?;
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }
}

impl Module for SmartcardModule {
    fn name(&self) -> &'static str {
        "smartcard"
    }

    fn start_pre_exec(&self, c: &mut Compartment) -> HookOutcome {
        let uuid = c.uuid;
        let needs_init = c.module_state(self.idx).and_then(|s| s.downcast_ref::<PendingUnlock>()).is_none();
        if needs_init {
            let stream = match UnixStream::connect(&self.credential_socket) {
                Ok(s) => s,
                Err(e) => {
                    return HookOutcome::Err(Error::credential(format!(
                        "connecting to credential collaborator: {e}"
                    )))
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                return HookOutcome::Err(Error::credential(format!("setting nonblocking: {e}")));
            }
            c.set_module_state(
                self.idx,
                Box::new(PendingUnlock {
                    stream,
                    sent: false,
                    len_buf: [0u8; 4],
                    len_read: 0,
                    payload_len: None,
                    payload: Vec::new(),
                    payload_read: 0,
                }),
            );
        }

        let frame = match Self::unlock_frame(uuid) {
            Ok(f) => f,
            Err(e) => return HookOutcome::Err(e),
        };

        let pending = c
            .module_state_mut(self.idx)
            .as_mut()
            .expect("just initialized above")
            .downcast_mut::<PendingUnlock>()
            .expect("this module's own state slot always holds PendingUnlock");

        if !pending.sent {
            match pending.stream.write_all(&frame) {
                Ok(()) => pending.sent = true,
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    return HookOutcome::Pending { continuation_fd: pending.stream.as_raw_fd() };
                }
                Err(e) => return HookOutcome::Err(Error::credential(format!("writing unlock request: {e}"))),
            }
        }

        while pending.len_read < 4 {
            match pending.stream.read(&mut pending.len_buf[pending.len_read..]) {
                Ok(0) => return HookOutcome::Err(Error::credential("credential collaborator closed connection")),
                Ok(n) => pending.len_read += n,
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    return HookOutcome::Pending { continuation_fd: pending.stream.as_raw_fd() };
                }
                Err(e) => return HookOutcome::Err(Error::credential(format!("reading unlock reply length: {e}"))),
            }
        }
        if pending.payload_len.is_none() {
            let len = u32::from_be_bytes(pending.len_buf) as usize;
            pending.payload.resize(len, 0);
            pending.payload_len = Some(len);
        }
        let payload_len = pending.payload_len.expect("set above");
        while pending.payload_read < payload_len {
            match pending.stream.read(&mut pending.payload[pending.payload_read..]) {
                Ok(0) => return HookOutcome::Err(Error::credential("credential collaborator closed connection")),
                Ok(n) => pending.payload_read += n,
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    return HookOutcome::Pending { continuation_fd: pending.stream.as_raw_fd() };
                }
                Err(e) => return HookOutcome::Err(Error::credential(format!("reading unlock reply: {e}"))),
            }
        }

        let reply: CredentialReply = match serde_json::from_slice(&pending.payload) {
            Ok(r) => r,
            Err(e) => return HookOutcome::Err(Error::credential(format!("malformed unlock reply: {e}"))),
        };

        c.take_module_state(self.idx);
        match reply {
            CredentialReply::Ok { .. } => HookOutcome::Done,
            CredentialReply::WrongPassphrase => HookOutcome::Err(Error::credential("wrong passphrase")),
            CredentialReply::Error { message } => HookOutcome::Err(Error::credential(message)),
        }
    }

    fn cleanup(&self, c: &mut Compartment) {
        c.take_module_state(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;
    use std::os::unix::net::UnixListener;

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
    fn missing_collaborator_socket_is_a_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let module = SmartcardModule::new(0, dir.path().join("nonexistent.sock"));
        let mut c = Compartment::new("c1", cfg(), 1);
        let outcome = module.start_pre_exec(&mut c);
        assert!(matches!(outcome, HookOutcome::Err(_)));
    }

    #[test]
    fn successful_unlock_completes_once_reply_is_available() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("cred.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).unwrap();
            let reply = CredentialReply::Ok { data: b"ok".to_vec() };
            let reply_payload = serde_json::to_vec(&reply).unwrap();
            stream.write_all(&(reply_payload.len() as u32).to_be_bytes()).unwrap();
            stream.write_all(&reply_payload).unwrap();
        });

        let module = SmartcardModule::new(0, sock_path);
        let mut c = Compartment::new("c1", cfg(), 1);

        // first call connects and sends; may suspend waiting for the reply.
        let mut outcome = module.start_pre_exec(&mut c);
        let mut spins = 0;
        while matches!(outcome, HookOutcome::Pending { .. }) && spins < 1000 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            outcome = module.start_pre_exec(&mut c);
            spins += 1;
        }
        assert!(matches!(outcome, HookOutcome::Done), "expected unlock to complete");
        server.join().unwrap();
    }
}
