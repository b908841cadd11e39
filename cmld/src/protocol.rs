use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Largest frame the core will accept from the control surface. A
/// misbehaving or malicious peer that advertises a longer length is
/// disconnected rather than trusted.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// `[u32 big-endian length][payload]` framing. The real payload layout is
/// a named external collaborator's contract (§6); only this framing
/// convention is fixed here, not a field-by-field tag encoding. This
/// module is the swappable seam: the daemon core never parses wire bytes
/// beyond this.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::internal(format!("reading frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::precondition(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::internal(format!("reading frame payload: {e}")))?;
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::internal("frame payload too large to encode"))?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::internal(format!("writing frame length: {e}")))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::internal(format!("writing frame payload: {e}")))
}

/// One control-facade call (§4.5). The real control surface collaborator
/// deserializes its own wire format and invokes the core directly; this
/// enum exists so the facade is exercised end-to-end within this repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    List,
    Start { uuid: Uuid },
    Stop { uuid: Uuid },
    Freeze { uuid: Uuid },
    Unfreeze { uuid: Uuid },
    Reboot { uuid: Uuid },
    RegisterUsb { uuid: Uuid, mapping: crate::compartment::UsbMapping },
    UnregisterUsb { uuid: Uuid, vendor: u16, product: u16, serial: String },
    RegisterNet { uuid: Uuid, mapping: crate::compartment::NetMapping },
    UnregisterNet { uuid: Uuid, mac: [u8; 6] },
    AttachToken { uuid: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentSummary {
    pub uuid: Uuid,
    pub name: String,
    pub state: crate::compartment::CompartmentState,
}

/// Reply to a `Request`. Synchronous calls (registrations, queries)
/// complete with `Ok`/`Err` directly; `start`/`stop`/`reboot` reply with
/// `Pending` immediately and the caller receives the eventual outcome as
/// an out-of-band notification keyed by compartment UUID (§6 "an optional
/// stream of asynchronous state-change notifications").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    List { compartments: Vec<CompartmentSummary> },
    Pending,
    Err { kind: String, message: String },
}

impl From<&Error> for Reply {
    fn from(e: &Error) -> Self {
        let kind = match &e.kind {
            crate::error::ErrorKind::ConfigInvalid(_) => "config_invalid",
            crate::error::ErrorKind::PreconditionFailed(_) => "precondition_failed",
            crate::error::ErrorKind::ResourceBusy(_) => "resource_busy",
            crate::error::ErrorKind::CredentialError(_) => "credential_error",
            crate::error::ErrorKind::KernelError { .. } => "kernel_error",
            crate::error::ErrorKind::Timeout(_) => "timeout",
            crate::error::ErrorKind::Internal(_) => "internal",
        };
        Reply::Err { kind: kind.to_string(), message: e.to_string() }
    }
}

pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Request> {
    let buf = read_frame(stream).await?;
    serde_json::from_slice(&buf).map_err(|e| Error::internal(format!("malformed request: {e}")))
}

pub async fn write_reply<W: AsyncWrite + Unpin>(stream: &mut W, reply: &Reply) -> Result<()> {
    let buf = serde_json::to_vec(reply).map_err(|e| Error::internal(format!("encoding reply: {e}")))?;
    write_frame(stream, &buf).await
}
