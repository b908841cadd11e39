use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame};

/// Requests the smartcard module sends to the credential collaborator
/// (§6): `TOKEN_UNLOCK`, `WRAP_KEY`, `UNWRAP_KEY`, `SIGN`, `VERIFY`, each a
/// request/reply record over a stream socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum CredentialRequest {
    TokenUnlock { compartment: Uuid, passphrase: Vec<u8> },
    WrapKey { compartment: Uuid, key: Vec<u8> },
    UnwrapKey { compartment: Uuid, wrapped: Vec<u8> },
    Sign { compartment: Uuid, data: Vec<u8> },
    Verify { compartment: Uuid, data: Vec<u8>, signature: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CredentialReply {
    Ok { data: Vec<u8> },
    WrongPassphrase,
    Error { message: String },
}

/// Client side of the credential collaborator channel (§5 "the credential
/// collaborator call has a configurable wall-clock timeout; exceeding it
/// surfaces as a credential failure and aborts the phase"). Each call
/// opens a fresh connection, matching the collaborator's request/reply,
/// one-shot nature; the smartcard module is the only caller and it never
/// holds this open across a suspended hook (the continuation fd is the
/// socket itself while the reply is outstanding).
pub struct CredentialClient {
    socket_path: std::path::PathBuf,
    timeout: Duration,
}

impl CredentialClient {
    pub fn new(socket_path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self { socket_path: socket_path.as_ref().to_path_buf(), timeout }
    }

    pub async fn call(&self, request: &CredentialRequest) -> Result<CredentialReply> {
        let connect = UnixStream::connect(&self.socket_path);
        let mut stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| Error::timeout("credential collaborator connect timed out"))?
            .map_err(|e| Error::credential(format!("connecting to credential collaborator: {e}")))?;

        let buf = serde_json::to_vec(request)
            .map_err(|e| Error::internal(format!("encoding credential request: {e}")))?;

        let exchange = async {
            write_frame(&mut stream, &buf).await?;
            let reply_buf = read_frame(&mut stream).await?;
            serde_json::from_slice::<CredentialReply>(&reply_buf)
                .map_err(|e| Error::credential(format!("malformed credential reply: {e}")))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::timeout("credential collaborator round-trip timed out"))?
    }
}
