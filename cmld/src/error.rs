use nix::errno::Errno;

/// Tagged failure kinds per the error handling design. Never stringly-typed:
/// callers match on `ErrorKind`, not on a formatted message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("credential error: {0}")]
    CredentialError(String),
    #[error("kernel error ({errno}): {context}")]
    KernelError { errno: Errno, context: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
}

impl Error {
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ConfigInvalid(msg.into()) }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::PreconditionFailed(msg.into()) }
    }

    pub fn resource_busy(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ResourceBusy(msg.into()) }
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::CredentialError(msg.into()) }
    }

    pub fn kernel(errno: Errno, context: impl Into<String>) -> Self {
        Self { kind: ErrorKind::KernelError { errno, context: context.into() } }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Timeout(msg.into()) }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Internal(msg.into()) }
    }

    /// Whether this error kind is fatal to the whole daemon (only
    /// initialization-time failures of the event loop, uevent source, or
    /// control socket are) as opposed to scoped to one compartment.
    pub fn is_process_fatal(&self) -> bool {
        false
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::kernel(e, "syscall failed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_failures_are_never_process_fatal() {
        for e in [
            Error::config_invalid("x"),
            Error::precondition("x"),
            Error::resource_busy("x"),
            Error::credential("x"),
            Error::kernel(Errno::EIO, "x"),
            Error::timeout("x"),
            Error::internal("x"),
        ] {
            assert!(!e.is_process_fatal());
        }
    }
}
