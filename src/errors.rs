//! Error type for the tracing engine: kernel-refused, memory-access,
//! protocol-violation, unrecoverable-internal, and child-exited (the
//! last of which is not really an error and is surfaced as a `quit`
//! event instead, not through this type).

use std::fmt::{self, Display};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, Error>;

/// The five error kinds the core surfaces. `ChildExited` is kept here only
/// so the rest of the engine can funnel every `Result` through one type;
/// callers should never construct it directly (the event loop reports
/// child exits as `EventKind::Quit` events, not as errors).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A ptrace request was refused by the kernel (`ptrace` returned an
    /// error). Typically fatal for the tracee it was issued against.
    KernelRefused,
    /// A peek/poke or `/proc/<pid>/mem` read or write failed for the given
    /// address range. Non-fatal; surfaced to the caller.
    MemoryAccess,
    /// The controller invoked an injection or denial outside a legal
    /// PRE/POST context.
    ProtocolViolation,
    /// `wait_event` could not make progress (memory exhaustion, an
    /// unresolvable kernel error). The controller must shut down.
    Unrecoverable,
    /// Not a real error; a tracee has exited. Never constructed directly.
    ChildExited,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::KernelRefused => "kernel-refused",
            ErrorKind::MemoryAccess => "memory-access",
            ErrorKind::ProtocolViolation => "protocol-violation",
            ErrorKind::Unrecoverable => "unrecoverable-internal",
            ErrorKind::ChildExited => "child-exited",
        };
        f.write_str(s)
    }
}

/// An engine error: a kind plus an optional human-readable message and
/// source error.
pub struct Error {
    kind: ErrorKind,
    msg: Option<Box<dyn Display + Send + Sync + 'static>>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn msg<M>(kind: ErrorKind, msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        Error {
            kind,
            msg: Some(Box::new(msg)),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_msg<M>(mut self, msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        self.msg = Some(Box::new(msg));
        self
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.msg {
            write!(f, ": {}", msg)?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        match &self.msg {
            Some(msg) => d.field("msg", &format_args!("{}", msg)),
            None => d.field("msg", &Option::<()>::None),
        };
        d.finish()
    }
}

impl std::error::Error for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl From<nix::Error> for Error {
    fn from(error: nix::Error) -> Error {
        let kind = match error {
            nix::Error::Sys(nix::errno::Errno::ESRCH) => ErrorKind::KernelRefused,
            nix::Error::Sys(nix::errno::Errno::EFAULT)
            | nix::Error::Sys(nix::errno::Errno::EIO) => ErrorKind::MemoryAccess,
            nix::Error::Sys(_) => ErrorKind::KernelRefused,
            _ => ErrorKind::Unrecoverable,
        };
        Error {
            kind,
            msg: None,
            source: Some(Box::new(error)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        let kind = match error.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => ErrorKind::MemoryAccess,
            io::ErrorKind::OutOfMemory => ErrorKind::Unrecoverable,
            _ => ErrorKind::MemoryAccess,
        };
        Error {
            kind,
            msg: None,
            source: Some(Box::new(error)),
        }
    }
}

/// Attaches a human-readable message to a `Result`.
pub trait WithContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;
}

impl<T> WithContext<T> for Result<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.with_msg(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_refused_from_esrch() {
        let err: Error = nix::Error::Sys(nix::errno::Errno::ESRCH).into();
        assert_eq!(err.kind(), ErrorKind::KernelRefused);
    }

    #[test]
    fn memory_access_from_efault() {
        let err: Error = nix::Error::Sys(nix::errno::Errno::EFAULT).into();
        assert_eq!(err.kind(), ErrorKind::MemoryAccess);
    }

    #[test]
    fn context_attaches_message() {
        let err: Result<()> =
            Err(Error::new(ErrorKind::ProtocolViolation)).context("bad state");
        assert_eq!(
            format!("{}", err.unwrap_err()),
            "protocol-violation: bad state"
        );
    }
}
