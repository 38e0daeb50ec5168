//! Descriptor registrations and the events handed to their callbacks.

use std::net::SocketAddrV4;
use std::os::fd::RawFd;

use bytes::Bytes;
use nix::poll::PollFlags;

use crate::Result;

/// What a registered descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// An application socket. Counts against the thread's socket capacity.
    Socket,
    /// An auxiliary pipe created and owned by the poll thread.
    Pipe,
}

/// Readiness a registration wants to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::Both)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::Both)
    }

    /// Poll flags for this interest. `POLLOUT` is armed only while output is pending.
    pub(crate) fn poll_flags(self, output_pending: bool) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.is_readable() {
            flags |= PollFlags::POLLIN;
        }
        if self.is_writable() && output_pending {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// What the loop should do with a descriptor after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep,
    Remove,
    /// Writable callbacks only: this many bytes of the payload went out.
    /// The rest stays at the front of the queue until the descriptor is
    /// writable again. Treated as `Keep` elsewhere.
    Partial(usize),
}

/// Context passed to every readable/writable callback.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent<'a> {
    /// Name of the poll thread running the callback.
    pub thread: &'a str,
    /// Descriptor to service: the socket itself, the read end of an
    /// auxiliary pipe for readable events, or its write end for deliveries.
    pub fd: RawFd,
    /// Descriptor the registration is known by (what `add` returned).
    pub handle: RawFd,
    pub kind: FdKind,
    pub interest: Interest,
    /// The peer hung up or the descriptor reported an error.
    pub hangup: bool,
}

/// A payload queued for delivery through a descriptor's writable callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: Bytes,
    /// Datagram destination, for descriptors that serve many peers.
    pub dest: Option<SocketAddrV4>,
    /// Raw-socket key the payload belongs to when it differs from the descriptor.
    pub route: Option<RawFd>,
}

impl Outbound {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            dest: None,
            route: None,
        }
    }

    pub fn to(mut self, dest: SocketAddrV4) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn via(mut self, route: RawFd) -> Self {
        self.route = Some(route);
        self
    }
}

impl From<Bytes> for Outbound {
    fn from(payload: Bytes) -> Self {
        Outbound::new(payload)
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(payload: Vec<u8>) -> Self {
        Outbound::new(payload)
    }
}

impl From<&'static [u8]> for Outbound {
    fn from(payload: &'static [u8]) -> Self {
        Outbound::new(payload)
    }
}

pub type ReadableFn = Box<dyn FnMut(&IoEvent<'_>) -> Result<Action> + Send>;
pub type WritableFn = Box<dyn FnMut(&IoEvent<'_>, Outbound) -> Result<Action> + Send>;

/// A request to add a descriptor to a poll thread.
///
/// # Example
///
/// ```no_run
/// use ofdrv::pollthr::{Action, Interest, PollThread, Registration};
/// # fn example(fd: std::os::fd::RawFd) -> ofdrv::Result<()> {
/// let thread = PollThread::spawn("rwthr_1", 8, 1)?;
/// thread.add(
///     Registration::socket(fd)
///         .interest(Interest::Readable)
///         .on_readable(|ev| {
///             println!("{} readable on {}", ev.fd, ev.thread);
///             Ok(Action::Keep)
///         }),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct Registration {
    pub(crate) fd: Option<RawFd>,
    pub(crate) kind: FdKind,
    pub(crate) interest: Interest,
    pub(crate) on_readable: Option<ReadableFn>,
    pub(crate) on_writable: Option<WritableFn>,
}

impl Registration {
    /// Register an existing socket. The caller keeps ownership of `fd`.
    pub fn socket(fd: RawFd) -> Self {
        Self {
            fd: Some(fd),
            kind: FdKind::Socket,
            interest: Interest::Readable,
            on_readable: None,
            on_writable: None,
        }
    }

    /// Ask the thread to create an auxiliary pipe. `add` returns its write end.
    pub fn pipe() -> Self {
        Self {
            fd: None,
            kind: FdKind::Pipe,
            interest: Interest::Readable,
            on_readable: None,
            on_writable: None,
        }
    }

    pub fn interest(mut self, interest: Interest) -> Self {
        self.interest = interest;
        self
    }

    pub fn on_readable<F>(mut self, f: F) -> Self
    where
        F: FnMut(&IoEvent<'_>) -> Result<Action> + Send + 'static,
    {
        self.on_readable = Some(Box::new(f));
        self
    }

    pub fn on_writable<F>(mut self, f: F) -> Self
    where
        F: FnMut(&IoEvent<'_>, Outbound) -> Result<Action> + Send + 'static,
    {
        self.on_writable = Some(Box::new(f));
        self
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("fd", &self.fd)
            .field("kind", &self.kind)
            .field("interest", &self.interest)
            .field("on_readable", &self.on_readable.is_some())
            .field("on_writable", &self.on_writable.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_flags() {
        assert_eq!(Interest::Readable.poll_flags(true), PollFlags::POLLIN);
        assert_eq!(Interest::Writable.poll_flags(false), PollFlags::empty());
        assert_eq!(Interest::Writable.poll_flags(true), PollFlags::POLLOUT);
        assert_eq!(
            Interest::Both.poll_flags(true),
            PollFlags::POLLIN | PollFlags::POLLOUT
        );
    }

    #[test]
    fn test_outbound_builder() {
        let dest: SocketAddrV4 = "127.0.0.1:6653".parse().unwrap();
        let out = Outbound::new(&b"hello"[..]).to(dest).via(7);
        assert_eq!(out.payload, Bytes::from_static(b"hello"));
        assert_eq!(out.dest, Some(dest));
        assert_eq!(out.route, Some(7));
    }
}
