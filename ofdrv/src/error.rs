use std::fmt;

pub type Errno = nix::errno::Errno;

/// Error type for ofdrv operations.
#[derive(Debug)]
pub enum Error {
    /// Allocation of a registry entry or buffer failed.
    OutOfMemory,
    /// A registry or poll thread lookup/removal did not find its key.
    NotFound(&'static str),
    /// A registry operation did not apply as expected (duplicate key, broken link).
    Registry(&'static str),
    /// Underlying connect/bind/accept/read/write failure.
    Transport(Errno),
    /// Bad input, e.g. an unknown device key on a socket-attach call.
    InvalidArgument(&'static str),
    /// No placement slot left and creating a new poll thread was not requested.
    CapacityExhausted,
    /// Operation intentionally not provided.
    Unimplemented(&'static str),
    /// The poll thread's loop is no longer running.
    Stopped,
    /// A channel's unsent output is over its limit; the payload was dropped.
    QueueFull,
    /// The OS thread backing a poll thread could not be spawned.
    Spawn(std::io::Error),
}

/// Result type alias for ofdrv operations.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::Registry(what) => write!(f, "registry operation failed: {what}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::CapacityExhausted => write!(f, "poll thread capacity exhausted"),
            Error::Unimplemented(what) => write!(f, "{what} is not implemented"),
            Error::Stopped => write!(f, "poll thread is not running"),
            Error::QueueFull => write!(f, "channel output queue is full"),
            Error::Spawn(e) => write!(f, "failed to spawn poll thread: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Transport(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::Transport(Errno::from_raw(code)),
            None if e.kind() == std::io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            None => Error::Transport(Errno::EIO),
        }
    }
}

impl Error {
    /// Whether the error is a transport `EAGAIN`/`EWOULDBLOCK`.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Transport(Errno::EAGAIN))
    }
}
