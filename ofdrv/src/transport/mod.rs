//! Transport abstraction used by channel establishment.

mod tcp;
mod udp;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use std::mem::ManuallyDrop;
use std::net::SocketAddrV4;
use std::os::fd::{FromRawFd, RawFd};

use socket2::Socket;

use crate::types::{ChannelKey, DeviceKey, L4Proto};
use crate::{Error, Result};

/// A bound passive endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passive {
    pub fd: RawFd,
    pub local_addr: SocketAddrV4,
}

/// Outcome of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    /// Sender address, reported by datagram transports.
    pub from: Option<SocketAddrV4>,
}

pub trait Transport: Send + Sync {
    fn protocol(&self) -> L4Proto;

    /// Open the controller-side endpoint described by `key`.
    fn open_passive(&self, key: &DeviceKey) -> Result<Passive>;

    /// Open the switch-side endpoint for `channel` and point it at the controller.
    fn open_active(&self, key: &DeviceKey, channel: &ChannelKey) -> Result<RawFd>;

    /// Accept one pending peer. Connectionless transports return `None`.
    fn accept(&self, listen_fd: RawFd) -> Result<Option<(RawFd, SocketAddrV4)>>;

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<Received>;

    fn write(&self, fd: RawFd, buf: &[u8], dest: Option<SocketAddrV4>) -> Result<usize>;

    fn close(&self, fd: RawFd) -> Result<()> {
        nix::unistd::close(fd)?;
        Ok(())
    }
}

/// The transports the driver knows, selected by protocol.
pub struct Transports {
    tcp: TcpTransport,
    udp: UdpTransport,
}

impl Transports {
    pub fn new(listen_backlog: i32) -> Self {
        Self {
            tcp: TcpTransport::new(listen_backlog),
            udp: UdpTransport,
        }
    }

    pub fn get(&self, proto: L4Proto) -> &dyn Transport {
        match proto {
            L4Proto::Tcp => &self.tcp,
            L4Proto::Udp => &self.udp,
        }
    }
}

/// View a descriptor as a socket without taking ownership of it.
///
/// # Safety
///
/// `fd` must be an open socket for as long as the returned value is used.
pub(crate) unsafe fn borrow_socket(fd: RawFd) -> ManuallyDrop<Socket> {
    ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) })
}

pub(crate) fn local_v4(socket: &Socket) -> Result<SocketAddrV4> {
    socket
        .local_addr()?
        .as_socket_ipv4()
        .ok_or(Error::InvalidArgument("socket is not IPv4"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_protocol() {
        let transports = Transports::new(16);
        assert_eq!(transports.get(L4Proto::Tcp).protocol(), L4Proto::Tcp);
        assert_eq!(transports.get(L4Proto::Udp).protocol(), L4Proto::Udp);
    }
}
