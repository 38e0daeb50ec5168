use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::{IntoRawFd, RawFd};

use nix::sys::socket::{MsgFlags, SockaddrIn, recvfrom, send, sendto};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::{Passive, Received, Transport, local_v4};
use crate::types::{ChannelKey, DeviceKey, L4Proto};
use crate::Result;

/// Datagram transport: one bound descriptor serves many peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

impl Transport for UdpTransport {
    fn protocol(&self) -> L4Proto {
        L4Proto::Udp
    }

    fn open_passive(&self, key: &DeviceKey) -> Result<Passive> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(key.controller_addr()).into())?;
        socket.set_nonblocking(true)?;
        let local_addr = local_v4(&socket)?;
        let fd = socket.into_raw_fd();
        debug!(fd, %local_addr, "udp bound");
        Ok(Passive { fd, local_addr })
    }

    fn open_active(&self, key: &DeviceKey, channel: &ChannelKey) -> Result<RawFd> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SocketAddr::V4(key.switch_addr()).into())?;
        socket.connect(&SocketAddr::V4(key.controller_addr()).into())?;
        socket.set_nonblocking(true)?;
        let fd = socket.into_raw_fd();
        debug!(
            fd,
            controller = %key.controller_addr(),
            dp_id = channel.dp_id,
            aux_id = channel.aux_id,
            "udp connected"
        );
        Ok(fd)
    }

    fn accept(&self, _listen_fd: RawFd) -> Result<Option<(RawFd, SocketAddrV4)>> {
        Ok(None)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<Received> {
        let (len, from) = recvfrom::<SockaddrIn>(fd, buf)?;
        Ok(Received {
            len,
            from: from.map(SocketAddrV4::from),
        })
    }

    fn write(&self, fd: RawFd, buf: &[u8], dest: Option<SocketAddrV4>) -> Result<usize> {
        let n = match dest {
            Some(dest) => sendto(fd, buf, &SockaddrIn::from(dest), MsgFlags::empty())?,
            None => send(fd, buf, MsgFlags::empty())?,
        };
        Ok(n)
    }
}
