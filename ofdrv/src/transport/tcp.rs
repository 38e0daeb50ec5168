use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::{IntoRawFd, RawFd};

use nix::sys::socket::{MsgFlags, recv, send};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::{Passive, Received, Transport, borrow_socket, local_v4};
use crate::types::{ChannelKey, DeviceKey, L4Proto};
use crate::{Errno, Error, Result};

/// Stream transport: one descriptor per peer.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    backlog: i32,
}

impl TcpTransport {
    pub fn new(backlog: i32) -> Self {
        Self { backlog }
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> L4Proto {
        L4Proto::Tcp
    }

    fn open_passive(&self, key: &DeviceKey) -> Result<Passive> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(key.controller_addr()).into())?;
        socket.listen(self.backlog)?;
        socket.set_nonblocking(true)?;
        let local_addr = local_v4(&socket)?;
        let fd = socket.into_raw_fd();
        debug!(fd, %local_addr, backlog = self.backlog, "tcp listening");
        Ok(Passive { fd, local_addr })
    }

    fn open_active(&self, key: &DeviceKey, channel: &ChannelKey) -> Result<RawFd> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        let local = key.switch_addr();
        if !local.ip().is_unspecified() || local.port() != 0 {
            socket.set_reuse_address(true)?;
            socket.bind(&SocketAddr::V4(local).into())?;
        }
        socket.connect(&SocketAddr::V4(key.controller_addr()).into())?;
        socket.set_tcp_nodelay(true)?;
        socket.set_nonblocking(true)?;
        let fd = socket.into_raw_fd();
        debug!(
            fd,
            controller = %key.controller_addr(),
            dp_id = channel.dp_id,
            aux_id = channel.aux_id,
            "tcp connected"
        );
        Ok(fd)
    }

    fn accept(&self, listen_fd: RawFd) -> Result<Option<(RawFd, SocketAddrV4)>> {
        // SAFETY: the listener stays open while it is registered.
        let listener = unsafe { borrow_socket(listen_fd) };
        let (socket, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::Transport(Errno::EAGAIN)),
            Err(e) => return Err(e.into()),
        };
        let peer = addr
            .as_socket_ipv4()
            .ok_or(Error::InvalidArgument("peer is not IPv4"))?;
        socket.set_tcp_nodelay(true)?;
        socket.set_nonblocking(true)?;
        Ok(Some((socket.into_raw_fd(), peer)))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<Received> {
        let len = recv(fd, buf, MsgFlags::empty())?;
        Ok(Received { len, from: None })
    }

    /// Write as much of `buf` as the socket takes without blocking. A full
    /// send buffer ends the write early; the caller keeps the rest.
    fn write(&self, fd: RawFd, buf: &[u8], _dest: Option<SocketAddrV4>) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match send(fd, &buf[written..], MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) if written == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(written)
    }
}
