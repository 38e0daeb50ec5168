//! The driver: devices, channel establishment and data flow.
//!
//! # Channel lifecycle
//!
//! ```text
//! New --admit--> Down --accept callback Ok--> Up
//!  \              |                            |
//!   `-------------+----------------------------+--> Closed
//! ```
//!
//! A new peer is admitted into all three registries in state `Down` before
//! the device's accept callback runs. Payloads arriving while `Down` are
//! dropped. The socket is marked `Up` only after the callback returned `Ok`;
//! a failing callback closes the channel.

use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::DriverConfig;
use crate::pollthr::{Action, Interest, IoEvent, Outbound, PollThread, Registration};
use crate::pool::PollThreadPool;
use crate::registry::{ChannelStats, Device, RawSocket, Registries, SocketState};
use crate::transport::{Received, Transport, Transports};
use crate::types::{ChannelKey, DeviceKey, DeviceRole, L4Proto, MAX_OPEN_FILES, OfVersion};
use crate::{Error, Result};

/// Application callbacks for one device.
pub trait DeviceHandler: Send + Sync {
    /// A new channel was admitted. Returning an error closes it.
    fn on_channel_accepted(&self, channel: ChannelKey, peer: Option<SocketAddrV4>) -> Result<()> {
        let _ = (channel, peer);
        Ok(())
    }

    /// A payload arrived on an `Up` channel.
    fn on_receive(&self, channel: ChannelKey, payload: &[u8]);
}

impl<F> DeviceHandler for F
where
    F: Fn(ChannelKey, &[u8]) + Send + Sync,
{
    fn on_receive(&self, channel: ChannelKey, payload: &[u8]) {
        self(channel, payload)
    }
}

/// OpenFlow channel driver.
///
/// Cheap to clone; all clones share one set of registries and threads.
/// The threads stop when the last clone is dropped or on [`Driver::shutdown`].
///
/// # Example
///
/// ```no_run
/// use std::net::SocketAddrV4;
/// use ofdrv::{ChannelKey, DeviceKey, Driver, DriverConfig, L4Proto, OfVersion};
///
/// # fn main() -> ofdrv::Result<()> {
/// let driver = Driver::new(DriverConfig::new())?;
/// let key = DeviceKey::new(
///     "0.0.0.0:6653".parse::<SocketAddrV4>().unwrap(),
///     "0.0.0.0:0".parse::<SocketAddrV4>().unwrap(),
///     L4Proto::Tcp,
/// );
/// driver.register_device(key, OfVersion::V1_3, |chan: ChannelKey, payload: &[u8]| {
///     println!("{chan}: {} bytes", payload.len());
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    config: DriverConfig,
    registries: Registries,
    listener: Arc<PollThread>,
    pool: PollThreadPool,
    transports: Transports,
    next_synthetic: AtomicI32,
}

impl Driver {
    /// Start the listener thread and an empty pool.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let listener = PollThread::spawn(
            config.listener_thread_name.clone(),
            config.max_sockets_per_thread,
            config.max_pipes_per_thread,
        )
        .inspect_err(|e| error!(error = %e, "failed to start listener thread"))?;

        let pool = PollThreadPool::new(
            config.pool_thread_prefix.clone(),
            config.max_sockets_per_thread,
            config.max_pipes_per_thread,
        );
        let transports = Transports::new(config.listen_backlog);

        // The first pooled thread starts with the driver.
        drop(
            pool.reserve()
                .inspect_err(|e| error!(error = %e, "failed to start first pool thread"))?,
        );

        info!(
            role = ?config.role,
            max_sockets_per_thread = config.max_sockets_per_thread,
            recv_buffer_size = config.recv_buffer_size,
            "driver started"
        );

        Ok(Self {
            inner: Arc::new(DriverInner {
                config,
                registries: Registries::new(),
                listener,
                pool,
                transports,
                next_synthetic: AtomicI32::new(MAX_OPEN_FILES),
            }),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    pub fn listener(&self) -> &Arc<PollThread> {
        &self.inner.listener
    }

    pub fn pool(&self) -> &PollThreadPool {
        &self.inner.pool
    }

    /// Register a device.
    ///
    /// In the controller role the passive endpoint is opened and served by
    /// the listener thread. In the switch role the device is only recorded;
    /// use [`Driver::connect`] to open channels. On failure nothing is left
    /// registered or open.
    pub fn register_device<H>(&self, key: DeviceKey, max_version: OfVersion, handler: H) -> Result<()>
    where
        H: DeviceHandler + 'static,
    {
        let inner = &self.inner;
        if inner.registries.devices.contains(&key) {
            warn!(device = %key, "device already registered");
            return Err(Error::Registry("device already registered"));
        }
        let handler: Arc<dyn DeviceHandler> = Arc::new(handler);

        if inner.config.role == DeviceRole::Switch {
            let device = Device::new(key, max_version, None, None, handler);
            inner
                .registries
                .devices
                .insert_new(key, Arc::new(device))
                .inspect_err(|_| warn!(device = %key, "device already registered"))?;
            info!(device = %key, "device registered");
            return Ok(());
        }

        let transport = inner.transports.get(key.proto);
        let passive = transport
            .open_passive(&key)
            .inspect_err(|e| error!(device = %key, error = %e, "failed to open passive endpoint"))?;

        let device = Device::new(
            key,
            max_version,
            Some(passive.fd),
            Some(passive.local_addr),
            handler,
        );
        // a concurrent registration of the same key may have won the race
        if let Err(e) = inner.registries.devices.insert_new(key, Arc::new(device)) {
            warn!(device = %key, fd = passive.fd, "device already registered, closing passive endpoint");
            let _ = transport.close(passive.fd);
            return Err(e);
        }

        let attached = self.attach_passive(&key, passive.fd);
        if let Err(e) = attached {
            error!(device = %key, fd = passive.fd, error = %e, "failed to attach passive endpoint");
            let _ = inner.registries.devices.remove(&key);
            let _ = transport.close(passive.fd);
            return Err(e);
        }

        info!(device = %key, local_addr = %passive.local_addr, fd = passive.fd, "device registered");
        Ok(())
    }

    fn attach_passive(&self, key: &DeviceKey, fd: RawFd) -> Result<()> {
        let inner = &self.inner;
        match key.proto {
            L4Proto::Tcp => {
                inner
                    .listener
                    .add(Registration::socket(fd).on_readable(inner.accept_callback()))?;
            }
            L4Proto::Udp => {
                // The passive descriptor carries every peer's traffic, so it
                // is a raw socket of its own, without a peer address.
                let raw = RawSocket {
                    state: SocketState::Up,
                    thread: inner.listener.clone(),
                    device: *key,
                    proto: L4Proto::Udp,
                    io_fd: fd,
                    peer: None,
                };
                inner.registries.add_device_raw_socket(key, fd, raw)?;
                let reg = Registration::socket(fd)
                    .interest(Interest::Both)
                    .on_readable(inner.datagram_callback())
                    .on_writable(inner.write_callback(L4Proto::Udp));
                if let Err(e) = inner.listener.add(reg) {
                    let _ = inner.registries.remove_device_raw_socket(key, fd);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Remove a device: close all of its channels and its passive endpoint.
    pub fn deregister_device(&self, key: &DeviceKey) -> Result<()> {
        self.inner.deregister(key)
    }

    /// Open a channel to the controller of a device registered in the switch role.
    pub fn connect(&self, key: &DeviceKey, channel: ChannelKey) -> Result<()> {
        let inner = &self.inner;
        if !inner.registries.devices.contains(key) {
            return Err(Error::InvalidArgument("unknown device"));
        }
        let transport = inner.transports.get(key.proto);
        let fd = transport
            .open_active(key, &channel)
            .inspect_err(|e| warn!(device = %key, error = %e, "connect failed"))?;
        inner
            .establish(key, fd, fd, channel, Some(key.controller_addr()), true)
            .inspect_err(|_| {
                let _ = transport.close(fd);
            })?;
        info!(device = %key, fd, dp_id = channel.dp_id, aux_id = channel.aux_id, "channel connected");
        Ok(())
    }

    /// Queue a payload on a channel.
    pub fn send(&self, channel: &ChannelKey, payload: impl Into<Bytes>) -> Result<()> {
        let inner = &self.inner;
        let (raw_fd, raw) = inner.registries.route(channel)?;
        if raw.state != SocketState::Up {
            inner.registries.record_tx(channel, false);
            return Err(Error::Registry("channel is not up"));
        }
        let mut out = Outbound::new(payload).via(raw_fd);
        if raw.io_fd != raw_fd
            && let Some(peer) = raw.peer
        {
            out = out.to(peer);
        }
        let len = out.payload.len();
        inner
            .registries
            .queue_tx(channel, len, inner.config.max_pending_bytes)
            .inspect_err(|_| {
                debug!(dp_id = channel.dp_id, aux_id = channel.aux_id, len, "output queue full, payload dropped");
            })?;
        trace!(dp_id = channel.dp_id, aux_id = channel.aux_id, fd = raw.io_fd, len, "send queued");
        raw.thread.enqueue_send(raw.io_fd, out).inspect_err(|e| {
            inner.registries.dequeue_tx(channel, len);
            inner.registries.record_tx(channel, false);
            warn!(dp_id = channel.dp_id, aux_id = channel.aux_id, error = %e, "send failed");
        })
    }

    /// Close a channel and its raw socket.
    pub fn close_channel(&self, channel: &ChannelKey) -> Result<()> {
        let raw_fd = self.inner.registries.channels.lookup(channel)?.raw_fd;
        self.inner.close_raw_socket(raw_fd, true)
    }

    /// Replace a channel's provisional identity with its authoritative one.
    pub fn rekey_channel(&self, old: &ChannelKey, new: ChannelKey) -> Result<()> {
        self.inner.registries.rekey_channel(old, new)?;
        debug!(old = %old, new = %new, "channel rekeyed");
        Ok(())
    }

    pub fn channel_stats(&self, channel: &ChannelKey) -> Result<ChannelStats> {
        self.inner.registries.channel_stats(channel)
    }

    pub fn channels(&self) -> Vec<ChannelKey> {
        self.inner.registries.channels.keys()
    }

    /// Bound address of a device's passive endpoint.
    pub fn local_addr(&self, key: &DeviceKey) -> Result<SocketAddrV4> {
        self.inner
            .registries
            .devices
            .lookup(key)?
            .local_addr
            .ok_or(Error::NotFound("passive endpoint"))
    }

    /// Deregister every device and stop all threads.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("role", &self.inner.config.role)
            .field("devices", &self.inner.registries.devices.len())
            .field("channels", &self.inner.registries.channels.len())
            .field("pool_threads", &self.inner.pool.len())
            .finish()
    }
}

impl DriverInner {
    fn transport(&self, proto: L4Proto) -> &dyn Transport {
        self.transports.get(proto)
    }

    fn next_synthetic_fd(&self) -> RawFd {
        self.next_synthetic.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Readable callback for stream listeners: accept every pending peer.
    fn accept_callback(self: &Arc<Self>) -> impl FnMut(&IoEvent<'_>) -> Result<Action> + Send + 'static {
        let weak = Arc::downgrade(self);
        move |ev: &IoEvent<'_>| {
            let Some(inner) = weak.upgrade() else {
                return Ok(Action::Remove);
            };
            let Some(device) = inner.registries.device_by_listen_fd(ev.fd) else {
                warn!(fd = ev.fd, "no device for listener");
                return Ok(Action::Remove);
            };
            let transport = inner.transport(device.key.proto);
            loop {
                match transport.accept(ev.fd) {
                    Ok(Some((fd, peer))) => {
                        let chan = ChannelKey::provisional(fd);
                        match inner.establish(&device.key, fd, fd, chan, Some(peer), true) {
                            Ok(()) => info!(fd, %peer, device = %device.key, "channel accepted"),
                            Err(e) => {
                                warn!(fd, %peer, error = %e, "failed to establish channel");
                                let _ = transport.close(fd);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_would_block() => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(Action::Keep)
        }
    }

    /// Readable callback for datagram passive endpoints.
    fn datagram_callback(self: &Arc<Self>) -> impl FnMut(&IoEvent<'_>) -> Result<Action> + Send + 'static {
        let weak = Arc::downgrade(self);
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        move |ev: &IoEvent<'_>| {
            let Some(inner) = weak.upgrade() else {
                return Ok(Action::Remove);
            };
            let Received { len, from } = match inner.transport(L4Proto::Udp).read(ev.fd, &mut buf) {
                Ok(got) => got,
                Err(e) if e.is_would_block() => return Ok(Action::Keep),
                Err(e) => return Err(e),
            };
            let Some(peer) = from else {
                debug!(fd = ev.fd, "datagram without source, dropped");
                return Ok(Action::Keep);
            };
            if len == 0 {
                debug!(fd = ev.fd, %peer, "empty datagram dropped");
                return Ok(Action::Keep);
            }

            let raw_fd = match inner.registries.raw_socket_by_peer(ev.fd, peer) {
                Some(raw_fd) => raw_fd,
                None => match inner.admit_datagram_peer(ev.fd, peer) {
                    Ok(raw_fd) => raw_fd,
                    Err(e) => {
                        warn!(fd = ev.fd, %peer, error = %e, "failed to establish datagram channel");
                        return Ok(Action::Keep);
                    }
                },
            };
            inner.deliver_inbound(raw_fd, &buf[..len]);
            Ok(Action::Keep)
        }
    }

    /// Readable callback for a per-peer socket served by a pooled thread.
    fn channel_callback(
        self: &Arc<Self>,
        proto: L4Proto,
    ) -> impl FnMut(&IoEvent<'_>) -> Result<Action> + Send + 'static {
        let weak = Arc::downgrade(self);
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        move |ev: &IoEvent<'_>| {
            let Some(inner) = weak.upgrade() else {
                return Ok(Action::Remove);
            };
            let closed = match inner.transport(proto).read(ev.fd, &mut buf) {
                Ok(Received { len: 0, .. }) if proto == L4Proto::Tcp => true,
                Ok(Received { len: 0, .. }) => false,
                Ok(Received { len, .. }) => {
                    inner.deliver_inbound(ev.handle, &buf[..len]);
                    false
                }
                Err(e) if e.is_would_block() => false,
                Err(e) => {
                    warn!(fd = ev.fd, error = %e, "read failed, closing channel");
                    true
                }
            };
            if !closed {
                return Ok(Action::Keep);
            }
            info!(fd = ev.fd, "peer closed");
            // the loop drops the registration when we return Remove
            if let Err(e) = inner.close_raw_socket(ev.handle, false) {
                warn!(fd = ev.fd, error = %e, "failed to release raw socket");
            }
            Ok(Action::Remove)
        }
    }

    /// Writable callback shared by every socket the driver registers.
    fn write_callback(
        self: &Arc<Self>,
        proto: L4Proto,
    ) -> impl FnMut(&IoEvent<'_>, Outbound) -> Result<Action> + Send + 'static {
        let weak = Arc::downgrade(self);
        move |ev: &IoEvent<'_>, out: Outbound| {
            let Some(inner) = weak.upgrade() else {
                return Ok(Action::Remove);
            };
            let route = out.route.unwrap_or(ev.handle);
            let chan = inner.registries.channel_by_raw_socket(route);
            let len = out.payload.len();
            let (written, delivered) = match inner.transport(proto).write(ev.fd, &out.payload, out.dest) {
                Ok(n) if n == len => (n, Some(true)),
                // stream sockets take the rest once writable again
                Ok(n) if proto == L4Proto::Tcp => (n, None),
                Ok(n) => {
                    warn!(fd = ev.fd, written = n, len, "short datagram write");
                    (len, Some(false))
                }
                Err(e) => {
                    warn!(fd = ev.fd, error = %e, "write failed");
                    (len, Some(false))
                }
            };
            if let Some(chan) = chan {
                inner.registries.dequeue_tx(&chan, written);
                if let Some(delivered) = delivered {
                    inner.registries.record_tx(&chan, delivered);
                }
            }
            match delivered {
                Some(_) => Ok(Action::Keep),
                None => Ok(Action::Partial(written)),
            }
        }
    }

    /// Run the new-channel path for a datagram peer seen on `io_fd`.
    fn admit_datagram_peer(self: &Arc<Self>, io_fd: RawFd, peer: SocketAddrV4) -> Result<RawFd> {
        let device = self
            .registries
            .device_by_listen_fd(io_fd)
            .ok_or(Error::NotFound("device"))?;
        let raw_fd = self.next_synthetic_fd();
        let chan = ChannelKey::provisional(raw_fd);
        self.establish(&device.key, raw_fd, io_fd, chan, Some(peer), false)?;
        info!(fd = raw_fd, io_fd, %peer, device = %device.key, "datagram channel accepted");
        Ok(raw_fd)
    }

    /// Admit a peer in `Down`, run the accept callback, mark it `Up` and,
    /// when `poll` is set, hand its descriptor to a pooled thread.
    ///
    /// Every failure leaves the registries as they were. The descriptor
    /// itself is left to the caller.
    fn establish(
        self: &Arc<Self>,
        key: &DeviceKey,
        raw_fd: RawFd,
        io_fd: RawFd,
        chan: ChannelKey,
        peer: Option<SocketAddrV4>,
        poll: bool,
    ) -> Result<()> {
        let device = self
            .registries
            .devices
            .lookup(key)
            .map_err(|_| Error::InvalidArgument("unknown device"))?;

        let reservation = if poll {
            Some(self.pool.reserve()?)
        } else {
            None
        };
        let thread = match &reservation {
            Some(r) => r.thread().clone(),
            None => self.listener.clone(),
        };

        let raw = RawSocket {
            state: SocketState::Down,
            thread,
            device: *key,
            proto: key.proto,
            io_fd,
            peer,
        };
        self.registries.admit_peer(key, raw_fd, raw, chan)?;

        if let Err(e) = device.handler().on_channel_accepted(chan, peer) {
            warn!(fd = raw_fd, dp_id = chan.dp_id, aux_id = chan.aux_id, error = %e, "accept callback failed");
            let _ = self.registries.release_raw_socket(raw_fd);
            return Err(e);
        }
        self.registries.set_state(raw_fd, SocketState::Up)?;

        if let Some(reservation) = reservation {
            let reg = Registration::socket(io_fd)
                .interest(Interest::Both)
                .on_readable(self.channel_callback(key.proto))
                .on_writable(self.write_callback(key.proto));
            if let Err(e) = reservation.add(reg) {
                let _ = self.registries.release_raw_socket(raw_fd);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Hand an inbound payload to the owning device if the channel is `Up`.
    /// Returns whether it was delivered.
    fn deliver_inbound(&self, raw_fd: RawFd, payload: &[u8]) -> bool {
        let raw = match self.registries.raw_sockets.lookup(&raw_fd) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(fd = raw_fd, "payload for unknown raw socket dropped");
                return false;
            }
        };
        if raw.state != SocketState::Up {
            debug!(fd = raw_fd, len = payload.len(), "channel down, payload dropped");
            return false;
        }
        let Some(chan) = self.registries.channel_by_raw_socket(raw_fd) else {
            debug!(fd = raw_fd, "no channel for raw socket, payload dropped");
            return false;
        };
        let Ok(device) = self.registries.devices.lookup(&raw.device) else {
            return false;
        };
        self.registries.record_rx(&chan);
        trace!(fd = raw_fd, dp_id = chan.dp_id, aux_id = chan.aux_id, len = payload.len(), "payload received");
        device.handler().on_receive(chan, payload);
        true
    }

    /// CLOSED cascade for one raw socket. Real descriptors are closed;
    /// `unregister` also removes them from their poll thread.
    fn close_raw_socket(&self, raw_fd: RawFd, unregister: bool) -> Result<()> {
        let released = self.registries.release_raw_socket(raw_fd)?;
        let raw = released.raw;
        if raw.io_fd == raw_fd {
            if unregister {
                match raw.thread.remove(raw_fd) {
                    Ok(()) | Err(Error::NotFound(_)) | Err(Error::Stopped) => {}
                    Err(e) => warn!(fd = raw_fd, error = %e, "failed to remove from poll thread"),
                }
            }
            self.transport(raw.proto).close(raw_fd)?;
        }
        debug!(fd = raw_fd, channels = released.channels.len(), "channel closed");
        Ok(())
    }

    fn deregister(&self, key: &DeviceKey) -> Result<()> {
        let device = self.registries.devices.lookup(key)?;

        if let Some(listen_fd) = device.listen_fd {
            match self.listener.remove(listen_fd) {
                Ok(()) | Err(Error::NotFound(_)) | Err(Error::Stopped) => {}
                Err(e) => warn!(fd = listen_fd, error = %e, "failed to remove listener"),
            }
            if key.proto == L4Proto::Udp {
                let _ = self.registries.remove_device_raw_socket(key, listen_fd);
            }
        }

        for raw_fd in device.sockets() {
            if let Err(e) = self.close_raw_socket(raw_fd, true) {
                warn!(fd = raw_fd, error = %e, "failed to close channel");
            }
        }

        if let Some(listen_fd) = device.listen_fd {
            let _ = self.transport(key.proto).close(listen_fd);
        }
        self.registries.devices.remove(key)?;
        info!(device = %key, "device deregistered");
        Ok(())
    }

    fn teardown(&self) {
        for key in self.registries.devices.keys() {
            if let Err(e) = self.deregister(&key) {
                warn!(device = %key, error = %e, "failed to deregister device");
            }
        }
        self.listener.shutdown();
        self.pool.shutdown();
    }
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        self.teardown();
        debug!("driver stopped");
    }
}
