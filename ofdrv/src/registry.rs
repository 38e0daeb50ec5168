//! Device, Channel and RawSocket registries.
//!
//! Each map has its own lock. Operations that span maps take the locks in
//! the fixed order Device, Channel, RawSocket; single-map readers lock only
//! the map they read. No lock is held across I/O or application callbacks:
//! lookups hand back clones.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::driver::DeviceHandler;
use crate::pollthr::PollThread;
use crate::types::{ChannelKey, DeviceKey, L4Proto, OfVersion};
use crate::{Error, Result};

/// A lock-protected map.
pub struct Table<K, V> {
    name: &'static str,
    inner: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Table<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace. Returns true if an existing value was replaced.
    pub fn upsert(&self, key: K, value: V) -> bool {
        self.inner.lock().insert(key, value).is_some()
    }

    /// Insert only if `key` is absent; checked and inserted under one lock.
    pub fn insert_new(&self, key: K, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&key) {
            return Err(Error::Registry("key already registered"));
        }
        inner.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<V> {
        self.inner.lock().remove(key).ok_or(Error::NotFound(self.name))
    }

    pub fn lookup(&self, key: &K) -> Result<V> {
        self.inner
            .lock()
            .get(key)
            .cloned()
            .ok_or(Error::NotFound(self.name))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.inner.lock()
    }
}

/// A registered device.
pub struct Device {
    pub key: DeviceKey,
    pub max_version: OfVersion,
    /// Passive endpoint; `None` for devices registered in the switch role.
    pub listen_fd: Option<RawFd>,
    pub local_addr: Option<SocketAddrV4>,
    sockets: Mutex<Vec<RawFd>>,
    handler: Arc<dyn DeviceHandler>,
}

impl Device {
    pub fn new(
        key: DeviceKey,
        max_version: OfVersion,
        listen_fd: Option<RawFd>,
        local_addr: Option<SocketAddrV4>,
        handler: Arc<dyn DeviceHandler>,
    ) -> Self {
        Self {
            key,
            max_version,
            listen_fd,
            local_addr,
            sockets: Mutex::new(Vec::new()),
            handler,
        }
    }

    /// Raw sockets currently linked to this device.
    pub fn sockets(&self) -> Vec<RawFd> {
        self.sockets.lock().clone()
    }

    pub fn handler(&self) -> &Arc<dyn DeviceHandler> {
        &self.handler
    }

    fn link(&self, fd: RawFd) {
        let mut sockets = self.sockets.lock();
        if !sockets.contains(&fd) {
            sockets.push(fd);
        }
    }

    fn unlink(&self, fd: RawFd) -> bool {
        let mut sockets = self.sockets.lock();
        match sockets.iter().position(|s| *s == fd) {
            Some(pos) => {
                sockets.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.key)
            .field("max_version", &self.max_version)
            .field("listen_fd", &self.listen_fd)
            .field("local_addr", &self.local_addr)
            .field("sockets", &*self.sockets.lock())
            .finish()
    }
}

/// Per-channel packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub tx_drops: u64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    /// Key of the raw socket carrying this channel.
    pub raw_fd: RawFd,
    pub retries: u32,
    pub stats: ChannelStats,
    /// Bytes handed to the poll thread and not yet written.
    pub pending_bytes: usize,
}

impl Channel {
    pub fn new(raw_fd: RawFd) -> Self {
        Self {
            raw_fd,
            retries: 0,
            stats: ChannelStats::default(),
            pending_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Down,
    Up,
}

#[derive(Debug, Clone)]
pub struct RawSocket {
    pub state: SocketState,
    /// Poll thread serving `io_fd`.
    pub thread: Arc<PollThread>,
    pub device: DeviceKey,
    pub proto: L4Proto,
    /// Descriptor used for I/O. Differs from the registry key only for
    /// synthetic datagram peers, which share the passive descriptor.
    pub io_fd: RawFd,
    /// Remote address; required for datagram peers.
    pub peer: Option<SocketAddrV4>,
}

/// What a CLOSED cascade removed.
#[derive(Debug)]
pub struct Released {
    pub raw: RawSocket,
    pub channels: Vec<ChannelKey>,
}

/// The three registries.
pub struct Registries {
    pub devices: Table<DeviceKey, Arc<Device>>,
    pub channels: Table<ChannelKey, Channel>,
    pub raw_sockets: Table<RawFd, RawSocket>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            devices: Table::new("device"),
            channels: Table::new("channel"),
            raw_sockets: Table::new("raw socket"),
        }
    }

    /// Insert a raw socket and link it to its device.
    ///
    /// Nothing is modified if the device is unknown or `fd` is taken.
    pub fn add_device_raw_socket(
        &self,
        device_key: &DeviceKey,
        fd: RawFd,
        raw: RawSocket,
    ) -> Result<()> {
        let devices = self.devices.lock();
        let mut raw_sockets = self.raw_sockets.lock();

        let Some(device) = devices.get(device_key) else {
            warn!(fd, device = %device_key, "device missing, raw socket not added");
            return Err(Error::InvalidArgument("unknown device"));
        };
        if raw_sockets.contains_key(&fd) {
            warn!(fd, device = %device_key, "raw socket already registered");
            return Err(Error::Registry("raw socket already registered"));
        }
        raw_sockets.insert(fd, raw);
        device.link(fd);
        Ok(())
    }

    /// Unlink a raw socket from its device and remove it. The device link is
    /// restored if the raw socket entry is missing.
    pub fn remove_device_raw_socket(&self, device_key: &DeviceKey, fd: RawFd) -> Result<()> {
        let device = self.devices.lookup(device_key)?;
        if !device.unlink(fd) {
            return Err(Error::NotFound("device raw socket"));
        }
        if let Err(e) = self.raw_sockets.remove(&fd) {
            device.link(fd);
            warn!(fd, device = %device_key, "raw socket missing, device link restored");
            return Err(e);
        }
        Ok(())
    }

    /// Record a newly observed peer in all three registries at once.
    ///
    /// Nothing is modified if the device is unknown or either key is taken.
    pub fn admit_peer(
        &self,
        device_key: &DeviceKey,
        fd: RawFd,
        raw: RawSocket,
        channel_key: ChannelKey,
    ) -> Result<()> {
        let devices = self.devices.lock();
        let mut channels = self.channels.lock();
        let mut raw_sockets = self.raw_sockets.lock();

        let device = devices
            .get(device_key)
            .ok_or(Error::InvalidArgument("unknown device"))?;
        if raw_sockets.contains_key(&fd) {
            return Err(Error::Registry("raw socket already registered"));
        }
        if channels.contains_key(&channel_key) {
            return Err(Error::Registry("channel already registered"));
        }

        raw_sockets.insert(fd, raw);
        channels.insert(channel_key, Channel::new(fd));
        device.link(fd);
        debug!(
            fd,
            dp_id = channel_key.dp_id,
            aux_id = channel_key.aux_id,
            device = %device_key,
            "peer admitted"
        );
        Ok(())
    }

    /// Remove a raw socket, every channel it carries and its device link.
    pub fn release_raw_socket(&self, fd: RawFd) -> Result<Released> {
        let devices = self.devices.lock();
        let mut channels = self.channels.lock();
        let mut raw_sockets = self.raw_sockets.lock();

        let raw = raw_sockets.remove(&fd).ok_or(Error::NotFound("raw socket"))?;

        let mut removed = Vec::new();
        channels.retain(|key, chan| {
            if chan.raw_fd == fd {
                removed.push(*key);
                false
            } else {
                true
            }
        });

        match devices.get(&raw.device) {
            Some(device) => {
                device.unlink(fd);
            }
            None => warn!(fd, device = %raw.device, "released raw socket had no device"),
        }

        debug!(fd, channels = removed.len(), "raw socket released");
        Ok(Released {
            raw,
            channels: removed,
        })
    }

    pub fn channel_by_raw_socket(&self, fd: RawFd) -> Option<ChannelKey> {
        self.channels
            .lock()
            .iter()
            .find(|(_, chan)| chan.raw_fd == fd)
            .map(|(key, _)| *key)
    }

    pub fn device_by_listen_fd(&self, fd: RawFd) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .values()
            .find(|device| device.listen_fd == Some(fd))
            .cloned()
    }

    /// Find the raw socket serving `peer` through descriptor `io_fd`.
    pub fn raw_socket_by_peer(&self, io_fd: RawFd, peer: SocketAddrV4) -> Option<RawFd> {
        self.raw_sockets
            .lock()
            .iter()
            .find(|(_, raw)| raw.io_fd == io_fd && raw.peer == Some(peer))
            .map(|(fd, _)| *fd)
    }

    pub fn set_state(&self, fd: RawFd, state: SocketState) -> Result<()> {
        let mut raw_sockets = self.raw_sockets.lock();
        let raw = raw_sockets
            .get_mut(&fd)
            .ok_or(Error::NotFound("raw socket"))?;
        raw.state = state;
        Ok(())
    }

    /// Move a channel to its authoritative identity.
    pub fn rekey_channel(&self, old: &ChannelKey, new: ChannelKey) -> Result<()> {
        let mut channels = self.channels.lock();
        if old == &new {
            return if channels.contains_key(old) {
                Ok(())
            } else {
                Err(Error::NotFound("channel"))
            };
        }
        if channels.contains_key(&new) {
            return Err(Error::Registry("channel already registered"));
        }
        let chan = channels.remove(old).ok_or(Error::NotFound("channel"))?;
        channels.insert(new, chan);
        Ok(())
    }

    /// Channel and raw socket carrying `channel_key`.
    pub fn route(&self, channel_key: &ChannelKey) -> Result<(RawFd, RawSocket)> {
        let raw_fd = self.channels.lookup(channel_key)?.raw_fd;
        let raw = self.raw_sockets.lookup(&raw_fd)?;
        Ok((raw_fd, raw))
    }

    pub fn record_rx(&self, channel_key: &ChannelKey) {
        if let Some(chan) = self.channels.lock().get_mut(channel_key) {
            chan.stats.rx_pkts += 1;
        }
    }

    pub fn record_tx(&self, channel_key: &ChannelKey, delivered: bool) {
        if let Some(chan) = self.channels.lock().get_mut(channel_key) {
            if delivered {
                chan.stats.tx_pkts += 1;
            } else {
                chan.stats.tx_drops += 1;
            }
        }
    }

    /// Account `len` bytes of new output against a channel's queue limit.
    /// Over the limit the payload counts as a drop instead.
    pub fn queue_tx(&self, channel_key: &ChannelKey, len: usize, limit: usize) -> Result<()> {
        let mut channels = self.channels.lock();
        let chan = channels
            .get_mut(channel_key)
            .ok_or(Error::NotFound("channel"))?;
        if chan.pending_bytes.saturating_add(len) > limit {
            chan.stats.tx_drops += 1;
            return Err(Error::QueueFull);
        }
        chan.pending_bytes += len;
        Ok(())
    }

    /// `len` queued bytes left the queue, written or not.
    pub fn dequeue_tx(&self, channel_key: &ChannelKey, len: usize) {
        if let Some(chan) = self.channels.lock().get_mut(channel_key) {
            chan.pending_bytes = chan.pending_bytes.saturating_sub(len);
        }
    }

    pub fn channel_stats(&self, channel_key: &ChannelKey) -> Result<ChannelStats> {
        Ok(self.channels.lookup(channel_key)?.stats)
    }
}
