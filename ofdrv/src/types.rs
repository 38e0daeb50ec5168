//! Identity types shared by the registries, transports and driver.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Upper bound of the descriptor numbers the OS hands out.
///
/// Synthetic descriptors for connectionless peers are numbered above it, so
/// they can never collide with a real descriptor in the raw-socket registry.
pub const MAX_OPEN_FILES: RawFd = 1 << 20;

/// Layer 4 protocol carrying the OpenFlow channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Proto::Tcp => f.write_str("tcp"),
            L4Proto::Udp => f.write_str("udp"),
        }
    }
}

/// Which end of the OpenFlow channel this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRole {
    /// Accepts connections from switches.
    #[default]
    Controller,
    /// Connects out to a controller.
    Switch,
}

/// OpenFlow wire protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OfVersion {
    V1_0 = 0x01,
    V1_1 = 0x02,
    V1_2 = 0x03,
    V1_3 = 0x04,
    V1_4 = 0x05,
}

impl TryFrom<u8> for OfVersion {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::V1_0),
            0x02 => Ok(Self::V1_1),
            0x03 => Ok(Self::V1_2),
            0x04 => Ok(Self::V1_3),
            0x05 => Ok(Self::V1_4),
            _ => Err(()),
        }
    }
}

/// Identity of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub controller_ip: Ipv4Addr,
    pub switch_ip: Ipv4Addr,
    pub controller_port: u16,
    pub switch_port: u16,
    pub proto: L4Proto,
}

impl DeviceKey {
    pub fn new(
        controller: SocketAddrV4,
        switch: SocketAddrV4,
        proto: L4Proto,
    ) -> Self {
        Self {
            controller_ip: *controller.ip(),
            switch_ip: *switch.ip(),
            controller_port: controller.port(),
            switch_port: switch.port(),
            proto,
        }
    }

    /// Address the controller listens on.
    pub fn controller_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.controller_ip, self.controller_port)
    }

    /// Address the switch end binds to.
    pub fn switch_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.switch_ip, self.switch_port)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} controller={} switch={}",
            self.proto,
            self.controller_addr(),
            self.switch_addr()
        )
    }
}

/// Identity of a logical channel: datapath id plus auxiliary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub dp_id: u64,
    pub aux_id: u32,
}

impl ChannelKey {
    pub fn new(dp_id: u64, aux_id: u32) -> Self {
        Self { dp_id, aux_id }
    }

    /// Provisional identity derived from a descriptor, used until the peer
    /// tells us its real datapath and auxiliary ids.
    pub fn provisional(fd: RawFd) -> Self {
        Self {
            dp_id: fd as u64,
            aux_id: fd as u32,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp_id={:#x} aux_id={}", self.dp_id, self.aux_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_version_try_from() {
        assert_eq!(OfVersion::try_from(0x01), Ok(OfVersion::V1_0));
        assert_eq!(OfVersion::try_from(0x04), Ok(OfVersion::V1_3));
        assert_eq!(OfVersion::try_from(0x05), Ok(OfVersion::V1_4));
        assert_eq!(OfVersion::try_from(0x00), Err(()));
        assert_eq!(OfVersion::try_from(0x99), Err(()));
        assert!(OfVersion::V1_3 > OfVersion::V1_0);
    }

    #[test]
    fn test_device_key_addrs() {
        let key = DeviceKey::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6653),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 0),
            L4Proto::Udp,
        );
        assert_eq!(key.controller_addr().port(), 6653);
        assert_eq!(*key.switch_addr().ip(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(key.proto, L4Proto::Udp);
        assert_eq!(
            key.to_string(),
            "udp controller=10.0.0.1:6653 switch=10.0.0.2:0"
        );
    }

    #[test]
    fn test_provisional_channel_key() {
        let key = ChannelKey::provisional(MAX_OPEN_FILES + 3);
        assert_eq!(key.dp_id, (MAX_OPEN_FILES + 3) as u64);
        assert_eq!(key.aux_id, (MAX_OPEN_FILES + 3) as u32);
    }
}
