//! OpenFlow channel driver core.
//!
//! Establishes and maintains controller/switch channels over TCP or UDP,
//! multiplexed across a pool of `poll(2)` threads, and tracks device,
//! channel and socket state in shared registries.
//!
//! - [`pollthr`]: poll threads whose descriptor set can change while they wait
//! - [`pool`]: placement of sockets across poll threads
//! - [`registry`]: Device, Channel and RawSocket maps
//! - [`transport`]: TCP and UDP behind one trait
//! - [`driver`]: ties the above together

pub mod config;
pub mod driver;
pub mod error;
pub mod pollthr;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod types;

pub use config::DriverConfig;
pub use driver::{DeviceHandler, Driver};
pub use error::{Errno, Error, Result};
pub use registry::ChannelStats;
pub use types::{ChannelKey, DeviceKey, DeviceRole, L4Proto, MAX_OPEN_FILES, OfVersion};
