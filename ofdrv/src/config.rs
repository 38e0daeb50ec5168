//! Driver configuration.

use crate::types::DeviceRole;

/// Default number of application sockets a single poll thread serves.
pub const DEFAULT_MAX_SOCKETS_PER_THREAD: usize = 128;

/// Default number of auxiliary pipes a single poll thread serves.
pub const DEFAULT_MAX_PIPES_PER_THREAD: usize = 16;

/// Default size of the per-read receive buffer.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Default listen backlog for stream endpoints.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 64;

/// Default limit on a channel's queued, not yet written output.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4 << 20;

/// Builder-style configuration for [`Driver`](crate::Driver).
///
/// # Example
///
/// ```
/// use ofdrv::{DeviceRole, DriverConfig};
///
/// let config = DriverConfig::new()
///     .role(DeviceRole::Controller)
///     .max_sockets_per_thread(32)
///     .recv_buffer_size(8192);
/// assert_eq!(config.max_sockets_per_thread, 32);
/// ```
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub role: DeviceRole,
    pub max_sockets_per_thread: usize,
    pub max_pipes_per_thread: usize,
    pub recv_buffer_size: usize,
    pub listen_backlog: i32,
    pub max_pending_bytes: usize,
    pub listener_thread_name: String,
    pub pool_thread_prefix: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self {
            role: DeviceRole::Controller,
            max_sockets_per_thread: DEFAULT_MAX_SOCKETS_PER_THREAD,
            max_pipes_per_thread: DEFAULT_MAX_PIPES_PER_THREAD,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            listener_thread_name: "oflisten_thr".to_string(),
            pool_thread_prefix: "rwthr".to_string(),
        }
    }

    /// Set the role this process plays (default: controller).
    pub fn role(mut self, role: DeviceRole) -> Self {
        self.role = role;
        self
    }

    /// Set the per-thread application socket limit (default: 128).
    pub fn max_sockets_per_thread(mut self, n: usize) -> Self {
        self.max_sockets_per_thread = n;
        self
    }

    /// Set the per-thread auxiliary pipe limit (default: 16).
    pub fn max_pipes_per_thread(mut self, n: usize) -> Self {
        self.max_pipes_per_thread = n;
        self
    }

    /// Set the receive buffer size used for each read (default: 4096).
    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.recv_buffer_size = n;
        self
    }

    /// Set the listen backlog for stream endpoints (default: 64).
    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    /// Set how many bytes a channel may have queued but unwritten before
    /// further sends are dropped (default: 4 MiB).
    pub fn max_pending_bytes(mut self, n: usize) -> Self {
        self.max_pending_bytes = n;
        self
    }

    /// Set the name of the dedicated listener poll thread.
    pub fn listener_thread_name(mut self, name: impl Into<String>) -> Self {
        self.listener_thread_name = name.into();
        self
    }

    /// Set the name prefix for pooled poll threads.
    pub fn pool_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pool_thread_prefix = prefix.into();
        self
    }
}
