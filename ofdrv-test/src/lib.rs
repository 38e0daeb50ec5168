pub mod echo;
pub mod inbox;

pub use inbox::{Event, Inbox};

pub mod util {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Once;
    use std::time::{Duration, Instant};

    use ofdrv::{DeviceKey, L4Proto};
    use tracing_subscriber::EnvFilter;

    /// How long tests wait for something to happen on another thread.
    pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    static TRACING: Once = Once::new();

    /// Install a test subscriber once per process. `RUST_LOG` overrides the
    /// default `ofdrv=debug` filter.
    pub fn init_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("ofdrv=debug")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    /// A loopback device on an ephemeral controller port.
    pub fn loopback_device(proto: L4Proto) -> DeviceKey {
        DeviceKey::new(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            proto,
        )
    }

    /// Switch-side key for a controller listening on `controller`.
    pub fn switch_device(controller: SocketAddrV4, proto: L4Proto) -> DeviceKey {
        DeviceKey::new(
            controller,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            proto,
        )
    }

    /// Poll `cond` until it holds or `timeout` passes.
    pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }
}
