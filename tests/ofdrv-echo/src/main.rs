//! OpenFlow echo controller
//!
//! Listens for switches over TCP or UDP and echoes every payload back on the
//! channel it arrived on. Useful for poking at the driver by hand.
//!
//! # Usage
//!
//! ```bash
//! ofdrv-echo --proto tcp --addr 0.0.0.0:6653
//! ofdrv-echo --proto udp --addr 127.0.0.1:6653 --max-sockets 32
//! ```
//!
//! # Testing
//!
//! ```bash
//! echo hello | nc 127.0.0.1 6653
//! echo hello | nc -u 127.0.0.1 6653
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use clap::{Parser, ValueEnum};
use ofdrv::{DeviceKey, Driver, DriverConfig, L4Proto, OfVersion};
use ofdrv_test::Inbox;
use ofdrv_test::echo::{run_echo, setup_ctrlc_handler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Proto {
    Tcp,
    Udp,
}

impl From<Proto> for L4Proto {
    fn from(p: Proto) -> Self {
        match p {
            Proto::Tcp => L4Proto::Tcp,
            Proto::Udp => L4Proto::Udp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ofdrv-echo")]
#[command(about = "OpenFlow controller that echoes payloads back to switches")]
struct Args {
    /// Transport the controller listens on
    #[arg(short, long, value_enum, default_value = "tcp")]
    proto: Proto,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:6653")]
    addr: SocketAddrV4,

    /// Sockets served by each pooled poll thread
    #[arg(long, default_value_t = ofdrv::config::DEFAULT_MAX_SOCKETS_PER_THREAD)]
    max_sockets: usize,

    /// Receive buffer size per read
    #[arg(long, default_value_t = ofdrv::config::DEFAULT_RECV_BUFFER_SIZE)]
    recv_buffer: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args = Args::parse();
    info!(?args, "ofdrv-echo starting");

    let config = DriverConfig::new()
        .max_sockets_per_thread(args.max_sockets)
        .recv_buffer_size(args.recv_buffer);
    let driver = match Driver::new(config) {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = %e, "failed to start driver");
            std::process::exit(1);
        }
    };

    let key = DeviceKey::new(
        args.addr,
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        args.proto.into(),
    );
    let (inbox, events) = Inbox::new();
    if let Err(e) = driver.register_device(key, OfVersion::V1_3, inbox) {
        error!(device = %key, error = %e, "failed to register device");
        std::process::exit(1);
    }
    match driver.local_addr(&key) {
        Ok(addr) => info!(%addr, proto = %key.proto, "listening"),
        Err(e) => error!(error = %e, "no local address"),
    }

    let running = setup_ctrlc_handler();
    let stats = run_echo(&driver, &events, &running);

    driver.shutdown();
    info!(
        channels = stats.channels,
        echoed = stats.echoed,
        "ofdrv-echo stopped"
    );
}
