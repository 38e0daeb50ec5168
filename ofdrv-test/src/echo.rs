//! Echo controller: every payload received on a channel is sent back on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use ofdrv::Driver;
use tracing::{info, warn};

use crate::Event;

/// Counters reported when the echo loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoStats {
    pub channels: u64,
    pub echoed: u64,
    pub failed: u64,
}

/// Echo every received payload until `running` is cleared or the inbox closes.
///
/// Runs on the caller's thread; the driver's poll threads only enqueue into
/// `events`, so they never block on a send.
pub fn run_echo(driver: &Driver, events: &Receiver<Event>, running: &AtomicBool) -> EchoStats {
    let mut stats = EchoStats::default();
    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Accepted(chan, peer)) => {
                stats.channels += 1;
                info!(%chan, ?peer, "channel up");
            }
            Ok(Event::Received(chan, payload)) => match driver.send(&chan, payload) {
                Ok(()) => stats.echoed += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(%chan, error = %e, "echo failed");
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(
        channels = stats.channels,
        echoed = stats.echoed,
        failed = stats.failed,
        "echo loop finished"
    );
    stats
}

/// Setup Ctrl+C handler that sets the running flag to false
pub fn setup_ctrlc_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\n\nReceived Ctrl+C, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
    running
}
