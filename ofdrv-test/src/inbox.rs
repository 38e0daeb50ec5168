//! A device handler that forwards every callback into a channel.

use std::net::SocketAddrV4;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use ofdrv::{ChannelKey, DeviceHandler, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accepted(ChannelKey, Option<SocketAddrV4>),
    Received(ChannelKey, Vec<u8>),
}

pub struct Inbox {
    tx: Sender<Event>,
    reject: bool,
}

impl Inbox {
    pub fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, reject: false }, rx)
    }

    /// An inbox whose accept callback fails, so every channel is closed.
    pub fn rejecting() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, reject: true }, rx)
    }
}

impl DeviceHandler for Inbox {
    fn on_channel_accepted(&self, channel: ChannelKey, peer: Option<SocketAddrV4>) -> Result<()> {
        let _ = self.tx.send(Event::Accepted(channel, peer));
        if self.reject {
            return Err(Error::InvalidArgument("channel rejected"));
        }
        Ok(())
    }

    fn on_receive(&self, channel: ChannelKey, payload: &[u8]) {
        let _ = self.tx.send(Event::Received(channel, payload.to_vec()));
    }
}

/// Next event, or `None` after `timeout`.
pub fn next_event(rx: &Receiver<Event>, timeout: Duration) -> Option<Event> {
    match rx.recv_timeout(timeout) {
        Ok(ev) => Some(ev),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
    }
}

/// Wait for an `Accepted` event and return its channel.
pub fn expect_accepted(rx: &Receiver<Event>, timeout: Duration) -> (ChannelKey, Option<SocketAddrV4>) {
    match next_event(rx, timeout) {
        Some(Event::Accepted(chan, peer)) => (chan, peer),
        other => panic!("expected accepted, got {other:?}"),
    }
}

/// Wait for a `Received` event and return it.
pub fn expect_received(rx: &Receiver<Event>, timeout: Duration) -> (ChannelKey, Vec<u8>) {
    match next_event(rx, timeout) {
        Some(Event::Received(chan, payload)) => (chan, payload),
        other => panic!("expected received, got {other:?}"),
    }
}
