//! Poll threads: one OS thread per instance, blocked in `poll(2)` over a
//! bounded set of descriptors.
//!
//! # Architecture
//!
//! A blocking `poll` cannot observe changes another thread makes to its
//! descriptor set, so every poll thread owns two internal channels, each an
//! mpsc queue paired with a non-blocking wake pipe:
//!
//! 1. **control channel**: add/remove/shutdown requests. The loop drains it
//!    right after waking and rebuilds its wait set before waiting again, so
//!    an `add` is visible to the very next readiness check.
//! 2. **send channel**: outbound payloads for descriptors the thread owns.
//!    Producers on any thread enqueue; only the loop thread writes.
//!
//! Capacity counts application sockets only. Auxiliary pipes have their own
//! limit and the two internal pipe pairs are never counted.

mod event_loop;
mod registration;

pub use registration::{
    Action, FdKind, Interest, IoEvent, Outbound, ReadableFn, Registration, WritableFn,
};

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};

use nix::fcntl::OFlag;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result};
use event_loop::{EventLoop, FdEntry};

/// Pipe descriptors held by the two internal channels (two pairs).
pub const INTERNAL_PIPE_FDS: usize = 4;

pub(crate) enum Control {
    Add {
        entry: FdEntry,
        ack: Option<SyncSender<Result<RawFd>>>,
    },
    Remove {
        handle: RawFd,
        ack: Option<SyncSender<Result<()>>>,
    },
    Shutdown,
}

pub(crate) struct SendMsg {
    pub handle: RawFd,
    pub out: Outbound,
}

/// Non-blocking, close-on-exec pipe.
pub(crate) fn new_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?)
}

/// Write end of a wake pipe.
struct Waker(File);

impl Waker {
    fn wake(&self) {
        match (&self.0).write(&[1u8]) {
            Ok(_) => {}
            // Pipe full: the loop has unread wake bytes already.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "failed to wake poll thread"),
        }
    }
}

pub(crate) struct Shared {
    name: String,
    max_sockets: usize,
    max_pipes: usize,
    sockets: AtomicUsize,
    pipes: AtomicUsize,
    poll_fds: AtomicUsize,
    running: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    ctrl_tx: Sender<Control>,
    send_tx: Sender<SendMsg>,
    ctrl_waker: Waker,
    send_waker: Waker,
}

impl Shared {
    fn counter(&self, kind: FdKind) -> (&AtomicUsize, usize) {
        match kind {
            FdKind::Socket => (&self.sockets, self.max_sockets),
            FdKind::Pipe => (&self.pipes, self.max_pipes),
        }
    }

    fn try_acquire(&self, kind: FdKind) -> bool {
        let (counter, max) = self.counter(kind);
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, kind: FdKind) {
        let (counter, _) = self.counter(kind);
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn set_poll_fds(&self, n: usize) {
        self.poll_fds.store(n, Ordering::Release);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// A poll thread.
///
/// Created with [`PollThread::spawn`] and shared as `Arc<PollThread>`.
/// Dropping the last handle stops and joins the thread.
pub struct PollThread {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PollThread {
    /// Start a poll thread serving up to `max_sockets` application sockets
    /// and `max_pipes` auxiliary pipes.
    ///
    /// Fails synchronously if the internal channels or the OS thread cannot
    /// be created.
    pub fn spawn(
        name: impl Into<String>,
        max_sockets: usize,
        max_pipes: usize,
    ) -> Result<Arc<PollThread>> {
        let name = name.into();
        let (ctrl_rd, ctrl_wr) = new_pipe()?;
        let (send_rd, send_wr) = new_pipe()?;
        debug!(
            thread = %name,
            ctrl_rd = ctrl_rd.as_raw_fd(),
            ctrl_wr = ctrl_wr.as_raw_fd(),
            send_rd = send_rd.as_raw_fd(),
            send_wr = send_wr.as_raw_fd(),
            "internal pipes created"
        );

        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        let (send_tx, send_rx) = mpsc::channel();

        let shared = Arc::new(Shared {
            name: name.clone(),
            max_sockets,
            max_pipes,
            sockets: AtomicUsize::new(0),
            pipes: AtomicUsize::new(0),
            poll_fds: AtomicUsize::new(2),
            running: AtomicBool::new(true),
            thread_id: OnceLock::new(),
            ctrl_tx,
            send_tx,
            ctrl_waker: Waker(File::from(ctrl_wr)),
            send_waker: Waker(File::from(send_wr)),
        });

        let event_loop = EventLoop::new(
            shared.clone(),
            ctrl_rx,
            send_rx,
            File::from(ctrl_rd),
            File::from(send_rd),
        );

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || event_loop.run())
            .map_err(Error::Spawn)?;
        let _ = shared.thread_id.set(handle.thread().id());

        info!(thread = %name, max_sockets, max_pipes, "poll thread started");

        Ok(Arc::new(PollThread {
            shared,
            join: Mutex::new(Some(handle)),
        }))
    }

    /// Name the thread was spawned with.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of application sockets that can still be added.
    pub fn available_capacity(&self) -> usize {
        self.shared
            .max_sockets
            .saturating_sub(self.shared.sockets.load(Ordering::Acquire))
    }

    /// Application sockets registered (or reserved).
    pub fn socket_count(&self) -> usize {
        self.shared.sockets.load(Ordering::Acquire)
    }

    /// Auxiliary pipes registered (or reserved).
    pub fn pipe_count(&self) -> usize {
        self.shared.pipes.load(Ordering::Acquire)
    }

    /// Pipe descriptors held by this thread: both ends of the two internal
    /// channels plus both ends of every auxiliary pipe.
    pub fn pipe_fd_count(&self) -> usize {
        INTERNAL_PIPE_FDS + 2 * self.pipe_count()
    }

    /// Descriptors in the loop's current wait set, internal ones included.
    pub fn poll_fd_count(&self) -> usize {
        self.shared.poll_fds.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the caller is running on this poll thread (inside a callback).
    pub fn is_current(&self) -> bool {
        self.shared.thread_id.get() == Some(&std::thread::current().id())
    }

    /// Reserve one unit of capacity of the given kind.
    ///
    /// The reservation is released when dropped unless consumed by
    /// [`Reservation::add`].
    pub fn reserve(self: &Arc<Self>, kind: FdKind) -> Option<Reservation> {
        if !self.is_running() || !self.shared.try_acquire(kind) {
            return None;
        }
        Some(Reservation {
            thread: self.clone(),
            kind,
            armed: true,
        })
    }

    /// Add a descriptor.
    ///
    /// Returns the descriptor the registration is known by: the socket for
    /// [`FdKind::Socket`], the write end of the new pipe for [`FdKind::Pipe`].
    /// Fails with [`Error::CapacityExhausted`] when the thread is full.
    pub fn add(&self, reg: Registration) -> Result<RawFd> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        if !self.shared.try_acquire(reg.kind) {
            debug!(thread = %self.name(), kind = ?reg.kind, "capacity exhausted");
            return Err(Error::CapacityExhausted);
        }
        self.add_acquired(reg)
    }

    /// Add a descriptor whose capacity unit is already held.
    fn add_acquired(&self, reg: Registration) -> Result<RawFd> {
        let kind = reg.kind;
        let entry = match FdEntry::new(reg) {
            Ok(entry) => entry,
            Err(e) => {
                self.shared.release(kind);
                return Err(e);
            }
        };
        let handle = entry.handle();

        if self.is_current() {
            // The loop is running this callback; it applies the request
            // before its next wait.
            if let Err(e) = self.control(Control::Add { entry, ack: None }) {
                self.shared.release(kind);
                return Err(e);
            }
            return Ok(handle);
        }

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if let Err(e) = self.control(Control::Add {
            entry,
            ack: Some(ack_tx),
        }) {
            self.shared.release(kind);
            return Err(e);
        }
        ack_rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Remove a descriptor added earlier.
    ///
    /// Descriptors the thread created (auxiliary pipes) are closed; sockets
    /// stay open and remain owned by the caller. When called from inside one
    /// of this thread's callbacks the removal is applied after the callback
    /// returns and `Ok` is returned immediately.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        if self.is_current() {
            return self.control(Control::Remove {
                handle: fd,
                ack: None,
            });
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.control(Control::Remove {
            handle: fd,
            ack: Some(ack_tx),
        })?;
        ack_rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Queue a payload for delivery through `fd`'s writable callback.
    ///
    /// Safe to call from any thread. Sockets get the payload once they poll
    /// writable; pipes get it as soon as the loop drains its send channel.
    pub fn enqueue_send(&self, fd: RawFd, out: impl Into<Outbound>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        self.shared
            .send_tx
            .send(SendMsg {
                handle: fd,
                out: out.into(),
            })
            .map_err(|_| Error::Stopped)?;
        self.shared.send_waker.wake();
        Ok(())
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.ctrl_tx.send(Control::Shutdown).is_ok() {
            self.shared.ctrl_waker.wake();
        }
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.join.lock().take() {
            if handle.join().is_err() {
                warn!(thread = %self.name(), "poll thread panicked");
            }
        }
    }

    fn control(&self, msg: Control) -> Result<()> {
        self.shared.ctrl_tx.send(msg).map_err(|_| Error::Stopped)?;
        self.shared.ctrl_waker.wake();
        Ok(())
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PollThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollThread")
            .field("name", &self.name())
            .field("sockets", &self.socket_count())
            .field("max_sockets", &self.shared.max_sockets)
            .field("pipes", &self.pipe_count())
            .finish()
    }
}

/// One unit of poll thread capacity held for a descriptor about to be added.
///
/// Lets a caller learn which thread will own a descriptor (and record that
/// in the registries) before the descriptor becomes pollable.
pub struct Reservation {
    thread: Arc<PollThread>,
    kind: FdKind,
    armed: bool,
}

impl Reservation {
    pub fn thread(&self) -> &Arc<PollThread> {
        &self.thread
    }

    /// Add the registration using the reserved unit.
    pub fn add(mut self, reg: Registration) -> Result<RawFd> {
        if reg.kind != self.kind {
            return Err(Error::InvalidArgument("registration kind differs from reservation"));
        }
        self.armed = false;
        self.thread.add_acquired(reg)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.thread.shared.release(self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn test_fresh_thread_health() {
        let thread = PollThread::spawn("thread_tc_1", 10, 1).unwrap();
        assert_eq!(thread.name(), "thread_tc_1");
        assert_eq!(thread.available_capacity(), 10);
        assert_eq!(thread.pipe_fd_count(), INTERNAL_PIPE_FDS);
        assert_eq!(thread.poll_fd_count(), 2);
        assert!(thread.is_running());
        assert!(!thread.is_current());
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let thread = PollThread::spawn("thread_resv", 2, 0).unwrap();
        let first = thread.reserve(FdKind::Socket).unwrap();
        let second = thread.reserve(FdKind::Socket).unwrap();
        assert_eq!(thread.available_capacity(), 0);
        assert!(thread.reserve(FdKind::Socket).is_none());
        assert!(thread.reserve(FdKind::Pipe).is_none());
        drop(first);
        assert_eq!(thread.available_capacity(), 1);
        drop(second);
        assert_eq!(thread.available_capacity(), 2);
    }

    #[test]
    fn test_capacity_exhausted() {
        let thread = PollThread::spawn("thread_full", 1, 0).unwrap();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        thread.add(Registration::socket(a.as_raw_fd())).unwrap();
        assert_eq!(thread.available_capacity(), 0);
        match thread.add(Registration::socket(b.as_raw_fd())) {
            Err(Error::CapacityExhausted) => {}
            other => panic!("unexpected {other:?}"),
        }
        match thread.add(Registration::pipe()) {
            Err(Error::CapacityExhausted) => {}
            other => panic!("unexpected {other:?}"),
        }
        thread.remove(a.as_raw_fd()).unwrap();
        assert_eq!(thread.available_capacity(), 1);
    }

    #[test]
    fn test_remove_unknown_fd() {
        let thread = PollThread::spawn("thread_nf", 4, 1).unwrap();
        match thread.remove(12345) {
            Err(Error::NotFound(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(thread.available_capacity(), 4);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let thread = PollThread::spawn("thread_dup", 4, 0).unwrap();
        let (a, _peer) = UnixStream::pair().unwrap();
        thread.add(Registration::socket(a.as_raw_fd())).unwrap();
        assert!(matches!(
            thread.add(Registration::socket(a.as_raw_fd())),
            Err(Error::Registry(_))
        ));
        assert_eq!(thread.available_capacity(), 3);
    }

    #[test]
    fn test_shutdown_stops_thread() {
        let thread = PollThread::spawn("thread_stop", 4, 1).unwrap();
        thread.shutdown();
        assert!(!thread.is_running());
        assert!(matches!(
            thread.enqueue_send(3, Outbound::new(&b"x"[..])),
            Err(Error::Stopped)
        ));
        assert!(thread.reserve(FdKind::Socket).is_none());
        // second shutdown is a no-op
        thread.shutdown();
    }

    #[test]
    fn test_pipe_readable_callback() {
        let thread = PollThread::spawn("thread_tc_2", 10, 1).unwrap();
        let (tx, rx) = mpsc::channel();
        let wr = thread
            .add(
                Registration::pipe()
                    .interest(Interest::Readable)
                    .on_readable(move |ev| {
                        assert_eq!(ev.thread, "thread_tc_2");
                        assert_eq!(ev.kind, FdKind::Pipe);
                        let mut file = std::mem::ManuallyDrop::new(unsafe {
                            File::from_raw_fd(ev.fd)
                        });
                        let mut buf = [0u8; 32];
                        let n = file.read(&mut buf)?;
                        tx.send(buf[..n].to_vec()).unwrap();
                        Ok(Action::Keep)
                    }),
            )
            .unwrap();
        assert_eq!(thread.pipe_fd_count(), 6);
        assert_eq!(thread.available_capacity(), 10);

        let mut writer = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(wr) });
        writer.write_all(b"hello 1..2..3").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"hello 1..2..3");

        thread.remove(wr).unwrap();
        assert_eq!(thread.pipe_fd_count(), INTERNAL_PIPE_FDS);
        assert_eq!(thread.available_capacity(), 10);
    }
}
