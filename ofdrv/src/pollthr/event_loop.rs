//! The loop run by every poll thread.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;

use bytes::Buf;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, trace, warn};

use super::registration::{
    Action, FdKind, Interest, IoEvent, Outbound, ReadableFn, Registration, WritableFn,
};
use super::{Control, SendMsg, Shared, new_pipe};
use crate::{Error, Result};

/// A registered descriptor, owned by the loop.
pub(crate) struct FdEntry {
    /// What `add` returned and what `remove`/`enqueue_send` refer to.
    handle: RawFd,
    /// What gets polled.
    poll_fd: RawFd,
    kind: FdKind,
    interest: Interest,
    on_readable: Option<ReadableFn>,
    on_writable: Option<WritableFn>,
    outbox: VecDeque<Outbound>,
    /// Both ends of an auxiliary pipe; closed when the entry is dropped.
    _pipe: Option<(OwnedFd, OwnedFd)>,
}

impl FdEntry {
    pub(crate) fn new(reg: Registration) -> Result<Self> {
        let Registration {
            fd,
            kind,
            interest,
            on_readable,
            on_writable,
        } = reg;

        let (handle, poll_fd, pipe) = match (kind, fd) {
            (FdKind::Socket, Some(fd)) if fd >= 0 => (fd, fd, None),
            (FdKind::Socket, _) => {
                return Err(Error::InvalidArgument("socket registration without descriptor"));
            }
            (FdKind::Pipe, _) => {
                let (rd, wr) = new_pipe()?;
                (wr.as_raw_fd(), rd.as_raw_fd(), Some((rd, wr)))
            }
        };

        Ok(Self {
            handle,
            poll_fd,
            kind,
            interest,
            on_readable,
            on_writable,
            outbox: VecDeque::new(),
            _pipe: pipe,
        })
    }

    pub(crate) fn handle(&self) -> RawFd {
        self.handle
    }

    fn event<'a>(&self, thread: &'a str, fd: RawFd, hangup: bool) -> IoEvent<'a> {
        IoEvent {
            thread,
            fd,
            handle: self.handle,
            kind: self.kind,
            interest: self.interest,
            hangup,
        }
    }
}

/// Run a callback, turning errors and panics into log lines.
fn guarded<F>(thread: &str, fd: RawFd, what: &str, f: F) -> Action
where
    F: FnOnce() -> Result<Action>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(action)) => action,
        Ok(Err(e)) => {
            warn!(thread, fd, callback = what, error = %e, "callback failed");
            Action::Keep
        }
        Err(_) => {
            error!(thread, fd, callback = what, "callback panicked");
            Action::Keep
        }
    }
}

/// Drain a wake pipe. Returns false if its write end is gone.
fn drain(pipe: &File) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match (&*pipe).read(&mut buf) {
            Ok(0) => return false,
            Ok(n) if n < buf.len() => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "failed to drain wake pipe");
                return true;
            }
        }
    }
}

struct Ready {
    control: bool,
    send: bool,
    app: Vec<(RawFd, PollFlags)>,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct EventLoop {
    shared: Arc<Shared>,
    ctrl_rx: Receiver<Control>,
    send_rx: Receiver<SendMsg>,
    ctrl_wake: File,
    send_wake: File,
    entries: Vec<FdEntry>,
}

impl EventLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        ctrl_rx: Receiver<Control>,
        send_rx: Receiver<SendMsg>,
        ctrl_wake: File,
        send_wake: File,
    ) -> Self {
        Self {
            shared,
            ctrl_rx,
            send_rx,
            ctrl_wake,
            send_wake,
            entries: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        debug!(thread = %self.shared.name(), "poll loop running");
        loop {
            let ready = match self.wait() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(thread = %self.shared.name(), error = %e, "poll failed, stopping loop");
                    break;
                }
            };

            if ready.control {
                if let Flow::Stop = self.apply_control() {
                    break;
                }
            }
            if ready.send {
                self.apply_sends();
            }
            for (handle, revents) in ready.app {
                self.dispatch(handle, revents);
            }
        }

        self.shared.running.store(false, Ordering::Release);
        // Fail any requests that raced with shutdown.
        while let Ok(msg) = self.ctrl_rx.try_recv() {
            match msg {
                Control::Add { entry, ack } => {
                    self.shared.release(entry.kind);
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(Error::Stopped));
                    }
                }
                Control::Remove { ack: Some(ack), .. } => {
                    let _ = ack.send(Err(Error::Stopped));
                }
                _ => {}
            }
        }
        for entry in self.entries.drain(..) {
            self.shared.release(entry.kind);
        }
        self.shared.set_poll_fds(0);
        debug!(thread = %self.shared.name(), "poll loop stopped");
    }

    /// Block until something is ready.
    fn wait(&self) -> std::result::Result<Ready, Errno> {
        let mut fds = Vec::with_capacity(self.entries.len() + 2);
        fds.push(PollFd::new(self.ctrl_wake.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.send_wake.as_fd(), PollFlags::POLLIN));
        for entry in &self.entries {
            let flags = entry.interest.poll_flags(!entry.outbox.is_empty());
            // SAFETY: the descriptor stays open while registered; sockets are
            // owned by the caller until removal, pipes by the entry.
            let fd = unsafe { BorrowedFd::borrow_raw(entry.poll_fd) };
            fds.push(PollFd::new(fd, flags));
        }

        poll(&mut fds, PollTimeout::NONE)?;

        let revents = |pfd: &PollFd<'_>| pfd.revents().unwrap_or(PollFlags::empty());
        let app = fds[2..]
            .iter()
            .zip(&self.entries)
            .filter_map(|(pfd, entry)| {
                let r = revents(pfd);
                (!r.is_empty()).then_some((entry.handle, r))
            })
            .collect();

        Ok(Ready {
            control: !revents(&fds[0]).is_empty(),
            send: !revents(&fds[1]).is_empty(),
            app,
        })
    }

    fn apply_control(&mut self) -> Flow {
        if !drain(&self.ctrl_wake) {
            return Flow::Stop;
        }
        while let Ok(msg) = self.ctrl_rx.try_recv() {
            match msg {
                Control::Add { entry, ack } => {
                    let result = self.insert(entry);
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                Control::Remove { handle, ack } => {
                    let result = self.remove(handle);
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    } else if let Err(e) = result {
                        warn!(thread = %self.shared.name(), fd = handle, error = %e, "deferred remove failed");
                    }
                }
                Control::Shutdown => return Flow::Stop,
            }
        }
        Flow::Continue
    }

    fn insert(&mut self, entry: FdEntry) -> Result<RawFd> {
        if self.entries.iter().any(|e| e.handle == entry.handle) {
            self.shared.release(entry.kind);
            warn!(thread = %self.shared.name(), fd = entry.handle, "descriptor already registered");
            return Err(Error::Registry("descriptor already registered"));
        }
        let handle = entry.handle;
        debug!(
            thread = %self.shared.name(),
            fd = handle,
            kind = ?entry.kind,
            interest = ?entry.interest,
            entries = self.entries.len() + 1,
            "descriptor added"
        );
        self.entries.push(entry);
        self.shared.set_poll_fds(self.entries.len() + 2);
        Ok(handle)
    }

    fn remove(&mut self, handle: RawFd) -> Result<()> {
        let Some(pos) = self.entries.iter().position(|e| e.handle == handle) else {
            return Err(Error::NotFound("descriptor"));
        };
        let entry = self.entries.remove(pos);
        self.shared.release(entry.kind);
        self.shared.set_poll_fds(self.entries.len() + 2);
        if !entry.outbox.is_empty() {
            debug!(thread = %self.shared.name(), fd = handle, dropped = entry.outbox.len(), "pending output dropped");
        }
        debug!(
            thread = %self.shared.name(),
            fd = handle,
            entries = self.entries.len(),
            "descriptor removed"
        );
        Ok(())
    }

    fn apply_sends(&mut self) {
        drain(&self.send_wake);
        while let Ok(SendMsg { handle, out }) = self.send_rx.try_recv() {
            let Some(pos) = self.entries.iter().position(|e| e.handle == handle) else {
                warn!(thread = %self.shared.name(), fd = handle, "send target not registered, payload dropped");
                continue;
            };
            let entry = &mut self.entries[pos];
            let kind = entry.kind;
            match kind {
                FdKind::Pipe => {
                    let action = deliver(&self.shared, entry, handle, out);
                    if action == Action::Remove {
                        let _ = self.remove(handle);
                    }
                }
                FdKind::Socket if entry.interest.is_writable() => {
                    trace!(thread = %self.shared.name(), fd = handle, len = out.payload.len(), "payload queued");
                    entry.outbox.push_back(out);
                }
                FdKind::Socket => {
                    warn!(thread = %self.shared.name(), fd = handle, "descriptor not registered for writes, payload dropped");
                }
            }
        }
    }

    fn dispatch(&mut self, handle: RawFd, revents: PollFlags) {
        let thread = self.shared.name().to_string();
        let Some(pos) = self.entries.iter().position(|e| e.handle == handle) else {
            // removed by an earlier callback in this cycle
            return;
        };

        if revents.contains(PollFlags::POLLNVAL) {
            warn!(thread = %thread, fd = handle, "descriptor closed while registered, removing");
            let _ = self.remove(handle);
            return;
        }

        let hangup = revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);
        let readable = revents.contains(PollFlags::POLLIN) || hangup;

        let mut action = Action::Keep;
        {
            let entry = &mut self.entries[pos];
            if readable {
                let ev = entry.event(&thread, entry.poll_fd, hangup);
                match entry.on_readable.as_mut() {
                    Some(cb) => action = guarded(&thread, handle, "readable", || cb(&ev)),
                    None if hangup => {
                        debug!(thread = %thread, fd = handle, "hangup without readable callback, removing");
                        action = Action::Remove;
                    }
                    None => {}
                }
            }

            if action != Action::Remove && revents.contains(PollFlags::POLLOUT) {
                action = flush(&self.shared, entry);
            }
        }

        if action == Action::Remove {
            let _ = self.remove(handle);
        }
    }
}

/// Deliver queued payloads until the queue is empty or the descriptor
/// stops taking data. A partly written payload goes back to the front.
fn flush(shared: &Shared, entry: &mut FdEntry) -> Action {
    let fd = entry.handle;
    while let Some(mut out) = entry.outbox.pop_front() {
        match deliver(shared, entry, fd, out.clone()) {
            Action::Remove => return Action::Remove,
            Action::Partial(n) if n < out.payload.len() => {
                out.payload.advance(n);
                trace!(thread = shared.name(), fd, left = out.payload.len(), "partial write, rest queued");
                entry.outbox.push_front(out);
                return Action::Keep;
            }
            Action::Partial(_) | Action::Keep => {}
        }
    }
    Action::Keep
}

/// Hand one payload to an entry's writable callback.
fn deliver(shared: &Shared, entry: &mut FdEntry, fd: RawFd, out: Outbound) -> Action {
    let thread = shared.name();
    let ev = entry.event(thread, fd, false);
    match entry.on_writable.as_mut() {
        Some(cb) => guarded(thread, entry.handle, "writable", || cb(&ev, out)),
        None => {
            warn!(thread, fd = entry.handle, "no writable callback, payload dropped");
            Action::Keep
        }
    }
}
