//! Placement of sockets across poll threads.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::pollthr::{FdKind, PollThread, Registration, Reservation};
use crate::{Error, Result};

/// Grow-only list of poll threads, newest first.
///
/// Readers scan a snapshot without locking; growth is serialised so two
/// callers racing on a full pool create one thread between them.
pub struct PollThreadPool {
    threads: ArcSwap<Vec<Arc<PollThread>>>,
    grow: Mutex<()>,
    next_id: AtomicUsize,
    prefix: String,
    max_sockets: usize,
    max_pipes: usize,
}

impl PollThreadPool {
    pub fn new(prefix: impl Into<String>, max_sockets: usize, max_pipes: usize) -> Self {
        Self {
            threads: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
            next_id: AtomicUsize::new(1),
            prefix: prefix.into(),
            max_sockets,
            max_pipes,
        }
    }

    /// Snapshot of the threads, newest first.
    pub fn threads(&self) -> Arc<Vec<Arc<PollThread>>> {
        self.threads.load_full()
    }

    pub fn len(&self) -> usize {
        self.threads.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.load().is_empty()
    }

    /// Reserve a socket slot on the first thread with room, creating a
    /// thread when every existing one is full.
    pub fn reserve(&self) -> Result<Reservation> {
        if let Some(r) = self.scan() {
            return Ok(r);
        }
        let _grow = self.grow.lock();
        // someone else may have grown the pool while we waited
        if let Some(r) = self.scan() {
            return Ok(r);
        }
        let thread = self.spawn_locked()?;
        thread
            .reserve(FdKind::Socket)
            .ok_or(Error::CapacityExhausted)
    }

    /// Like [`reserve`](Self::reserve) but never creates a thread.
    pub fn try_reserve(&self) -> Result<Reservation> {
        self.scan().ok_or(Error::CapacityExhausted)
    }

    /// Add a socket on the first thread with room, growing the pool if needed.
    pub fn place(&self, reg: Registration) -> Result<(Arc<PollThread>, RawFd)> {
        let reservation = self.reserve()?;
        let thread = reservation.thread().clone();
        let fd = reservation.add(reg)?;
        Ok((thread, fd))
    }

    /// Like [`place`](Self::place) but never creates a thread.
    pub fn try_place(&self, reg: Registration) -> Result<(Arc<PollThread>, RawFd)> {
        let reservation = self.try_reserve()?;
        let thread = reservation.thread().clone();
        let fd = reservation.add(reg)?;
        Ok((thread, fd))
    }

    /// Put an already running thread at the front of the pool.
    pub fn adopt(&self, thread: Arc<PollThread>) {
        let _grow = self.grow.lock();
        self.prepend(thread);
    }

    /// Stop every thread. The pool keeps its (stopped) threads.
    pub fn shutdown(&self) {
        for thread in self.threads.load().iter() {
            thread.shutdown();
        }
    }

    fn scan(&self) -> Option<Reservation> {
        self.threads
            .load()
            .iter()
            .find_map(|thread| thread.reserve(FdKind::Socket))
    }

    fn spawn_locked(&self) -> Result<Arc<PollThread>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}", self.prefix, id);
        let thread = PollThread::spawn(name, self.max_sockets, self.max_pipes)?;
        self.prepend(thread.clone());
        info!(thread = %thread.name(), pool_size = self.len(), "pool grew");
        Ok(thread)
    }

    fn prepend(&self, thread: Arc<PollThread>) {
        let current = self.threads.load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.push(thread);
        next.extend(current.iter().cloned());
        debug!(pool_size = next.len(), "pool updated");
        self.threads.store(Arc::new(next));
    }
}
