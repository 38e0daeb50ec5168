//! Poll thread behaviour against real descriptors.
//!
//! Socket pairs stand in for network sockets; the poll thread cannot tell
//! the difference.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use ofdrv::Error;
use ofdrv::pollthr::{Action, FdKind, INTERNAL_PIPE_FDS, Interest, Outbound, PollThread, Registration};
use ofdrv_test::util::{TEST_TIMEOUT, init_tracing, wait_until};

#[test]
fn test_socket_and_pipe_capacity_accounting() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_cap", 10, 1).unwrap();
    let (sock, _peer) = UnixStream::pair().unwrap();

    // A socket consumes one unit
    thread.add(Registration::socket(sock.as_raw_fd())).unwrap();
    assert_eq!(thread.available_capacity(), 9);
    assert_eq!(thread.socket_count(), 1);
    assert_eq!(thread.poll_fd_count(), 3);

    // A pipe does not, but adds two pipe descriptors
    let wr = thread.add(Registration::pipe()).unwrap();
    assert_eq!(thread.available_capacity(), 9);
    assert_eq!(thread.pipe_count(), 1);
    assert_eq!(thread.pipe_fd_count(), INTERNAL_PIPE_FDS + 2);

    // Pipe limit is separate
    assert!(matches!(
        thread.add(Registration::pipe()),
        Err(Error::CapacityExhausted)
    ));

    thread.remove(sock.as_raw_fd()).unwrap();
    thread.remove(wr).unwrap();
    assert_eq!(thread.available_capacity(), 10);
    assert_eq!(thread.pipe_fd_count(), INTERNAL_PIPE_FDS);
    assert_eq!(thread.poll_fd_count(), 2);

    // The socket is still ours and still open
    (&sock).write_all(b"still open").unwrap();
}

#[test]
fn test_enqueue_delivers_exactly_once() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_send", 4, 0).unwrap();
    let (sock, mut peer) = UnixStream::pair().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();

    let fd = thread
        .add(
            Registration::socket(sock.as_raw_fd())
                .interest(Interest::Writable)
                .on_writable(move |ev, out| {
                    c.fetch_add(1, Ordering::SeqCst);
                    let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
                    s.write_all(&out.payload)?;
                    Ok(Action::Keep)
                }),
        )
        .unwrap();

    thread
        .enqueue_send(fd, Bytes::from_static(b"hello 1..2..3"))
        .unwrap();

    peer.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
    let mut buf = [0u8; 13];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello 1..2..3");

    // Nothing more arrives: the socket stays writable but POLLOUT is no
    // longer armed once the queue is empty.
    std::thread::sleep(Duration::from_millis(100));
    peer.set_nonblocking(true).unwrap();
    let mut extra = [0u8; 8];
    match peer.read(&mut extra) {
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    thread.remove(fd).unwrap();
}

#[test]
fn test_enqueue_on_pipe_runs_writable_directly() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_pipe", 4, 2).unwrap();
    let (tx, rx) = mpsc::channel();

    let wr = thread
        .add(
            Registration::pipe()
                .interest(Interest::Both)
                .on_writable(|ev, out| {
                    assert_eq!(ev.kind, FdKind::Pipe);
                    let mut w = ManuallyDrop::new(unsafe { File::from_raw_fd(ev.fd) });
                    w.write_all(&out.payload)?;
                    Ok(Action::Keep)
                })
                .on_readable(move |ev| {
                    let mut r = ManuallyDrop::new(unsafe { File::from_raw_fd(ev.fd) });
                    let mut buf = [0u8; 64];
                    let n = r.read(&mut buf)?;
                    tx.send(buf[..n].to_vec()).unwrap();
                    Ok(Action::Keep)
                }),
        )
        .unwrap();

    thread.enqueue_send(wr, Outbound::new(&b"ping"[..])).unwrap();
    assert_eq!(rx.recv_timeout(TEST_TIMEOUT).unwrap(), b"ping");

    thread.remove(wr).unwrap();
}

#[test]
fn test_failing_callback_keeps_descriptor() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_err", 4, 0).unwrap();
    let (sock, mut peer) = UnixStream::pair().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();

    thread
        .add(
            Registration::socket(sock.as_raw_fd()).on_readable(move |ev| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                // drain so the descriptor is not immediately readable again
                let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
                let mut buf = [0u8; 16];
                let _ = s.read(&mut buf)?;
                match n {
                    0 => Err(Error::InvalidArgument("first read fails")),
                    1 => panic!("second read panics"),
                    _ => Ok(Action::Keep),
                }
            }),
        )
        .unwrap();

    for i in 1..=3 {
        peer.write_all(b"x").unwrap();
        assert!(wait_until(TEST_TIMEOUT, || calls.load(Ordering::SeqCst) == i));
    }
    assert!(thread.is_running());
    assert_eq!(thread.socket_count(), 1);
}

#[test]
fn test_remove_action_and_hangup() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_hup", 4, 0).unwrap();
    let (sock, peer) = UnixStream::pair().unwrap();
    let (tx, rx) = mpsc::channel();

    thread
        .add(Registration::socket(sock.as_raw_fd()).on_readable(move |ev| {
            let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
            let mut buf = [0u8; 16];
            let n = s.read(&mut buf)?;
            tx.send((n, ev.hangup)).unwrap();
            Ok(if n == 0 { Action::Remove } else { Action::Keep })
        }))
        .unwrap();

    drop(peer);
    let (n, _hangup) = rx.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(n, 0);
    assert!(wait_until(TEST_TIMEOUT, || thread.socket_count() == 0));
    assert!(matches!(
        thread.remove(sock.as_raw_fd()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_add_from_inside_callback() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_nested", 4, 0).unwrap();
    let (trigger, mut trigger_peer) = UnixStream::pair().unwrap();
    let (inner, mut inner_peer) = UnixStream::pair().unwrap();
    let inner_fd = inner.as_raw_fd();
    let (tx, rx) = mpsc::channel();

    let t = thread.clone();
    let mut added = false;
    thread
        .add(Registration::socket(trigger.as_raw_fd()).on_readable(move |ev| {
            let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
            let mut buf = [0u8; 16];
            let _ = s.read(&mut buf)?;
            if !added {
                assert!(t.is_current());
                let tx = tx.clone();
                t.add(Registration::socket(inner_fd).on_readable(move |ev| {
                    let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
                    let mut buf = [0u8; 16];
                    let n = s.read(&mut buf)?;
                    tx.send(buf[..n].to_vec()).unwrap();
                    Ok(Action::Keep)
                }))?;
                added = true;
            }
            Ok(Action::Keep)
        }))
        .unwrap();

    trigger_peer.write_all(b"go").unwrap();
    assert!(wait_until(TEST_TIMEOUT, || thread.socket_count() == 2));
    inner_peer.write_all(b"nested").unwrap();
    assert_eq!(rx.recv_timeout(TEST_TIMEOUT).unwrap(), b"nested");

    // the trigger callback holds a handle to its own thread
    thread.shutdown();
}

#[test]
fn test_removed_descriptor_no_longer_dispatched() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_gone", 4, 0).unwrap();
    let (sock, mut peer) = UnixStream::pair().unwrap();
    sock.set_nonblocking(true).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();

    let fd = thread
        .add(
            Registration::socket(sock.as_raw_fd()).on_readable(move |ev| {
                c.fetch_add(1, Ordering::SeqCst);
                let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
                let mut buf = [0u8; 64];
                let _ = s.read(&mut buf);
                Ok(Action::Keep)
            }),
        )
        .unwrap();

    peer.write_all(b"first").unwrap();
    assert!(wait_until(TEST_TIMEOUT, || calls.load(Ordering::SeqCst) == 1));

    thread.remove(fd).unwrap();
    peer.write_all(b"second").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_partial_write_keeps_rest_queued() {
    init_tracing();
    let thread = PollThread::spawn("thread_tc_partial", 4, 0).unwrap();
    let (sock, mut peer) = UnixStream::pair().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<Bytes>::new()));
    let s2 = seen.clone();

    let fd = thread
        .add(
            Registration::socket(sock.as_raw_fd())
                .interest(Interest::Writable)
                .on_writable(move |ev, out| {
                    let first = s2.lock().unwrap().is_empty();
                    s2.lock().unwrap().push(out.payload.clone());
                    let mut s = ManuallyDrop::new(unsafe { UnixStream::from_raw_fd(ev.fd) });
                    if first {
                        // pretend the socket only took three bytes
                        s.write_all(&out.payload[..3])?;
                        return Ok(Action::Partial(3));
                    }
                    s.write_all(&out.payload)?;
                    Ok(Action::Keep)
                }),
        )
        .unwrap();

    thread
        .enqueue_send(fd, Bytes::from_static(b"hello world"))
        .unwrap();
    thread.enqueue_send(fd, Bytes::from_static(b"!")).unwrap();

    peer.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
    let mut got = [0u8; 12];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hello world!");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Bytes::from_static(b"hello world"),
            Bytes::from_static(b"lo world"),
            Bytes::from_static(b"!"),
        ]
    );
}
