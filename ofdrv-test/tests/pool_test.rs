use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use ofdrv::Error;
use ofdrv::pollthr::{PollThread, Registration};
use ofdrv::pool::PollThreadPool;
use ofdrv_test::util::init_tracing;

#[test]
fn test_place_on_first_thread_with_room() {
    init_tracing();
    let pool = PollThreadPool::new("rwthr", 8, 1);

    // B is adopted first, then A, so the order is A, B
    let b = PollThread::spawn("thread_b", 5, 1).unwrap();
    let a = PollThread::spawn("thread_a", 1, 1).unwrap();
    pool.adopt(b.clone());
    pool.adopt(a.clone());
    assert_eq!(pool.len(), 2);

    let pairs: Vec<_> = (0..3).map(|_| UnixStream::pair().unwrap()).collect();

    let (first, _) = pool.place(Registration::socket(pairs[0].0.as_raw_fd())).unwrap();
    assert!(Arc::ptr_eq(&first, &a));
    assert_eq!(a.available_capacity(), 0);
    assert_eq!(b.available_capacity(), 5);

    // A is full, so B takes the next two
    for (sock, _) in &pairs[1..] {
        let (thread, fd) = pool.place(Registration::socket(sock.as_raw_fd())).unwrap();
        assert!(Arc::ptr_eq(&thread, &b));
        assert_eq!(fd, sock.as_raw_fd());
    }
    assert_eq!(b.available_capacity(), 3);
    assert_eq!(pool.len(), 2);

    // Freeing a slot on A makes it first choice again
    a.remove(pairs[0].0.as_raw_fd()).unwrap();
    let (again, _) = pool.place(Registration::socket(pairs[0].0.as_raw_fd())).unwrap();
    assert!(Arc::ptr_eq(&again, &a));

    pool.shutdown();
}

#[test]
fn test_try_place_never_grows() {
    init_tracing();
    let pool = PollThreadPool::new("rwthr_try", 1, 0);
    let (s1, _p1) = UnixStream::pair().unwrap();
    let (s2, _p2) = UnixStream::pair().unwrap();

    assert!(matches!(
        pool.try_place(Registration::socket(s1.as_raw_fd())),
        Err(Error::CapacityExhausted)
    ));
    assert!(pool.is_empty());

    let (t1, _) = pool.place(Registration::socket(s1.as_raw_fd())).unwrap();
    assert_eq!(t1.name(), "rwthr_try_1");
    assert!(matches!(
        pool.try_place(Registration::socket(s2.as_raw_fd())),
        Err(Error::CapacityExhausted)
    ));

    // place grows the pool and the new thread goes first
    let (t2, _) = pool.place(Registration::socket(s2.as_raw_fd())).unwrap();
    assert_eq!(t2.name(), "rwthr_try_2");
    assert_eq!(pool.threads()[0].name(), "rwthr_try_2");
    assert_eq!(pool.threads()[1].name(), "rwthr_try_1");

    pool.shutdown();
}

#[test]
fn test_concurrent_reserve_grows_once() {
    init_tracing();
    let pool = Arc::new(PollThreadPool::new("rwthr_race", 4, 0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || pool.reserve().map(|r| r.thread().name().to_string()))
        })
        .collect();
    // Reservations are dropped inside each thread, but all four fit on one
    // thread regardless of interleaving.
    for h in handles {
        assert!(h.join().unwrap().is_ok());
    }
    assert_eq!(pool.len(), 1);
    pool.shutdown();
}
