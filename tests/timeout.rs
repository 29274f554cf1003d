mod common;

use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn recv_times_out() {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);
    let (a, _b) = common::socketpair();
    let afd = a.as_raw_fd();

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());

    let engine = master.clone();
    group.spawn(move || {
        let mut buf = [0u8; 8];
        let start = Instant::now();
        let err = engine
            .recv(afd, &mut buf, 0, Some(Duration::from_millis(50)))
            .expect_err("recv on a silent socket");
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "fired late: {elapsed:?}");
    });

    group.run();
}

#[test]
fn zero_timeout_is_immediate_cancel() {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);
    let (a, _b) = common::socketpair();
    let afd = a.as_raw_fd();

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());

    let engine = master.clone();
    group.spawn(move || {
        let mut buf = [0u8; 8];
        let err = engine
            .recv(afd, &mut buf, 0, Some(Duration::ZERO))
            .expect_err("zero timeout");
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    });

    group.run();
}

#[test]
fn infinite_timeout_completes() {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);
    let (a, b) = common::socketpair();
    let (afd, bfd) = (a.as_raw_fd(), b.as_raw_fd());

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());

    let engine = master.clone();
    group.spawn(move || {
        let mut buf = [0u8; 8];
        // No linked timeout at all on this path.
        let n = engine.recv(afd, &mut buf, 0, None).expect("recv");
        assert_eq!(&buf[..n], b"ping");
    });

    let engine = master.clone();
    group.spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let n = engine
            .send(bfd, b"ping", 0, Some(Duration::from_secs(1)))
            .expect("send");
        assert_eq!(n, 4);
    });

    group.run();
}
