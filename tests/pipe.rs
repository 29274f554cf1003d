mod common;

use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use fiber_uring::{RingConfig, RingEngine};

#[test]
fn pipe_echo() {
    let runtime = common::TestRuntime::new();
    let master = common::master(&runtime);
    let (read_end, write_end) = common::pipe();
    let (rfd, wfd) = (read_end.as_raw_fd(), write_end.as_raw_fd());

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());

    let engine = master.clone();
    group.spawn(move || {
        let mut buf = [0u8; 16];
        let n = engine
            .pread(rfd, &mut buf, 0, 0, Some(Duration::from_secs(1)))
            .expect("pread");
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    });

    let engine = master.clone();
    group.spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let n = engine
            .pwrite(wfd, b"hello", 0, 0, Some(Duration::from_secs(1)))
            .expect("pwrite");
        assert_eq!(n, 5);
    });

    group.run();
}

#[test]
fn pipe_echo_lazy_submit() {
    // No eager submit: SQEs ride along with the next master wait.
    let runtime = common::TestRuntime::new();
    let master = RingEngine::master(RingConfig::new(), runtime.clone()).expect("master engine");
    let (read_end, write_end) = common::pipe();
    let (rfd, wfd) = (read_end.as_raw_fd(), write_end.as_raw_fd());

    let mut group = common::FiberGroup::new(master.clone(), runtime.clone());

    let engine = master.clone();
    group.spawn(move || {
        let mut buf = [0u8; 8];
        let n = engine
            .pread(rfd, &mut buf, 0, 0, Some(Duration::from_secs(1)))
            .expect("pread");
        assert_eq!(&buf[..n], b"batch");
    });

    let engine = master.clone();
    group.spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let n = engine
            .pwrite(wfd, b"batch", 0, 0, Some(Duration::from_secs(1)))
            .expect("pwrite");
        assert_eq!(n, 5);
    });

    group.run();
}
