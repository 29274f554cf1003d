//! A minimal cooperative fiber runtime for exercising the engine: each
//! fiber is a thread, parked on a condvar; the test's main thread plays
//! the scheduler and drives the master engine's wait loop.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fiber_uring::{FiberId, FiberRuntime, RingConfig, RingEngine};

thread_local! {
    static CURRENT: Cell<FiberId> = const { Cell::new(0) };
}

static NEXT_FIBER: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct FiberSlot {
    pending: Option<i32>,
}

/// Thread-backed fiber runtime. Interrupts latch until the target's next
/// park, which the engine's wait loops are written to tolerate.
#[derive(Default)]
pub struct TestRuntime {
    slots: Mutex<HashMap<FiberId, FiberSlot>>,
    wake: Condvar,
}

impl TestRuntime {
    pub fn new() -> Arc<TestRuntime> {
        Arc::new(TestRuntime::default())
    }
}

impl FiberRuntime for TestRuntime {
    fn current(&self) -> FiberId {
        CURRENT.with(|c| c.get())
    }

    fn park(&self) -> i32 {
        let id = self.current();
        let mut slots = self.slots.lock().unwrap();
        loop {
            if let Some(code) = slots.get_mut(&id).and_then(|slot| slot.pending.take()) {
                return code;
            }
            slots = self.wake.wait(slots).unwrap();
        }
    }

    fn interrupt(&self, fiber: FiberId, code: i32) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(fiber).or_default().pending = Some(code);
        self.wake.notify_all();
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns fibers and drives the master engine until all of them finish.
pub struct FiberGroup {
    runtime: Arc<TestRuntime>,
    master: Arc<RingEngine>,
    live: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl FiberGroup {
    pub fn new(master: Arc<RingEngine>, runtime: Arc<TestRuntime>) -> FiberGroup {
        FiberGroup {
            runtime,
            master,
            live: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, f: F) -> FiberId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_FIBER.fetch_add(1, Ordering::SeqCst);
        self.runtime
            .slots
            .lock()
            .unwrap()
            .insert(id, FiberSlot::default());
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        self.handles.push(thread::spawn(move || {
            let _guard = guard;
            CURRENT.with(|c| c.set(id));
            f();
        }));
        id
    }

    /// Run the scheduler loop: reap and resume until every fiber is done.
    pub fn run(mut self) {
        while self.live.load(Ordering::SeqCst) > 0 {
            self.master
                .wait_and_fire_events(Some(Duration::from_millis(5)))
                .expect("wait_and_fire_events");
        }
        for handle in self.handles.drain(..) {
            handle.join().expect("fiber panicked");
        }
    }
}

pub fn eager_config() -> RingConfig {
    let mut config = RingConfig::new();
    config.eager_submit();
    config
}

pub fn master(runtime: &Arc<TestRuntime>) -> Arc<RingEngine> {
    RingEngine::master(eager_config(), runtime.clone()).expect("master engine")
}

pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    assert!(fd >= 0);
    unsafe { OwnedFd::from_raw_fd(fd) }
}

pub fn eventfd_write(fd: &OwnedFd, value: u64) {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    assert_eq!(n, 8);
}
