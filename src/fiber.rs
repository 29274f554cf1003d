//! Interface to the cooperative fiber scheduler.
//!
//! The engine never schedules fibers itself; it only needs to know who is
//! running, how to park it, and how to wake it with an errno-style code.

/// Opaque identity of a fiber, assigned by the runtime.
pub type FiberId = u64;

/// The wake-up code delivered by the reaper. Any other code means the fiber
/// was interrupted externally while it was parked.
pub const EOK: i32 = 0;

/// The scheduler primitives consumed by the engine.
///
/// A production runtime is single-threaded cooperative per vCPU: the reaper
/// only ever runs while every fiber of that vCPU is parked. An
/// [`interrupt`](FiberRuntime::interrupt) aimed at a fiber that is not
/// parked may be dropped or latched onto its next park; the engine's wait
/// loops re-check their completion state and tolerate both.
pub trait FiberRuntime: Send + Sync {
    /// Identity of the calling fiber.
    fn current(&self) -> FiberId;

    /// Park the calling fiber indefinitely. Returns the code passed to
    /// [`interrupt`](FiberRuntime::interrupt): [`EOK`] when woken by the
    /// reaper, the interrupt's errno otherwise.
    fn park(&self) -> i32;

    /// Wake `fiber` with `code`. Called by the reaper with [`EOK`] and by
    /// user code with a non-zero errno to interrupt a pending operation.
    fn interrupt(&self, fiber: FiberId, code: i32);

    /// Keep the calling fiber's work from being stolen to another vCPU
    /// while it is suspended inside a syscall. NOP on single-vCPU runtimes.
    fn pause_work_stealing(&self) {}

    /// Undo [`pause_work_stealing`](FiberRuntime::pause_work_stealing).
    fn resume_work_stealing(&self) {}
}

/// Scoped pause of work stealing around a park.
pub(crate) struct StealPause<'a>(&'a dyn FiberRuntime);

impl<'a> StealPause<'a> {
    pub(crate) fn new(runtime: &'a dyn FiberRuntime) -> Self {
        runtime.pause_work_stealing();
        StealPause(runtime)
    }
}

impl Drop for StealPause<'_> {
    fn drop(&mut self) {
        self.0.resume_work_stealing();
    }
}
