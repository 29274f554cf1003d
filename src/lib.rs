//! An io_uring event engine for cooperative fiber runtimes.
//!
//! The engine turns synchronous-looking I/O calls made by lightweight
//! cooperative threads ("fibers") into submission queue events on a shared
//! ring, parks the calling fiber, and resumes it when the matching
//! completion arrives. The same type fills two roles:
//!
//! - a **master** engine, one per vCPU, driving the scheduler's central
//!   wait through [`RingEngine::wait_and_fire_events`];
//! - a **cascading** engine, a satellite ring whose completions are
//!   signaled to the master through an eventfd and drained with
//!   [`RingEngine::wait_for_events`].
//!
//! The fiber scheduler itself is not part of this crate; it is consumed
//! through the [`FiberRuntime`] trait.
//!
//! Requires Linux 5.11 or newer.

mod ctx;
mod engine;
mod fiber;
mod interest;
mod io;
mod ops;
mod probe;
mod reap;
mod util;

pub use engine::{RingConfig, RingEngine, QUEUE_DEPTH, REGISTER_FILES_MAX_NUM};
pub use fiber::{FiberId, FiberRuntime, EOK};
pub use interest::{Event, Interests};
pub use probe::register_files_enabled;

/// Selects the registered-file table on the 64-bit `flags` argument of the
/// I/O wrappers: the `fd` argument is then interpreted as a slot of the
/// table installed by [`RingEngine::register_files`].
///
/// The low 32 bits of `flags` are forwarded to the opcode's own flag field;
/// the high 32 bits are OR'd into the SQE flags.
pub const FIXED_FILE: u64 = 1 << 32;
