//! Kernel capability probing.
//!
//! The decisions below depend only on the running kernel, so they are made
//! once per process (first writer wins) and shared by every engine.

use std::ffi::CStr;
use std::mem;
use std::sync::OnceLock;

use tracing::{info, warn};

static KERNEL: OnceLock<(u32, u32)> = OnceLock::new();
static MEMLOCK: OnceLock<()> = OnceLock::new();
static REGISTER_FILES: OnceLock<bool> = OnceLock::new();
static COOP_TASKRUN: OnceLock<bool> = OnceLock::new();
static SUBMIT_WAIT: OnceLock<SubmitWait> = OnceLock::new();

/// How the master wait combines batch submission with the CQE wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitWait {
    /// Single syscall: `submit_with_args` with an EXT_ARG timespec.
    /// There is a kernel bug in this path before 5.15.
    ExtArg,
    /// Push an own-timer SQE and `submit_and_wait(1)` unconditionally.
    TimerSqe,
}

fn kernel_release() -> (u32, u32) {
    *KERNEL.get_or_init(|| {
        let mut uts: libc::utsname = unsafe { mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return (0, 0);
        }
        let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
        parse_release(release.to_str().unwrap_or(""))
    })
}

/// Parse "major.minor" out of a kernel release string, tolerating vendor
/// suffixes like "5.15.0-91-generic".
fn parse_release(release: &str) -> (u32, u32) {
    let mut parts = release.split('.');
    let major = parts.next().map(leading_number).unwrap_or(0);
    let minor = parts.next().map(leading_number).unwrap_or(0);
    (major, minor)
}

fn leading_number(part: &str) -> u32 {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    kernel_release() >= (major, minor)
}

/// Kernels before 5.11 charge ring memory against `RLIMIT_MEMLOCK`.
pub(crate) fn raise_memlock_limit() {
    MEMLOCK.get_or_init(|| {
        if kernel_at_least(5, 11) {
            return;
        }
        let limit = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) } != 0 {
            warn!(
                "failed to raise RLIMIT_MEMLOCK; \
                 use `ulimit -l unlimited` or run as root"
            );
        }
    });
}

/// Whether fixed-file registration is in use (kernel 5.5+).
pub fn register_files_enabled() -> bool {
    *REGISTER_FILES.get_or_init(|| {
        let enabled = kernel_at_least(5, 5);
        if enabled {
            info!("io_uring: register_files is enabled");
        }
        enabled
    })
}

/// Whether to ask for `IORING_SETUP_COOP_TASKRUN` (kernel 5.19+).
pub(crate) fn coop_taskrun_enabled() -> bool {
    *COOP_TASKRUN.get_or_init(|| kernel_at_least(5, 19))
}

pub(crate) fn submit_wait_strategy() -> SubmitWait {
    *SUBMIT_WAIT.get_or_init(|| {
        if kernel_at_least(5, 15) {
            SubmitWait::ExtArg
        } else {
            SubmitWait::TimerSqe
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_parsing() {
        assert_eq!(parse_release("5.15.0-91-generic"), (5, 15));
        assert_eq!(parse_release("6.8.0"), (6, 8));
        assert_eq!(parse_release("4.19.256-rt113"), (4, 19));
        assert_eq!(parse_release("5.10"), (5, 10));
        assert_eq!(parse_release("garbage"), (0, 0));
        assert_eq!(parse_release(""), (0, 0));
    }

    #[test]
    fn threshold_compare() {
        assert!((5, 15) >= (5, 15));
        assert!((6, 1) >= (5, 19));
        assert!(!((5, 4) >= (5, 5)));
        assert!((5, 11) > (5, 5));
    }
}
