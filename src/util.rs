use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use io_uring::types;

/// Timeouts travel as microseconds; `None` is clamped to the largest
/// representable interval, like the original engine's infinite wait.
pub(crate) fn timespec(timeout: Option<Duration>) -> types::Timespec {
    let usec = timeout
        .map(|t| t.as_micros().min(i64::MAX as u128) as u64)
        .unwrap_or(i64::MAX as u64);
    let (sec, nsec) = usec_to_parts(usec);
    types::Timespec::new().sec(sec).nsec(nsec)
}

fn usec_to_parts(usec: u64) -> (u64, u32) {
    (usec / 1_000_000, ((usec % 1_000_000) * 1000) as u32)
}

pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn eventfd_write(fd: RawFd, value: u64) -> io::Result<()> {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n != buf.len() as isize {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reset the eventfd counter. The fd is non-blocking; an empty counter is
/// not an error.
pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut value = mem::MaybeUninit::<u64>::uninit();
    unsafe {
        libc::read(fd, value.as_mut_ptr().cast(), mem::size_of::<u64>());
    }
}
