//! The per-opcode wrappers: thin dispatchers over the coordinator with
//! POSIX-shaped signatures.
//!
//! Every wrapper takes the 64-bit `flags` word: the low 32 bits go to the
//! opcode's own flag field, the high 32 bits are SQE flags, of which
//! [`FIXED_FILE`](crate::FIXED_FILE) reinterprets `fd` as a slot of the
//! registered-file table.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{opcode, types};

use crate::engine::RingEngine;

fn split_flags(flags: u64) -> (u32, u32) {
    (flags as u32, (flags >> 32) as u32)
}

/// Build an opcode against either a plain fd or a fixed-file slot,
/// depending on the `IOSQE_FIXED_FILE` bit of the ring flags.
macro_rules! prep {
    ($ring_flags:expr, $fd:expr, |$target:ident| $build:expr) => {
        if $ring_flags & 1 != 0 {
            let $target = types::Fixed($fd as u32);
            $build
        } else {
            let $target = types::Fd($fd);
            $build
        }
    };
}

impl RingEngine {
    /// Read from `fd` at `offset` (-1 for the current position), like
    /// `pread(2)`.
    pub fn pread(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        offset: i64,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (_, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Read::new(
            t,
            buf.as_mut_ptr(),
            buf.len() as u32
        )
        .offset(offset as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// Write to `fd` at `offset` (-1 for the current position), like
    /// `pwrite(2)`.
    pub fn pwrite(
        &self,
        fd: RawFd,
        buf: &[u8],
        offset: i64,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (_, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Write::new(
            t,
            buf.as_ptr(),
            buf.len() as u32
        )
        .offset(offset as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// Vectored read, like `preadv(2)`.
    ///
    /// # Safety
    ///
    /// The buffers the iovecs point at must stay valid for the whole
    /// operation.
    pub unsafe fn preadv(
        &self,
        fd: RawFd,
        iov: &[libc::iovec],
        offset: i64,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (_, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Readv::new(
            t,
            iov.as_ptr(),
            iov.len() as u32
        )
        .offset(offset as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// Vectored write, like `pwritev(2)`.
    ///
    /// # Safety
    ///
    /// The buffers the iovecs point at must stay valid for the whole
    /// operation.
    pub unsafe fn pwritev(
        &self,
        fd: RawFd,
        iov: &[libc::iovec],
        offset: i64,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (_, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Writev::new(
            t,
            iov.as_ptr(),
            iov.len() as u32
        )
        .offset(offset as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// Move data between two fds, like `splice(2)`. Offsets of -1 mean the
    /// current position.
    pub fn splice(
        &self,
        fd_in: RawFd,
        off_in: i64,
        fd_out: RawFd,
        off_out: i64,
        nbytes: u32,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (splice_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd_out, |t| opcode::Splice::new(
            types::Fd(fd_in),
            off_in,
            t,
            off_out,
            nbytes
        )
        .flags(splice_flags as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    pub fn send(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Send::new(
            t,
            buf.as_ptr(),
            buf.len() as u32
        )
        .flags(io_flags as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// Zero-copy send. The fiber resumes once the kernel is done with the
    /// buffer (the notification completion), so the borrow is safe.
    pub fn send_zc(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::SendZc::new(
            t,
            buf.as_ptr(),
            buf.len() as u32
        )
        .flags(io_flags as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// # Safety
    ///
    /// Everything `msg` points at must stay valid for the whole operation.
    pub unsafe fn sendmsg(
        &self,
        fd: RawFd,
        msg: &libc::msghdr,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::SendMsg::new(t, msg)
            .flags(io_flags as _)
            .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// # Safety
    ///
    /// Everything `msg` points at must stay valid for the whole operation.
    pub unsafe fn sendmsg_zc(
        &self,
        fd: RawFd,
        msg: &libc::msghdr,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::SendMsgZc::new(t, msg)
            .flags(io_flags as _)
            .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    pub fn recv(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::Recv::new(
            t,
            buf.as_mut_ptr(),
            buf.len() as u32
        )
        .flags(io_flags as _)
        .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// # Safety
    ///
    /// Everything `msg` points at must stay valid for the whole operation.
    pub unsafe fn recvmsg(
        &self,
        fd: RawFd,
        msg: &mut libc::msghdr,
        flags: u64,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let (io_flags, ring_flags) = split_flags(flags);
        let entry = prep!(ring_flags, fd, |t| opcode::RecvMsg::new(t, msg)
            .flags(io_flags as _)
            .build());
        self.async_io(entry, ring_flags, timeout).map(|n| n as usize)
    }

    /// # Safety
    ///
    /// `addr` must point at a valid socket address of `addrlen` bytes that
    /// outlives the operation.
    pub unsafe fn connect(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let entry = opcode::Connect::new(types::Fd(fd), addr, addrlen).build();
        self.async_io(entry, 0, timeout).map(drop)
    }

    /// Accept a connection; returns the new fd. `addr`/`addrlen` may be
    /// null.
    ///
    /// # Safety
    ///
    /// Non-null `addr`/`addrlen` must stay valid for the whole operation.
    pub unsafe fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        timeout: Option<Duration>,
    ) -> io::Result<RawFd> {
        let entry = opcode::Accept::new(types::Fd(fd), addr, addrlen).build();
        self.async_io(entry, 0, timeout)
    }

    pub fn fsync(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        let entry = opcode::Fsync::new(types::Fd(fd)).build();
        self.async_io(entry, 0, timeout).map(drop)
    }

    pub fn fdatasync(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        let entry = opcode::Fsync::new(types::Fd(fd))
            .flags(types::FsyncFlags::DATASYNC)
            .build();
        self.async_io(entry, 0, timeout).map(drop)
    }

    /// Open `path` relative to the current working directory, like
    /// `open(2)`.
    pub fn open(
        &self,
        path: &CStr,
        flags: i32,
        mode: libc::mode_t,
        timeout: Option<Duration>,
    ) -> io::Result<RawFd> {
        let entry = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
            .flags(flags)
            .mode(mode)
            .build();
        self.async_io(entry, 0, timeout)
    }

    /// Create a directory, like `mkdir(2)`.
    pub fn mkdir(
        &self,
        path: &CStr,
        mode: libc::mode_t,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let entry = opcode::MkDirAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
            .mode(mode)
            .build();
        self.async_io(entry, 0, timeout).map(drop)
    }

    pub fn close(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        self.async_io(entry, 0, timeout).map(drop)
    }
}
