//! Persistent fd interests and their poll-mask translation.

use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use io_uring::{opcode, types};
use tracing::error;

use crate::ctx::{CqeTag, EventCtx};
use crate::engine::RingEngine;

bitflags! {
    /// Readiness the caller wants to be notified about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interests: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        /// Deliver a single event, then drop the interest.
        const ONE_SHOT = 1 << 30;
    }
}

/// A registered interest: fd, event mask, and an opaque token handed back
/// by [`wait_for_events`](crate::RingEngine::wait_for_events).
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub interests: Interests,
    pub data: u64,
}

/// Registry key. Two interests on the same fd are distinct as long as their
/// translated poll masks differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FdInterest {
    pub(crate) fd: RawFd,
    pub(crate) mask: u32,
}

impl FdInterest {
    pub(crate) fn of(event: &Event) -> FdInterest {
        FdInterest {
            fd: event.fd,
            mask: poll_mask(event.interests),
        }
    }
}

/// Translate an interest mask into poll(2) events. `POLLERR` is always
/// watched; poll reports it regardless of the requested set.
pub(crate) fn poll_mask(interests: Interests) -> u32 {
    let mut mask = libc::POLLERR as u32;
    if interests.contains(Interests::READ) {
        mask |= (libc::POLLIN | libc::POLLRDHUP) as u32;
    }
    if interests.contains(Interests::WRITE) {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

impl RingEngine {
    /// Register a persistent interest. A multishot poll keeps delivering
    /// until removed; `ONE_SHOT` delivers once and evicts itself. Fails
    /// with `EEXIST` when the `(fd, mask)` pair is already registered.
    pub fn add_interest(&self, event: Event) -> io::Result<()> {
        let one_shot = event.interests.contains(Interests::ONE_SHOT);
        let key = FdInterest::of(&event);

        let mut state = self.state().lock();
        if state.interests.contains_key(&key) {
            error!(fd = event.fd, "interest has already been added");
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        let op_key = state.ops.insert_event(EventCtx { event, one_shot });
        let poll = opcode::PollAdd::new(types::Fd(event.fd), key.mask)
            .multi(!one_shot)
            .build()
            .user_data(CqeTag::Event(op_key).encode());
        if let Err(err) = self.push(&mut state, &[poll]) {
            state.ops.remove(op_key);
            return Err(err);
        }
        state.interests.insert(key, op_key);
        drop(state);

        self.try_submit()
    }

    /// Remove a registered interest. Fails with `ENOENT` when the interest
    /// was never added or was already consumed by a one-shot firing. The
    /// registry entry itself is evicted when the poll's cancellation
    /// completion is reaped.
    pub fn rm_interest(&self, event: Event) -> io::Result<()> {
        let key = FdInterest::of(&event);

        let mut state = self.state().lock();
        let Some(&op_key) = state.interests.get(&key) else {
            error!(fd = event.fd, "interest is non-existent or one-shot finished");
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };

        // Nobody waits on the removal itself; its completion carries the
        // null tag.
        let remove = opcode::PollRemove::new(CqeTag::Event(op_key).encode())
            .build()
            .user_data(CqeTag::OwnTimer.encode());
        self.push(&mut state, &[remove])?;
        drop(state);

        self.try_submit()
    }
}
